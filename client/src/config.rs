//! Configuration file parser for Mole
//!
//! Reads `mole.yml` from the working or home directory. Command-line flags
//! override anything set here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay address as `host:port`
    #[serde(default = "default_server")]
    pub server: String,

    /// Subdomain to register
    pub subdomain: Option<String>,

    /// Connect with `wss://`
    #[serde(default)]
    pub use_https: bool,

    /// Local hostname to forward to
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Timeout for each request to the local service
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,

    /// Reconnect with backoff when the relay connection drops
    #[serde(default)]
    pub reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            subdomain: None,
            use_https: false,
            local_host: default_host(),
            request_timeout_secs: default_timeout(),
            reconnect: false,
        }
    }
}

fn default_server() -> String {
    "localhost:3000".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load `path` if given, else the first config file found, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(Self::find_config) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            anyhow::bail!("Server address cannot be empty");
        }
        if self.server.contains("://") {
            anyhow::bail!("Server address must be host:port, without a scheme");
        }
        if self.local_host.trim().is_empty() {
            anyhow::bail!("Local host cannot be empty");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be at least one second");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["mole.yml", "mole.yaml", ".mole.yml", ".mole.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
server: tunnel.example.com:443
subdomain: my-api
use_https: true
reconnect: true
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server, "tunnel.example.com:443");
        assert_eq!(config.subdomain.as_deref(), Some("my-api"));
        assert!(config.use_https);
        assert!(config.reconnect);
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ClientConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server, "localhost:3000");
        assert!(config.subdomain.is_none());
        assert!(!config.reconnect);
    }

    #[test]
    fn test_server_with_scheme_rejected() {
        let config = ClientConfig {
            server: "ws://relay:3000".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
