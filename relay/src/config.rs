//! Relay configuration
//!
//! Read from `config.json` (or an explicit path) and then overridden by
//! command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mole_shared::protocol::MAX_BODY_SIZE;
use serde::{Deserialize, Serialize};

/// Config file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Port for both public traffic and tunnel connections
    pub port: u16,

    /// Base domain; tunnels are served at `<subdomain>.<domain>`
    pub domain: String,

    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,

    /// Serve HTTPS using `cert_file` / `key_file`
    pub use_https: bool,

    /// How long a public request waits for its tunnel response
    pub request_timeout_secs: u64,

    /// Largest inbound body buffered for forwarding
    pub max_body_size: usize,

    /// Interval between keepalive pings on tunnel connections
    pub heartbeat_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            domain: "localhost".to_string(),
            cert_file: None,
            key_file: None,
            use_https: false,
            request_timeout_secs: 30,
            max_body_size: MAX_BODY_SIZE,
            heartbeat_interval_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load `path` if given, else `config.json` if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Normalise the domain and check the settings fit together.
    pub fn validated(mut self) -> Result<Self> {
        self.domain = self.domain.trim().trim_matches('.').to_ascii_lowercase();
        if self.domain.is_empty() {
            anyhow::bail!("Domain cannot be empty");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be at least one second");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least one second");
        }
        if self.use_https && self.tls_files().is_none() {
            anyhow::bail!("HTTPS requires both cert_file and key_file");
        }
        Ok(self)
    }

    /// Certificate and key paths, when both are set
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
            path.as_deref().filter(|p| !p.as_os_str().is_empty())
        }
        Some((non_empty(&self.cert_file)?, non_empty(&self.key_file)?))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_https {
            "https"
        } else {
            "http"
        }
    }

    /// Public URL of a tunnel, omitting the port when it is the scheme default
    pub fn public_url(&self, subdomain: &str) -> String {
        let default_port = if self.use_https { 443 } else { 80 };
        if self.port == default_port {
            format!("{}://{}.{}", self.scheme(), subdomain, self.domain)
        } else {
            format!("{}://{}.{}:{}", self.scheme(), subdomain, self.domain, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let json = r#"{"port": 8080, "domain": "Tunnels.Example.com.", "use_https": false}"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        let config = config.validated().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.domain, "tunnels.example.com");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_body_size, MAX_BODY_SIZE);
    }

    #[test]
    fn test_https_requires_cert_and_key() {
        let config = RelayConfig {
            use_https: true,
            cert_file: Some("cert.pem".into()),
            ..Default::default()
        };
        assert!(config.validated().is_err());

        let config = RelayConfig {
            use_https: true,
            cert_file: Some("cert.pem".into()),
            key_file: Some("".into()),
            ..Default::default()
        };
        assert!(config.validated().is_err());

        let config = RelayConfig {
            use_https: true,
            cert_file: Some("cert.pem".into()),
            key_file: Some("key.pem".into()),
            ..Default::default()
        };
        assert!(config.validated().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = RelayConfig {
            request_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_public_url() {
        let mut config = RelayConfig {
            domain: "example.com".into(),
            port: 80,
            ..Default::default()
        };
        assert_eq!(config.public_url("demo"), "http://demo.example.com");

        config.port = 3000;
        assert_eq!(config.public_url("demo"), "http://demo.example.com:3000");

        config.use_https = true;
        config.port = 443;
        assert_eq!(config.public_url("demo"), "https://demo.example.com");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(RelayConfig::load(Path::new("/nonexistent/mole/config.json")).is_err());
    }
}
