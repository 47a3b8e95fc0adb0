use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use mole_relay::config::RelayConfig;
use mole_relay::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mole-relay")]
#[command(version)]
#[command(about = "Public relay that exposes Mole tunnels on subdomains", long_about = None)]
struct Cli {
    /// Config file (defaults to ./config.json when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Base domain
    #[arg(short, long)]
    domain: Option<String>,

    /// SSL certificate file
    #[arg(long)]
    cert: Option<PathBuf>,

    /// SSL key file
    #[arg(long)]
    key: Option<PathBuf>,

    /// Serve HTTPS
    #[arg(long)]
    https: bool,

    /// Seconds to wait for a tunnel response
    #[arg(long)]
    request_timeout: Option<u64>,
}

impl Cli {
    fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        if let Some(cert) = &self.cert {
            config.cert_file = Some(cert.clone());
        }
        if let Some(key) = &self.key {
            config.key_file = Some(key.clone());
        }
        if self.https {
            config.use_https = true;
        }
        if let Some(secs) = self.request_timeout {
            config.request_timeout_secs = secs;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mole_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli
        .apply(RelayConfig::load_or_default(cli.config.as_deref())?)
        .validated()?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = mole_relay::app(AppState::new(config.clone()))
        .into_make_service_with_connect_info::<SocketAddr>();

    info!("Mole Relay on {} (domain: {})", addr, config.domain);

    match config.tls_files() {
        Some((cert, key)) if config.use_https => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("Failed to load TLS certificate")?;
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });
            info!("Serving HTTPS");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app)
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Serving HTTP");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    mole_shared::shutdown::signal().await;
    info!("Shutting down...");
}
