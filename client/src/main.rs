use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mole::config::ClientConfig;
use mole::proxy::HttpForwarder;
use mole::reconnect::ReconnectPolicy;
use mole::tunnel::{self, TunnelSession};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mole")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a Mole relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay address (host:port)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Config file (defaults to mole.yml in the working or home directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Connect to the relay over TLS
    #[arg(long, global = true)]
    https: bool,

    /// Reconnect with backoff when the relay connection drops
    #[arg(long, global = true)]
    reconnect: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Subdomain to serve
        #[arg(short = 'd', long)]
        subdomain: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "mole=debug" } else { "mole=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = ClientConfig::load_or_default(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if cli.https {
        config.use_https = true;
    }
    if cli.reconnect {
        config.reconnect = true;
    }
    config.validate()?;

    match cli.command {
        Commands::Http { port, subdomain } => {
            let subdomain = subdomain
                .or_else(|| config.subdomain.clone())
                .context("subdomain is required (set it in mole.yml or use -d)")?;
            let forwarder = Arc::new(HttpForwarder::new(
                &config.local_host,
                port,
                config.request_timeout(),
            )?);

            tokio::select! {
                res = run_http_tunnel(&config, &subdomain, forwarder) => res?,
                _ = mole_shared::shutdown::signal() => info!("Shutting down..."),
            }
        }
    }

    Ok(())
}

/// Keep the tunnel up: one session, or reconnecting ones when enabled.
async fn run_http_tunnel(config: &ClientConfig, subdomain: &str, forwarder: Arc<HttpForwarder>) -> Result<()> {
    let url = tunnel::tunnel_url(&config.server, config.use_https);
    let mut policy = ReconnectPolicy::new(config.reconnect);

    loop {
        let err = match tunnel::connect(&url, subdomain).await {
            Ok(session) => {
                policy.connected();
                print_banner(&session, forwarder.as_ref());
                match session.run(Arc::clone(&forwarder)).await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        let Some(delay) = policy.retry_after(&err) else {
            return Err(err).context("Tunnel failed");
        };

        warn!("Tunnel error: {}. Reconnecting in {:.1?}...", err, delay);
        tokio::time::sleep(delay).await;
    }
}

fn print_banner(session: &TunnelSession, forwarder: &HttpForwarder) {
    let public = session.public_url().unwrap_or(session.subdomain());
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Mole Tunnel Active                                          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", public);
    println!("║  Local:      {:<47} ║", forwarder.base_url());
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");
}
