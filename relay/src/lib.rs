//! Mole Relay
//!
//! Public side of the tunnel: accepts tunnel clients on `/tunnel`, routes
//! `<subdomain>.<domain>` traffic to them and correlates their responses.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::any, Router};
use mole_shared::protocol::{TunnelResponse, TUNNEL_PATH};
use tracing::debug;

pub mod config;
pub mod gateway;
pub mod pending;
pub mod registry;
pub mod session;
pub mod tunnel;

use config::RelayConfig;
use pending::PendingRequests;
use registry::TunnelRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: TunnelRegistry,
    pub pending: PendingRequests,
    pub config: Arc<RelayConfig>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: TunnelRegistry::new(),
            pending: PendingRequests::new(),
            request_timeout: config.request_timeout(),
            config: Arc::new(config),
        }
    }

    /// Override the response deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Route a response read from any tunnel to its waiting request.
    pub fn handle_response(&self, response: TunnelResponse) -> bool {
        let id = response.id.clone();
        let delivered = self.pending.fulfill(response);
        if !delivered {
            debug!("Dropping response {} with no pending request", id);
        }
        delivered
    }
}

/// Build the relay's HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route(TUNNEL_PATH, any(session::ws_handler))
        .route("/health", any(gateway::health_handler))
        .fallback(gateway::proxy_handler)
        .with_state(state)
}
