//! Tunnel handles for Mole Relay
//!
//! A [`Tunnel`] is the registry's view of one live client connection: the
//! subdomain it serves plus the outbound queue drained by that
//! connection's session loop. The session loop is the only writer on the
//! socket, so frames queued here are never interleaved.

use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use mole_shared::protocol::TunnelRequest;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use uuid::Uuid;

/// Identity of one accepted connection, distinct from its subdomain
pub type TunnelId = Uuid;

/// Frames buffered per connection before dispatchers wait
pub const OUTBOUND_QUEUE: usize = 100;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("tunnel connection closed")]
    Closed,

    #[error("tunnel outbound queue stayed full")]
    Stalled,
}

/// Represents an active tunnel connection
#[derive(Debug, Clone)]
pub struct Tunnel {
    id: TunnelId,
    subdomain: String,
    tx: mpsc::Sender<Message>,
    connected_at: Instant,
}

impl Tunnel {
    pub fn new(subdomain: String, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subdomain,
            tx,
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Queue a request for the client, waiting at most `wait` for room.
    ///
    /// Fails once the session loop is gone, or when it stops draining the
    /// queue.
    pub async fn send(&self, request: &TunnelRequest, wait: Duration) -> Result<(), DispatchError> {
        let frame = serde_json::to_string(request)?;
        self.tx
            .send_timeout(Message::Text(frame), wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DispatchError::Stalled,
                SendTimeoutError::Closed(_) => DispatchError::Closed,
            })
    }
}
