//! Error types for Mole.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Registration rejected for '{subdomain}': {reason}")]
    RegistrationRejected { subdomain: String, reason: String },

    #[error("Forwarding error: {0}")]
    Forward(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Errors the server will answer the same way on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::RegistrationRejected { .. })
    }
}
