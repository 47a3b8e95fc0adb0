//! Mole Shared Library
//!
//! Wire protocol, header helpers, the error type and shutdown signal
//! handling used by both the relay and the tunnel client.

pub mod error;
pub mod headers;
pub mod protocol;
pub mod shutdown;

pub use error::{Error, Result};
