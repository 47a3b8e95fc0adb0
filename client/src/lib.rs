//! Mole tunnel client
//!
//! Registers a subdomain with a Mole relay and serves the requests it
//! receives by replaying them against a local HTTP service.

pub mod config;
pub mod proxy;
pub mod reconnect;
pub mod tunnel;
