//! Subdomain registry for Mole Relay
//!
//! Maps each subdomain to the one tunnel currently serving it. Backed by a
//! sharded [`DashMap`]: lookups only take a shard read lock, and an insert
//! becomes visible to readers only once the entry is complete.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::tunnel::{Tunnel, TunnelId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("subdomain '{0}' is already in use")]
    AlreadyRegistered(String),
}

/// Registry of active tunnels keyed by subdomain
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the tunnel's subdomain. The first claimant wins.
    pub fn register(&self, tunnel: Tunnel) -> Result<(), RegistryError> {
        match self.tunnels.entry(tunnel.subdomain().to_string()) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(tunnel);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, subdomain: &str) -> Option<Tunnel> {
        self.tunnels.get(subdomain).map(|t| t.value().clone())
    }

    /// Remove the subdomain if it is still held by connection `id`.
    ///
    /// A session that closes after its subdomain was taken over by a newer
    /// connection must not evict the newcomer, so the holder is compared
    /// before removal. Returns whether an entry was removed.
    pub fn deregister(&self, subdomain: &str, id: TunnelId) -> bool {
        self.tunnels
            .remove_if(subdomain, |_, tunnel| tunnel.id() == id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn tunnel(subdomain: &str) -> Tunnel {
        let (tx, _rx) = mpsc::channel(1);
        Tunnel::new(subdomain.into(), tx)
    }

    #[test]
    fn test_register_lookup_deregister() {
        let registry = TunnelRegistry::new();
        let t = tunnel("demo");
        let id = t.id();

        registry.register(t).unwrap();
        assert_eq!(registry.lookup("demo").map(|t| t.id()), Some(id));
        assert!(registry.lookup("other").is_none());

        assert!(registry.deregister("demo", id));
        assert!(registry.lookup("demo").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let registry = TunnelRegistry::new();
        let first = tunnel("demo");
        let first_id = first.id();
        registry.register(first).unwrap();

        let err = registry.register(tunnel("demo")).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("demo".into()));
        assert_eq!(registry.lookup("demo").map(|t| t.id()), Some(first_id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = TunnelRegistry::new();
        let t = tunnel("demo");
        let id = t.id();
        registry.register(t).unwrap();

        assert!(registry.deregister("demo", id));
        assert!(!registry.deregister("demo", id));
        assert!(!registry.deregister("never", id));
    }

    #[test]
    fn test_stale_deregister_keeps_newer_holder() {
        let registry = TunnelRegistry::new();
        let old = tunnel("demo");
        let old_id = old.id();
        registry.register(old).unwrap();
        registry.deregister("demo", old_id);

        let fresh = tunnel("demo");
        let fresh_id = fresh.id();
        registry.register(fresh).unwrap();

        assert!(!registry.deregister("demo", old_id));
        assert_eq!(registry.lookup("demo").map(|t| t.id()), Some(fresh_id));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = TunnelRegistry::new();
        let b = TunnelRegistry::new();
        a.register(tunnel("demo")).unwrap();
        assert!(b.lookup("demo").is_none());
        b.register(tunnel("demo")).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_has_one_winner() {
        let registry = TunnelRegistry::new();
        let attempts: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.register(tunnel("race")).is_ok() })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
