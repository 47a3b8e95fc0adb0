//! Pending request correlation
//!
//! Each request dispatched into a tunnel gets a single-use slot keyed by
//! its correlation ID. The session loop fills the slot when the matching
//! response arrives; the gateway waits on the other end with a deadline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mole_shared::protocol::TunnelResponse;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("request {0} is already pending")]
    Duplicate(String),

    #[error("timed out waiting for tunnel response")]
    TimedOut,

    #[error("response slot closed without a response")]
    Abandoned,
}

type Slots = DashMap<String, oneshot::Sender<TunnelResponse>>;

/// Table of requests awaiting a response, keyed by correlation ID
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Slots>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `id` and return the waiting end.
    pub fn create(&self, id: impl Into<String>) -> Result<Waiter, PendingError> {
        let id = id.into();
        match self.slots.entry(id.clone()) {
            Entry::Occupied(_) => Err(PendingError::Duplicate(id)),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                Ok(Waiter {
                    id,
                    rx,
                    slots: Arc::clone(&self.slots),
                })
            }
        }
    }

    /// Hand a response to whoever is waiting for its ID.
    ///
    /// Never blocks. Returns `false` when nobody is waiting any more, in
    /// which case the response is dropped.
    pub fn fulfill(&self, response: TunnelResponse) -> bool {
        match self.slots.remove(&response.id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, id: &str) {
        self.slots.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Receiving end of one pending request. Dropping it clears the entry.
#[derive(Debug)]
pub struct Waiter {
    id: String,
    rx: oneshot::Receiver<TunnelResponse>,
    slots: Arc<Slots>,
}

impl Waiter {
    /// Wait for the response until `deadline` elapses.
    pub async fn await_or_timeout(mut self, deadline: Duration) -> Result<TunnelResponse, PendingError> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(PendingError::Abandoned),
            Err(_) => Err(PendingError::TimedOut),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.slots.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str, status_code: u16) -> TunnelResponse {
        TunnelResponse {
            id: id.into(),
            status_code,
            headers: Default::default(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fulfill_unblocks_waiter() {
        let pending = PendingRequests::new();
        let waiter = pending.create("a").unwrap();
        assert!(pending.contains("a"));

        assert!(pending.fulfill(response("a", 201)));
        let resp = waiter.await_or_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.status_code, 201);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let pending = PendingRequests::new();
        let _waiter = pending.create("a").unwrap();
        assert_eq!(
            pending.create("a").unwrap_err(),
            PendingError::Duplicate("a".into())
        );
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let pending = PendingRequests::new();
        let waiter = pending.create("slow").unwrap();

        let err = waiter
            .await_or_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, PendingError::TimedOut);
        assert!(!pending.contains("slow"));

        // A late response is dropped quietly
        assert!(!pending.fulfill(response("slow", 200)));
    }

    #[tokio::test]
    async fn test_unknown_response_leaves_others_untouched() {
        let pending = PendingRequests::new();
        let waiter = pending.create("mine").unwrap();

        assert!(!pending.fulfill(response("stranger", 200)));
        assert!(pending.contains("mine"));

        assert!(pending.fulfill(response("mine", 200)));
        assert!(waiter.await_or_timeout(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_responses_reach_their_own_waiters() {
        let pending = PendingRequests::new();
        let first = pending.create("first").unwrap();
        let second = pending.create("second").unwrap();

        // Delivered in reverse order
        assert!(pending.fulfill(response("second", 202)));
        assert!(pending.fulfill(response("first", 201)));

        let deadline = Duration::from_secs(1);
        assert_eq!(first.await_or_timeout(deadline).await.unwrap().status_code, 201);
        assert_eq!(second.await_or_timeout(deadline).await.unwrap().status_code, 202);
    }

    #[tokio::test]
    async fn test_dropped_waiter_clears_entry() {
        let pending = PendingRequests::new();
        let waiter = pending.create("gone").unwrap();
        drop(waiter);
        assert!(pending.is_empty());
        assert!(!pending.fulfill(response("gone", 200)));
    }

    #[tokio::test]
    async fn test_removed_slot_is_abandoned() {
        let pending = PendingRequests::new();
        let waiter = pending.create("x").unwrap();
        pending.remove("x");
        assert_eq!(
            waiter.await_or_timeout(Duration::from_secs(1)).await.unwrap_err(),
            PendingError::Abandoned
        );
    }

    #[tokio::test]
    async fn test_second_fulfill_is_noop() {
        let pending = PendingRequests::new();
        let waiter = pending.create("once").unwrap();
        assert!(pending.fulfill(response("once", 200)));
        assert!(!pending.fulfill(response("once", 500)));
        let resp = waiter.await_or_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.status_code, 200);
    }
}
