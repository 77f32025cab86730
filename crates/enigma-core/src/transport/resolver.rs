//! Pending-result registry.
//!
//! Every outstanding request id maps to exactly one resolver. Settling removes
//! the entry, so a second settle for the same id is a no-op. Two pseudo ids,
//! `Opened` and `Closed`, track the socket lifecycle and survive connectivity
//! fan-out.

use crate::error::{EnigmaError, Result};
use crate::lock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Key of a registered resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolverId {
    Opened,
    Closed,
    Request(i64),
}

struct Resolver {
    handle: Option<i64>,
    tx: oneshot::Sender<Result<Value>>,
}

/// Registry of pending resolvers.
#[derive(Default)]
pub struct ResolverRegistry {
    entries: Mutex<HashMap<ResolverId, Resolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for `id`, tagged with the originating handle.
    ///
    /// A resolver already registered under `id` is rejected first.
    pub fn register(
        &self,
        id: ResolverId,
        handle: Option<i64>,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let previous = lock(&self.entries).insert(id, Resolver { handle, tx });
        if let Some(previous) = previous {
            debug!("Resolver {:?} superseded", id);
            let _ = previous
                .tx
                .send(Err(EnigmaError::not_connected("Resolver superseded")));
        }
        rx
    }

    /// Settle `id` successfully. Returns false if nothing was registered.
    pub fn resolve(&self, id: ResolverId, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    /// Settle `id` with an error. Returns false if nothing was registered.
    pub fn reject(&self, id: ResolverId, err: EnigmaError) -> bool {
        self.settle(id, Err(err))
    }

    fn settle(&self, id: ResolverId, outcome: Result<Value>) -> bool {
        let entry = lock(&self.entries).remove(&id);
        match entry {
            Some(resolver) => {
                debug!("Resolver {:?} settled (ok: {})", id, outcome.is_ok());
                // The receiver may have been dropped by a caller that gave up.
                let _ = resolver.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Reject every request resolver, leaving `Opened`/`Closed` in place.
    ///
    /// Returns the number of rejected resolvers.
    pub fn reject_all_outstanding(&self, make_err: impl Fn() -> EnigmaError) -> usize {
        let drained: Vec<Resolver> = {
            let mut entries = lock(&self.entries);
            let ids: Vec<ResolverId> = entries
                .keys()
                .filter(|id| matches!(id, ResolverId::Request(_)))
                .copied()
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = drained.len();
        for resolver in drained {
            let _ = resolver.tx.send(Err(make_err()));
        }
        count
    }

    pub fn contains(&self, id: ResolverId) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    /// Handle the resolver for `id` was registered with.
    pub fn handle_of(&self, id: ResolverId) -> Option<i64> {
        lock(&self.entries).get(&id).and_then(|r| r.handle)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of outstanding request resolvers, ascending.
    pub fn pending_requests(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.entries)
            .keys()
            .filter_map(|id| match id {
                ResolverId::Request(n) => Some(*n),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_removes_entry() {
        let registry = ResolverRegistry::new();
        let rx = registry.register(ResolverId::Request(1), Some(-1));
        assert_eq!(registry.handle_of(ResolverId::Request(1)), Some(-1));

        assert!(registry.resolve(ResolverId::Request(1), json!({"result": {}})));
        assert!(registry.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), json!({"result": {}}));
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let registry = ResolverRegistry::new();
        let rx = registry.register(ResolverId::Request(7), None);

        assert!(registry.reject(ResolverId::Request(7), EnigmaError::ObjectNotFound));
        assert!(!registry.resolve(ResolverId::Request(7), json!(1)));
        assert!(!registry.reject(ResolverId::Request(7), EnigmaError::ObjectNotFound));

        assert!(matches!(rx.await.unwrap(), Err(EnigmaError::ObjectNotFound)));
    }

    #[tokio::test]
    async fn test_reregister_rejects_previous() {
        let registry = ResolverRegistry::new();
        let first = registry.register(ResolverId::Request(3), None);
        let second = registry.register(ResolverId::Request(3), None);
        assert_eq!(registry.len(), 1);

        assert!(first.await.unwrap().is_err());
        registry.resolve(ResolverId::Request(3), json!("ok"));
        assert_eq!(second.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_reject_all_spares_lifecycle_resolvers() {
        let registry = ResolverRegistry::new();
        let _opened = registry.register(ResolverId::Opened, None);
        let _closed = registry.register(ResolverId::Closed, None);
        let pending: Vec<_> = (1..=3)
            .map(|id| registry.register(ResolverId::Request(id), Some(1)))
            .collect();
        assert_eq!(registry.pending_requests(), vec![1, 2, 3]);

        let rejected =
            registry.reject_all_outstanding(|| EnigmaError::not_connected("Socket closed"));
        assert_eq!(rejected, 3);
        assert!(registry.contains(ResolverId::Opened));
        assert!(registry.contains(ResolverId::Closed));
        assert!(registry.pending_requests().is_empty());

        for rx in pending {
            let err = rx.await.unwrap().unwrap_err();
            assert!(err.is_connectivity());
        }
    }
}
