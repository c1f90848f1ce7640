//! In-memory state backend for tests and simulated runs.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::graph::NodeId;

use super::lock::{LockInfo, ensure_available};
use super::store::{NodeLocks, StateStore};
use super::types::{ObservedSnapshot, ObservedState};

/// Process-local state store. Contents are lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<ObservedSnapshot>,
    lock: RwLock<Option<LockInfo>>,
    node_locks: NodeLocks,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_snapshot(snapshot: ObservedSnapshot) -> Self {
        Self {
            records: RwLock::new(snapshot),
            ..Self::default()
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &NodeId) -> Result<Option<ObservedState>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, id: &NodeId, state: &ObservedState) -> Result<()> {
        let mutex = self.node_locks.for_node(id);
        let _guard = mutex.lock().await;
        self.records.write().await.insert(id.clone(), state.clone());
        debug!("Stored state for {id} in memory");
        Ok(())
    }

    async fn delete(&self, id: &NodeId) -> Result<()> {
        let mutex = self.node_locks.for_node(id);
        let _guard = mutex.lock().await;
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<ObservedSnapshot> {
        Ok(self.records.read().await.clone())
    }

    async fn clear(&self) -> Result<()> {
        self.records.write().await.clear();
        *self.lock.write().await = None;
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut slot = self.lock.write().await;
        ensure_available(slot.as_ref())?;
        let lock = LockInfo::new(holder);
        *slot = Some(lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut slot = self.lock.write().await;
        if slot.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *slot = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.write().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.read().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};

    #[tokio::test]
    async fn test_roundtrip_and_lock() {
        let store = MemoryStateStore::new();
        let id = NodeId::new(ResourceKind::Cluster, "prod");
        let state = ObservedState::new(id.clone(), "c-1", Attributes::new(), vec![]);

        store.put(&id, &state).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);

        let lock = store.acquire_lock("a").await.unwrap();
        assert!(store.acquire_lock("b").await.is_err());
        store.release_lock("not-mine").await.unwrap();
        assert!(store.is_locked().await.unwrap());
        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[test]
    fn test_clear_drops_records_and_lock() {
        let id = NodeId::new(ResourceKind::NodePool, "default");
        let mut snapshot = ObservedSnapshot::new();
        snapshot.insert(id.clone(), ObservedState::new(id.clone(), "np-1", Attributes::new(), vec![]));
        let store = MemoryStateStore::with_snapshot(snapshot);

        tokio_test::block_on(async {
            store.acquire_lock("a").await.unwrap();
            store.clear().await.unwrap();
            assert!(store.get(&id).await.unwrap().is_none());
            assert!(store.get_lock_info().await.unwrap().is_none());
        });
    }
}
