//! State store trait definition.
//!
//! Stores hold one record per resource node. Writes for the same node are
//! serialized through [`NodeLocks`]; writes for different nodes never wait on
//! each other.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::lock::LockInfo;
use super::types::{ObservedSnapshot, ObservedState};
use crate::error::Result;
use crate::graph::NodeId;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the observed state of one node.
    async fn get(&self, id: &NodeId) -> Result<Option<ObservedState>>;

    /// Atomically replaces the observed state of one node.
    async fn put(&self, id: &NodeId, state: &ObservedState) -> Result<()>;

    /// Removes the observed state of one node. Missing records are not an error.
    async fn delete(&self, id: &NodeId) -> Result<()>;

    /// Reads every record of the cluster.
    async fn list(&self) -> Result<ObservedSnapshot>;

    /// Removes every record and the lock.
    async fn clear(&self) -> Result<()>;

    /// Acquires the cluster lock.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the cluster lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the cluster lock regardless of owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if a lock file exists.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if a live lock is held.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Per-node async mutexes.
#[derive(Debug, Default)]
pub struct NodeLocks {
    inner: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex guarding `id`, creating it on first use.
    pub fn for_node(&self, id: &NodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(table.entry(id.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;

    #[test]
    fn test_same_node_shares_mutex() {
        let locks = NodeLocks::new();
        let a = NodeId::new(ResourceKind::NodePool, "a");
        let b = NodeId::new(ResourceKind::NodePool, "b");

        assert!(Arc::ptr_eq(&locks.for_node(&a), &locks.for_node(&a)));
        assert!(!Arc::ptr_eq(&locks.for_node(&a), &locks.for_node(&b)));
    }
}
