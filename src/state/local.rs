//! Local file-based state storage backend.
//!
//! Each cluster gets a directory holding one JSON file per resource node
//! under `resources/` and a `state.lock` file. Writes go to a temporary file
//! first and are renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ReconcilerError, Result, StateError};
use crate::graph::NodeId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, ensure_available};
use super::store::{NodeLocks, StateStore};
use super::types::{ObservedSnapshot, ObservedState};

/// Default state directory name.
pub const STATE_DIR: &str = ".kubeplan";

/// Directory holding per-node records.
const RESOURCES_DIR: &str = "resources";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory of this cluster's state.
    base_dir: PathBuf,
    /// Directory holding one file per node.
    resources_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Per-node write serialization.
    node_locks: NodeLocks,
}

impl LocalStateStore {
    /// Creates a store under `./.kubeplan/<cluster>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn for_cluster(cluster: &str) -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ReconcilerError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR)
            .join(cluster);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store rooted at a custom directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            resources_dir: base_dir.join(RESOURCES_DIR),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
            node_locks: NodeLocks::new(),
        }
    }

    /// Returns the directory of this cluster's state.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn node_path(&self, id: &NodeId) -> PathBuf {
        self.resources_dir.join(format!("{}.json", id.storage_key()))
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir).await.map_err(|e| {
                ReconcilerError::State(StateError::io(format!(
                    "Failed to create state directory {}: {e}",
                    dir.display()
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a sibling temporary file.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");
        let io_err = |what: &str, e: std::io::Error| {
            ReconcilerError::State(StateError::io(format!(
                "Failed to {what} {}: {e}",
                path.display()
            )))
        };

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_err("create temp file for", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| io_err("write", e))?;
        file.sync_all().await.map_err(|e| io_err("sync", e))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| io_err("rename into", e))
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            ReconcilerError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ReconcilerError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock))
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                ReconcilerError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, id: &NodeId) -> Result<Option<ObservedState>> {
        let path = self.node_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            ReconcilerError::State(StateError::Corrupted {
                message: format!("Failed to read {}: {e}", path.display()),
            })
        })?;

        ObservedState::decode(&content, &path.display().to_string()).map(Some)
    }

    async fn put(&self, id: &NodeId, state: &ObservedState) -> Result<()> {
        let mutex = self.node_locks.for_node(id);
        let _guard = mutex.lock().await;

        self.ensure_dir(&self.resources_dir).await?;
        let content = state.encode()?;
        self.write_atomic(&self.node_path(id), &content).await?;

        debug!("Wrote state for {id}");
        Ok(())
    }

    async fn delete(&self, id: &NodeId) -> Result<()> {
        let mutex = self.node_locks.for_node(id);
        let _guard = mutex.lock().await;

        let path = self.node_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed state for {id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ReconcilerError::State(StateError::io(format!(
                "Failed to delete {}: {e}",
                path.display()
            )))),
        }
    }

    async fn list(&self) -> Result<ObservedSnapshot> {
        let mut snapshot = ObservedSnapshot::new();
        if !self.resources_dir.exists() {
            return Ok(snapshot);
        }

        let mut entries = fs::read_dir(&self.resources_dir).await.map_err(|e| {
            ReconcilerError::State(StateError::io(format!("Failed to list state directory: {e}")))
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ReconcilerError::State(StateError::io(format!("Failed to list state directory: {e}")))
        })? {
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };

            let Some(id) = NodeId::from_storage_key(stem) else {
                warn!("Ignoring unrecognized state file: {}", path.display());
                continue;
            };

            if let Some(state) = self.get(&id).await? {
                snapshot.insert(id, state);
            }
        }

        info!(
            "Loaded {} state records from {}",
            snapshot.len(),
            self.base_dir.display()
        );
        Ok(snapshot)
    }

    async fn clear(&self) -> Result<()> {
        if self.resources_dir.exists() {
            info!("Deleting state directory: {}", self.resources_dir.display());
            fs::remove_dir_all(&self.resources_dir).await.map_err(|e| {
                ReconcilerError::State(StateError::io(format!("Failed to delete state: {e}")))
            })?;
        }
        self.delete_lock_file().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let existing = self.read_lock_file().await?;
        ensure_available(existing.as_ref())?;
        if existing.is_some() {
            debug!("Expired lock found, taking over");
        }

        self.ensure_dir(&self.base_dir).await?;
        let lock = LockInfo::new(holder);
        let content = serde_json::to_string_pretty(&lock).map_err(|e| {
            ReconcilerError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.write_atomic(&self.lock_path, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock.lock_id
        );
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join("prod"));
        (store, temp_dir)
    }

    fn record(kind: ResourceKind, name: &str) -> ObservedState {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("name"), json!(name));
        ObservedState::new(NodeId::new(kind, name), format!("id-{name}"), attrs, vec![])
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (store, _temp) = create_test_store();
        let state = record(ResourceKind::Cluster, "prod");

        store.put(&state.id, &state).await.unwrap();
        assert_eq!(store.get(&state.id).await.unwrap(), Some(state.clone()));

        store.delete(&state.id).await.unwrap();
        assert!(store.get(&state.id).await.unwrap().is_none());
        store.delete(&state.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_file_per_node_survives_reload() {
        let (store, temp) = create_test_store();
        let cluster = record(ResourceKind::Cluster, "prod");
        let pool = record(ResourceKind::NodePool, "default");
        store.put(&cluster.id, &cluster).await.unwrap();
        store.put(&pool.id, &pool).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(temp.path().join("prod/resources"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files.len(), 2);
        assert!(files.contains(&String::from("node-pool.default.json")));

        let reloaded = LocalStateStore::with_base_dir(temp.path().join("prod"));
        let snapshot = reloaded.list().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&pool.id], pool);
    }

    #[tokio::test]
    async fn test_list_empty() {
        let (store, _temp) = create_test_store();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("test-holder").await.unwrap();
        assert!(store.is_locked().await.unwrap());

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _held = store.acquire_lock("holder-1").await.unwrap();
        let err = store.acquire_lock("holder-2").await.unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::State(StateError::LockedByOther { .. })
        ));

        store.force_unlock().await.unwrap();
        assert!(store.acquire_lock("holder-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_removes_records() {
        let (store, _temp) = create_test_store();
        let cluster = record(ResourceKind::Cluster, "prod");
        store.put(&cluster.id, &cluster).await.unwrap();

        store.clear().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
