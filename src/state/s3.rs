//! S3-based state storage backend.
//!
//! Records live under `<prefix>/<cluster>/resources/<kind>.<name>.json`, one
//! object per node, so a write is a single `PutObject`. The lock object sits
//! next to them as `state.lock`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{ReconcilerError, Result, StateError};
use crate::graph::NodeId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, ensure_available};
use super::store::{NodeLocks, StateStore};
use super::types::{ObservedSnapshot, ObservedState};

/// Lock object name.
const LOCK_KEY: &str = "state.lock";

/// Folder holding per-node objects.
const RESOURCES_KEY: &str = "resources/";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    /// Key prefix ending in `/`, including the cluster name.
    prefix: String,
    node_locks: NodeLocks,
}

impl S3StateStore {
    /// Creates a store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        cluster: &str,
    ) -> Result<Self> {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, cluster))
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, cluster: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix, cluster),
            node_locks: NodeLocks::new(),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn node_key(&self, id: &NodeId) -> String {
        format!("{}{RESOURCES_KEY}{}.json", self.prefix, id.storage_key())
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    ReconcilerError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ReconcilerError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object {key}: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ReconcilerError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ReconcilerError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ReconcilerError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Lists every per-node object key.
    async fn list_node_keys(&self) -> Result<Vec<String>> {
        let prefix = self.key(RESOURCES_KEY);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| ReconcilerError::State(StateError::s3(format!("S3 list error: {e}"))))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            ReconcilerError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }
}

/// Normalizes an optional user prefix and appends the cluster folder.
fn normalize_prefix(prefix: Option<&str>, cluster: &str) -> String {
    let base = prefix.map(|p| p.trim_matches('/')).unwrap_or_default();
    if base.is_empty() {
        format!("{cluster}/")
    } else {
        format!("{base}/{cluster}/")
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, id: &NodeId) -> Result<Option<ObservedState>> {
        let key = self.node_key(id);
        match self.get_object(&key).await? {
            Some(content) => ObservedState::decode(&content, &key).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, id: &NodeId, state: &ObservedState) -> Result<()> {
        let mutex = self.node_locks.for_node(id);
        let _guard = mutex.lock().await;

        let key = self.node_key(id);
        self.put_object(&key, &state.encode()?).await?;
        debug!("Wrote state for {id} to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self, id: &NodeId) -> Result<()> {
        let mutex = self.node_locks.for_node(id);
        let _guard = mutex.lock().await;

        // DeleteObject succeeds for missing keys.
        self.delete_object(&self.node_key(id)).await
    }

    async fn list(&self) -> Result<ObservedSnapshot> {
        let resources = self.key(RESOURCES_KEY);
        let mut snapshot = ObservedSnapshot::new();

        for key in self.list_node_keys().await? {
            let Some(id) = key
                .strip_prefix(&resources)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(NodeId::from_storage_key)
            else {
                warn!("Ignoring unrecognized state object: {key}");
                continue;
            };

            if let Some(content) = self.get_object(&key).await? {
                snapshot.insert(id, ObservedState::decode(&content, &key)?);
            }
        }

        info!(
            "Loaded {} state records from s3://{}/{}",
            snapshot.len(),
            self.bucket,
            self.prefix
        );
        Ok(snapshot)
    }

    async fn clear(&self) -> Result<()> {
        info!("Deleting state from s3://{}/{}", self.bucket, self.prefix);
        for key in self.list_node_keys().await? {
            self.delete_object(&key).await?;
        }
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let existing = self.read_lock().await?;
        ensure_available(existing.as_ref())?;
        if existing.is_some() {
            debug!("Expired lock found, taking over");
        }

        let lock = LockInfo::new(holder);
        let content = serde_json::to_string_pretty(&lock).map_err(|e| {
            ReconcilerError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.put_object(&self.key(LOCK_KEY), &content).await?;

        info!(
            "Acquired state lock: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock.lock_id
        );
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        warn!("Force-removing state lock in s3://{}/{}", self.bucket, self.prefix);
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
