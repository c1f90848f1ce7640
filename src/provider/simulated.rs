//! In-memory cloud used by `--simulate` and the test suite.
//!
//! Resources are kept as the JSON bodies that were sent, with provider outputs
//! filled in deterministically. POST creates honor the client request token;
//! PUT creates upsert.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

use super::transport::{ApiRequest, ApiResponse, Operation, Transport};
use crate::error::{ProviderError, ProviderResult};
use crate::graph::NodeId;

/// A request observed by the simulated cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Node the request acted on.
    pub node: NodeId,
    /// Operation performed.
    pub operation: Operation,
    /// HTTP method.
    pub method: Method,
    /// Request path.
    pub path: String,
}

#[derive(Debug)]
struct Stored {
    body: Value,
    token: Option<String>,
}

#[derive(Debug)]
struct Fault {
    error: ProviderError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, Stored>,
    nodes: HashMap<NodeId, String>,
    faults: HashMap<(NodeId, Operation), Fault>,
    calls: Vec<CallRecord>,
}

/// Simulated cloud API.
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cloud that delays every request.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fails the next `times` calls of `operation` on `node` with `error`.
    pub fn inject_fault(&self, node: NodeId, operation: Operation, error: ProviderError, times: usize) {
        self.lock()
            .faults
            .insert((node, operation), Fault { error, remaining: times });
    }

    /// Fails every call of `operation` on `node` with `error`.
    pub fn fail_always(&self, node: NodeId, operation: Operation, error: ProviderError) {
        self.inject_fault(node, operation, error, usize::MAX);
    }

    /// Every request received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Requests received for one node.
    #[must_use]
    pub fn calls_for(&self, node: &NodeId) -> Vec<CallRecord> {
        self.lock()
            .calls
            .iter()
            .filter(|c| &c.node == node)
            .cloned()
            .collect()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Highest number of requests that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Returns true if the resource behind `node` exists.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        let inner = self.lock();
        inner
            .nodes
            .get(node)
            .is_some_and(|key| inner.resources.contains_key(key))
    }

    /// Returns the stored body of the resource behind `node`.
    #[must_use]
    pub fn resource(&self, node: &NodeId) -> Option<Value> {
        let inner = self.lock();
        let key = inner.nodes.get(node)?;
        inner.resources.get(key).map(|s| s.body.clone())
    }

    /// Number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns true if no resource exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Changes a field of a live resource out of band.
    ///
    /// Returns false if the resource does not exist.
    pub fn set_field(&self, node: &NodeId, pointer: &str, value: Value) -> bool {
        let mut inner = self.lock();
        let Some(key) = inner.nodes.get(node).cloned() else {
            return false;
        };
        match inner.resources.get_mut(&key) {
            Some(stored) => {
                set_pointer(&mut stored.body, pointer, value);
                true
            }
            None => false,
        }
    }

    /// Deletes a live resource out of band.
    pub fn remove(&self, node: &NodeId) -> bool {
        let mut inner = self.lock();
        match inner.nodes.get(node).cloned() {
            Some(key) => inner.resources.remove(&key).is_some(),
            None => false,
        }
    }

    fn handle(&self, request: &ApiRequest) -> ProviderResult<Value> {
        let mut inner = self.lock();
        inner.calls.push(CallRecord {
            node: request.node.clone(),
            operation: request.operation,
            method: request.method.clone(),
            path: request.path.clone(),
        });

        if let Some(fault) = inner.faults.get_mut(&(request.node.clone(), request.operation)) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(fault.error.clone());
            }
        }

        let key = request.resource.clone();
        inner.nodes.insert(request.node.clone(), key.clone());

        match request.operation {
            Operation::Create => {
                if let Some(existing) = inner.resources.get_mut(&key) {
                    if request.method == Method::POST {
                        if existing.token.is_some() && existing.token == request.client_token {
                            return Ok(wrap(request, existing.body.clone()));
                        }
                        return Err(ProviderError::permanent(409, format!("{key} already exists")));
                    }
                    merge(&mut existing.body, request.body.clone());
                    fill_outputs(request, &mut existing.body);
                    existing.token.clone_from(&request.client_token);
                    return Ok(wrap(request, existing.body.clone()));
                }

                let mut body = request.body.clone().unwrap_or_else(|| json!({}));
                fill_outputs(request, &mut body);
                inner.resources.insert(
                    key,
                    Stored {
                        body: body.clone(),
                        token: request.client_token.clone(),
                    },
                );
                Ok(wrap(request, body))
            }
            Operation::Read => inner
                .resources
                .get(&key)
                .map(|s| wrap(request, s.body.clone()))
                .ok_or_else(|| ProviderError::not_found(key)),
            Operation::Update => {
                let stored = inner
                    .resources
                    .get_mut(&key)
                    .ok_or_else(|| ProviderError::not_found(key.clone()))?;
                merge(&mut stored.body, request.body.clone());
                fill_outputs(request, &mut stored.body);
                Ok(wrap(request, stored.body.clone()))
            }
            Operation::Delete => inner
                .resources
                .remove(&key)
                .map(|_| Value::Null)
                .ok_or_else(|| ProviderError::not_found(key)),
        }
    }
}

#[async_trait]
impl Transport for SimulatedCloud {
    async fn send(&self, request: ApiRequest) -> ProviderResult<ApiResponse> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        trace!("simulated {} {}", request.method, request.path);
        let body = self.handle(&request)?;
        let status = match request.operation {
            Operation::Create => 201,
            Operation::Delete => 204,
            Operation::Read | Operation::Update => 200,
        };
        Ok(ApiResponse { status, body })
    }
}

fn wrap(request: &ApiRequest, body: Value) -> Value {
    match request.envelope {
        Some(key) => {
            let mut map = Map::new();
            map.insert(key.to_string(), body);
            Value::Object(map)
        }
        None => body,
    }
}

/// Overlays the top-level fields of `update` onto `target`.
fn merge(target: &mut Value, update: Option<Value>) {
    match (target, update) {
        (Value::Object(current), Some(Value::Object(next))) => current.extend(next),
        (target, Some(next)) => *target = next,
        (_, None) => {}
    }
}

fn fill_outputs(request: &ApiRequest, body: &mut Value) {
    let path = request.resource.split('?').next().unwrap_or_default();
    let digest = hex::encode(Sha256::digest(path.as_bytes()));
    let short = &digest[..12];

    for field in request.outputs {
        if body.pointer(field.pointer).is_some_and(|v| !v.is_null()) {
            continue;
        }
        let value = match field.attribute {
            "id" | "arn" => json!(path),
            "status" => json!("ACTIVE"),
            "endpoint" => json!(format!("https://{short}.simulated")),
            attr if attr.ends_with("_url") => json!(format!("https://oidc.simulated/{short}")),
            attr => json!(format!("sim-{attr}-{short}")),
        };
        set_pointer(body, field.pointer, value);
    }
}

/// Writes `value` at a JSON pointer, creating intermediate objects.
fn set_pointer(target: &mut Value, pointer: &str, value: Value) {
    let segments: Vec<&str> = pointer.split('/').skip(1).collect();
    let Some((last, parents)) = segments.split_last() else {
        *target = value;
        return;
    };

    let mut current = target;
    for segment in parents {
        if !current.is_object() && !current.is_array() {
            *current = json!({});
        }
        current = match current {
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return,
            },
            Value::Object(map) => map.entry((*segment).to_string()).or_insert_with(|| json!({})),
            _ => return,
        };
    }

    match current {
        Value::Array(items) => {
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = value;
            }
        }
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
        }
        other => {
            let mut map = Map::new();
            map.insert((*last).to_string(), value);
            *other = Value::Object(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use crate::provider::transport::OutputField;
    use std::sync::Arc;

    const OUTPUTS: &[OutputField] = &[
        OutputField::new("id", "/arn"),
        OutputField::new("oidc_issuer_url", "/identity/oidc/issuer"),
    ];

    fn create(token: &str) -> ApiRequest {
        ApiRequest {
            node: NodeId::new(ResourceKind::Cluster, "prod"),
            operation: Operation::Create,
            method: Method::POST,
            path: String::from("/clusters"),
            resource: String::from("/clusters/prod"),
            body: Some(json!({"name": "prod", "version": "1.30"})),
            client_token: Some(token.to_string()),
            envelope: Some("cluster"),
            outputs: OUTPUTS,
        }
    }

    #[tokio::test]
    async fn test_create_fills_outputs_in_envelope() {
        let cloud = SimulatedCloud::new();
        let response = cloud.send(create("t1")).await.unwrap();

        assert_eq!(response.body["cluster"]["arn"], json!("/clusters/prod"));
        assert!(response.body["cluster"]["identity"]["oidc"]["issuer"]
            .as_str()
            .unwrap()
            .starts_with("https://"));
    }

    #[tokio::test]
    async fn test_post_create_is_idempotent_per_token() {
        let cloud = SimulatedCloud::new();
        let first = cloud.send(create("t1")).await.unwrap();
        let again = cloud.send(create("t1")).await.unwrap();
        assert_eq!(first.body, again.body);

        let err = cloud.send(create("t2")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { status: 409, .. }));
        assert_eq!(cloud.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_consumed() {
        let cloud = SimulatedCloud::new();
        let node = NodeId::new(ResourceKind::Cluster, "prod");
        cloud.inject_fault(node.clone(), Operation::Create, ProviderError::transient("throttled"), 1);

        assert!(cloud.send(create("t1")).await.unwrap_err().is_transient());
        assert!(cloud.send(create("t1")).await.is_ok());
        assert_eq!(cloud.calls_for(&node).len(), 2);
    }

    #[tokio::test]
    async fn test_drift_and_out_of_band_delete() {
        let cloud = SimulatedCloud::new();
        let node = NodeId::new(ResourceKind::Cluster, "prod");
        cloud.send(create("t1")).await.unwrap();

        assert!(cloud.set_field(&node, "/version", json!("1.29")));
        assert_eq!(cloud.resource(&node).unwrap()["version"], json!("1.29"));

        assert!(cloud.remove(&node));
        assert!(!cloud.contains(&node));
    }

    #[tokio::test]
    async fn test_tracks_concurrency() {
        let cloud = Arc::new(SimulatedCloud::with_latency(Duration::from_millis(20)));
        let mut handles = Vec::new();
        for i in 0..3 {
            let cloud = Arc::clone(&cloud);
            handles.push(tokio::spawn(async move {
                let mut request = create("t");
                request.resource = format!("/clusters/c{i}");
                cloud.send(request).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cloud.max_in_flight(), 3);
    }

    #[test]
    fn test_set_pointer_creates_parents() {
        let mut value = json!({});
        set_pointer(&mut value, "/a/b/c", json!(1));
        assert_eq!(value, json!({"a": {"b": {"c": 1}}}));
    }
}
