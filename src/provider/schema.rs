//! Per-cloud request shapes.

use reqwest::Method;
use serde_json::{Map, Value, json};

use super::DependencyOutputs;
use super::transport::OutputField;
use crate::config::CloudTarget;
use crate::error::{ProviderError, ProviderResult};
use crate::graph::{Attributes, NodeId, ResourceKind, ResourceNode};

/// Status used for requests the schema refuses to build.
pub const UNPROCESSABLE: u16 = 422;

/// Computed attributes every cloud reports.
pub const ID_ATTRIBUTE: &str = "id";

/// Translates abstract resource nodes into one cloud's API requests.
///
/// Paths are computed from node attributes; reads, updates and deletes use
/// the stored attributes so provider outputs (generated ids) are available.
pub trait CloudSchema: Send + Sync + 'static {
    /// The cloud this schema targets.
    fn cloud(&self) -> CloudTarget;

    /// Canonical path of the resource.
    fn item_path(&self, id: &NodeId, attrs: &Attributes) -> String;

    /// Method and path of a create.
    fn create_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String);

    /// Method and path of an in-place update.
    fn update_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String);

    /// Request body for a create or update.
    ///
    /// # Errors
    ///
    /// Fails permanently when a dependency output the payload needs is missing.
    fn payload(&self, node: &ResourceNode, deps: &DependencyOutputs) -> ProviderResult<Value>;

    /// Attributes the provider populates, with `id` first.
    fn outputs(&self, kind: ResourceKind) -> &'static [OutputField];

    /// Desired attributes that can be read back for drift checks.
    fn observed(&self, kind: ResourceKind) -> &'static [OutputField];

    /// Key under which responses wrap the resource.
    fn envelope(&self, _kind: ResourceKind) -> Option<&'static str> {
        None
    }

    /// Body field carrying the idempotency token, if the API takes one.
    fn client_token_field(&self, _kind: ResourceKind) -> Option<&'static str> {
        None
    }
}

/// Returns a required string attribute.
///
/// # Errors
///
/// Fails permanently when the attribute is missing.
pub fn require_str<'a>(id: &NodeId, attrs: &'a Attributes, key: &str) -> ProviderResult<&'a str> {
    attrs.get(key).and_then(Value::as_str).ok_or_else(|| {
        ProviderError::permanent(UNPROCESSABLE, format!("{id} has no '{key}' attribute"))
    })
}

/// Returns a string attribute or an empty string.
#[must_use]
pub fn str_or_empty<'a>(attrs: &'a Attributes, key: &str) -> &'a str {
    attrs.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Returns an attribute or JSON null.
#[must_use]
pub fn attr(attrs: &Attributes, key: &str) -> Value {
    attrs.get(key).cloned().unwrap_or(Value::Null)
}

/// Reads an output recorded for a dependency.
///
/// # Errors
///
/// Fails permanently when the dependency has not been applied or lacks the output.
pub fn dependency_output(
    deps: &DependencyOutputs,
    dependency: &NodeId,
    key: &str,
) -> ProviderResult<String> {
    deps.get(dependency)
        .and_then(|attrs| attrs.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ProviderError::permanent(
                UNPROCESSABLE,
                format!("dependency {dependency} has no '{key}' output"),
            )
        })
}

/// Resolves the role identifier of a node.
///
/// A created role (`role` attribute) resolves to its `arn` output; an
/// existing role (`role_ref` attribute) is used as given.
///
/// # Errors
///
/// Fails permanently when a created role has no recorded identifier.
pub fn role_identifier(node: &ResourceNode, deps: &DependencyOutputs) -> ProviderResult<Option<String>> {
    if let Some(role_ref) = node.attr_str("role_ref") {
        return Ok(Some(role_ref.to_string()));
    }
    match node.attr_str("role") {
        Some(role) => {
            dependency_output(deps, &NodeId::new(ResourceKind::IamRole, role), "arn").map(Some)
        }
        None => Ok(None),
    }
}

/// Reads an output of the cluster a node belongs to.
///
/// # Errors
///
/// Fails permanently when the cluster output is missing.
pub fn cluster_output(node: &ResourceNode, deps: &DependencyOutputs, key: &str) -> ProviderResult<String> {
    let cluster = require_str(&node.id, &node.attributes, "cluster")?;
    dependency_output(deps, &NodeId::new(ResourceKind::Cluster, cluster), key)
}

/// A taint decoded from its `key=value:Effect` rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taint<'a> {
    /// Taint key.
    pub key: &'a str,
    /// Optional value.
    pub value: Option<&'a str>,
    /// Effect name as Kubernetes spells it.
    pub effect: &'a str,
}

/// Decodes the `taints` attribute of a node pool.
#[must_use]
pub fn taints(attrs: &Attributes) -> Vec<Taint<'_>> {
    attrs
        .get("taints")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| {
                    let (pair, effect) = s.rsplit_once(':')?;
                    let (key, value) = match pair.split_once('=') {
                        Some((k, v)) => (k, Some(v)),
                        None => (pair, None),
                    };
                    Some(Taint { key, value, effect })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Builds a JSON object from pairs, skipping nulls.
#[must_use]
pub fn object(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
    let map: Map<String, Value> = pairs
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    Value::Object(map)
}

/// Returns a nested field of the cluster `network` attribute.
#[must_use]
pub fn network_field(attrs: &Attributes, key: &str) -> Value {
    attrs
        .get("network")
        .and_then(|n| n.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Returns an empty JSON object when `value` is null.
#[must_use]
pub fn or_empty_object(value: Value) -> Value {
    if value.is_null() { json!({}) } else { value }
}
