//! Observed state types.
//!
//! An [`ObservedState`] is the last-applied snapshot of one resource node:
//! what was sent to the provider merged with what the provider reported back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SpecHasher;
use crate::error::{ReconcilerError, Result, StateError};
use crate::graph::{Attributes, NodeId, ResourceKind};

/// Current version of the per-node state format.
pub const STATE_VERSION: &str = "1";

/// Every observed state of one cluster, keyed by node id.
pub type ObservedSnapshot = BTreeMap<NodeId, ObservedState>;

/// Last-applied snapshot of a single node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedState {
    /// State format version.
    pub version: String,
    /// Node identifier.
    pub id: NodeId,
    /// Resource kind, duplicated for readers of the raw files.
    pub kind: ResourceKind,
    /// Identifier assigned by the cloud provider.
    pub provider_id: String,
    /// Desired attributes merged with provider-populated outputs.
    pub attributes: Attributes,
    /// Dependencies recorded at apply time.
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    /// SHA-256 fingerprint of `attributes`.
    pub fingerprint: String,
    /// When the resource was first applied.
    pub created_at: DateTime<Utc>,
    /// When the resource was last applied.
    pub updated_at: DateTime<Utc>,
}

impl ObservedState {
    /// Records a freshly applied resource.
    #[must_use]
    pub fn new(
        id: NodeId,
        provider_id: impl Into<String>,
        attributes: Attributes,
        dependencies: Vec<NodeId>,
    ) -> Self {
        let now = Utc::now();
        let fingerprint = SpecHasher::new().hash_attributes(&attributes);
        Self {
            version: STATE_VERSION.to_string(),
            kind: id.kind(),
            id,
            provider_id: provider_id.into(),
            attributes,
            dependencies,
            fingerprint,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records a re-application, keeping the original creation time.
    #[must_use]
    pub fn reapplied(
        &self,
        provider_id: impl Into<String>,
        attributes: Attributes,
        dependencies: Vec<NodeId>,
    ) -> Self {
        let mut next = Self::new(self.id.clone(), provider_id, attributes, dependencies);
        next.created_at = self.created_at;
        next
    }

    /// Returns true if this node recorded `other` as a dependency.
    #[must_use]
    pub fn depends_on(&self, other: &NodeId) -> bool {
        self.dependencies.contains(other)
    }

    /// Returns a string attribute.
    #[must_use]
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(serde_json::Value::as_str)
    }

    /// Decodes a stored record, checking its format version.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not valid JSON for this format.
    pub fn decode(content: &str, source: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(content).map_err(|e| {
            ReconcilerError::State(StateError::Corrupted {
                message: format!("Failed to parse {source}: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(ReconcilerError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(state)
    }

    /// Encodes the record as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ReconcilerError::State(StateError::serialization(format!(
                "Failed to serialize state for {}: {e}",
                self.id
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool_state() -> ObservedState {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("max_count"), json!(3));
        ObservedState::new(
            NodeId::new(ResourceKind::NodePool, "default"),
            "np-1",
            attrs,
            vec![NodeId::new(ResourceKind::Cluster, "prod")],
        )
    }

    #[test]
    fn test_reapplied_keeps_created_at() {
        let first = pool_state();
        let mut attrs = first.attributes.clone();
        attrs.insert(String::from("max_count"), json!(5));

        let second = first.reapplied("np-1", attrs, first.dependencies.clone());

        assert_eq!(second.created_at, first.created_at);
        assert_ne!(second.fingerprint, first.fingerprint);
        assert!(second.depends_on(&NodeId::new(ResourceKind::Cluster, "prod")));
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let mut state = pool_state();
        state.version = String::from("0");
        let encoded = serde_json::to_string(&state).unwrap();

        let err = ObservedState::decode(&encoded, "test").unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::State(StateError::VersionMismatch { .. })
        ));
    }
}
