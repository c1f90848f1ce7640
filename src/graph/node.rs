//! Resource node identity and lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

/// Ordered attribute map. Ordering keeps fingerprints and diffs deterministic.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Kinds of provisionable resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Identity the cluster, its nodes or its workloads run as.
    IamRole,
    /// The managed control plane.
    Cluster,
    /// A group of worker nodes.
    NodePool,
    /// Trust between an IAM role and a Kubernetes service account.
    ServiceAccountBinding,
    /// An optional managed component.
    Addon,
}

impl ResourceKind {
    /// Returns the kebab-case name used in node ids.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IamRole => "iam-role",
            Self::Cluster => "cluster",
            Self::NodePool => "node-pool",
            Self::ServiceAccountBinding => "service-account-binding",
            Self::Addon => "addon",
        }
    }

    /// Parses a kebab-case kind name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "iam-role" => Some(Self::IamRole),
            "cluster" => Some(Self::Cluster),
            "node-pool" => Some(Self::NodePool),
            "service-account-binding" => Some(Self::ServiceAccountBinding),
            "addon" => Some(Self::Addon),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a resource node, written `<kind>:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    kind: ResourceKind,
    name: String,
}

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Returns the resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a filesystem- and object-key-safe form (`<kind>.<name>`).
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    /// Parses the form produced by [`NodeId::storage_key`].
    #[must_use]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (kind, name) = key.split_once('.')?;
        let kind = ResourceKind::parse(kind)?;
        (!name.is_empty()).then(|| Self::new(kind, name))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for NodeId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GraphError::InvalidNodeId {
            value: s.to_string(),
        };
        let (kind, name) = s.split_once(':').ok_or_else(invalid)?;
        let kind = ResourceKind::parse(kind).ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(kind, name))
    }
}

impl TryFrom<String> for NodeId {
    type Error = GraphError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

/// Lifecycle of a node within one pass. The apply report records every
/// transition; the graph itself stays immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Produced by the graph builder.
    #[default]
    Planned,
    /// Compared against observed state and found unchanged.
    Diffed,
    /// A provider operation is in flight.
    Applying,
    /// The provider confirmed the operation and state was written.
    Applied,
    /// The provider operation failed.
    Failed,
    /// Skipped because an upstream failed or the pass was cancelled.
    Blocked,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Diffed => "diffed",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// One planned unit of infrastructure.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Node identifier.
    pub id: NodeId,
    /// Desired attributes.
    pub attributes: Attributes,
    /// Nodes that must be applied before this one.
    pub dependencies: Vec<NodeId>,
}

impl ResourceNode {
    /// Creates a planned node without dependencies.
    #[must_use]
    pub const fn new(id: NodeId, attributes: Attributes) -> Self {
        Self {
            id,
            attributes,
            dependencies: Vec::new(),
        }
    }

    /// Adds a dependency, ignoring duplicates.
    #[must_use]
    pub fn depends_on(mut self, dependency: NodeId) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Returns the resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.id.kind
    }

    /// Returns a string attribute.
    #[must_use]
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        let id: NodeId = "node-pool:default".parse().unwrap();
        assert_eq!(id.kind(), ResourceKind::NodePool);
        assert_eq!(id.name(), "default");
        assert_eq!(id.to_string(), "node-pool:default");

        assert!("pool:default".parse::<NodeId>().is_err());
        assert!("cluster:".parse::<NodeId>().is_err());
        assert!("cluster".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_serde_as_string() {
        let id = NodeId::new(ResourceKind::IamRole, "nodes");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"iam-role:nodes\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_storage_key() {
        let id = NodeId::new(ResourceKind::ServiceAccountBinding, "ebs-csi");
        assert_eq!(id.storage_key(), "service-account-binding.ebs-csi");
        assert_eq!(NodeId::from_storage_key(&id.storage_key()), Some(id));
        assert_eq!(NodeId::from_storage_key("lock"), None);
    }

    #[test]
    fn test_ids_order_by_kind_then_name() {
        let mut ids = vec![
            NodeId::new(ResourceKind::NodePool, "b"),
            NodeId::new(ResourceKind::Cluster, "prod"),
            NodeId::new(ResourceKind::NodePool, "a"),
        ];
        ids.sort();
        assert_eq!(ids[0].to_string(), "cluster:prod");
        assert_eq!(ids[1].to_string(), "node-pool:a");
    }
}
