//! Diff engine for comparing desired vs observed state.
//!
//! The engine compares every node of a resource graph with the stored
//! snapshot of the last apply and produces one [`ChangeOp`] per node id
//! found on either side.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::DiffConfig;
use crate::error::{ConfigError, Result};
use crate::graph::{Attributes, NodeId, ResourceGraph, ResourceKind};
use crate::state::{ObservedSnapshot, ObservedState};

/// Fields ignored for every kind.
const COMMON_COMPUTED: &[&str] = &["id", "provider_id", "status", "created_at"];

/// Operation required to bring one node to its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Node is absent from the snapshot.
    Create,
    /// Node exists with different attributes.
    Update,
    /// Node exists only in the snapshot.
    Delete,
    /// Node is up to date.
    NoOp,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

/// A single differing attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Attribute name.
    pub field: String,
    /// Stored value, if any.
    pub before: Option<Value>,
    /// Desired (or live) value, if any.
    pub after: Option<Value>,
}

impl FieldChange {
    /// Returns true if the field only exists on the new side.
    #[must_use]
    pub const fn is_added(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    /// Returns true if the field only exists on the old side.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }
}

impl std::fmt::Display for FieldChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let render = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("(none)"), Value::to_string);
        write!(f, "{}: {} -> {}", self.field, render(&self.before), render(&self.after))
    }
}

/// Required change for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeOp {
    /// Node identifier.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Operation to perform.
    pub op: OpKind,
    /// Stored attributes.
    pub before: Option<Attributes>,
    /// Desired attributes.
    pub after: Option<Attributes>,
    /// Every differing field; empty unless `op` is `Update`.
    pub changed_fields: Vec<FieldChange>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffResult {
    /// All ops, sorted by node id.
    pub ops: Vec<ChangeOp>,
    /// Number of nodes to create.
    pub creates: usize,
    /// Number of nodes to update.
    pub updates: usize,
    /// Number of nodes to delete.
    pub deletes: usize,
    /// Number of unchanged nodes.
    pub unchanged: usize,
}

impl DiffResult {
    fn from_ops(mut ops: Vec<ChangeOp>) -> Self {
        ops.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let count = |kind: OpKind| ops.iter().filter(|o| o.op == kind).count();
        Self {
            creates: count(OpKind::Create),
            updates: count(OpKind::Update),
            deletes: count(OpKind::Delete),
            unchanged: count(OpKind::NoOp),
            ops,
        }
    }

    /// Returns true if at least one op mutates something.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates + self.updates + self.deletes > 0
    }

    /// Ops other than `NoOp`.
    pub fn changes(&self) -> impl Iterator<Item = &ChangeOp> {
        self.ops.iter().filter(|o| o.op != OpKind::NoOp)
    }

    /// Looks up the op of a node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&ChangeOp> {
        self.ops
            .binary_search_by(|o| o.node_id.cmp(id))
            .ok()
            .map(|i| &self.ops[i])
    }

    /// Returns the op kind of a node, if the node was diffed.
    #[must_use]
    pub fn op_of(&self, id: &NodeId) -> Option<OpKind> {
        self.get(id).map(|o| o.op)
    }
}

/// Provider-populated fields excluded from comparison.
#[derive(Debug, Clone)]
pub struct ComputedFields {
    common: BTreeSet<String>,
    per_kind: BTreeMap<ResourceKind, BTreeSet<String>>,
}

impl Default for ComputedFields {
    fn default() -> Self {
        let set = |fields: &[&str]| fields.iter().map(|f| (*f).to_string()).collect::<BTreeSet<_>>();

        let mut per_kind = BTreeMap::new();
        per_kind.insert(ResourceKind::IamRole, set(&["arn", "principal_id", "client_id"]));
        per_kind.insert(
            ResourceKind::Cluster,
            set(&[
                "arn",
                "fqdn",
                "endpoint",
                "oidc_issuer_url",
                "certificate_authority",
                "workload_pool",
            ]),
        );
        per_kind.insert(ResourceKind::NodePool, set(&["arn", "current_node_count"]));
        per_kind.insert(
            ResourceKind::ServiceAccountBinding,
            set(&["association_id", "role_arn"]),
        );
        per_kind.insert(ResourceKind::Addon, set(&["arn"]));

        Self {
            common: set(COMMON_COMPUTED),
            per_kind,
        }
    }
}

impl ComputedFields {
    /// Builds the allow-list from the defaults plus `diff.ignore_fields`.
    ///
    /// # Errors
    ///
    /// Returns an error if a key of `ignore_fields` is not a resource kind.
    pub fn from_config(config: &DiffConfig) -> Result<Self> {
        let mut fields = Self::default();
        for (kind_name, extra) in &config.ignore_fields {
            let kind = ResourceKind::parse(kind_name).ok_or_else(|| {
                ConfigError::validation(
                    format!("Unknown resource kind '{kind_name}' in diff.ignore_fields"),
                    format!("diff.ignore_fields.{kind_name}"),
                )
            })?;
            fields.ignore(kind, extra.iter().cloned());
        }
        Ok(fields)
    }

    /// Adds fields to ignore for one kind.
    pub fn ignore(&mut self, kind: ResourceKind, fields: impl IntoIterator<Item = String>) {
        self.per_kind.entry(kind).or_default().extend(fields);
    }

    /// Returns true if `field` is provider-populated for `kind`.
    #[must_use]
    pub fn is_computed(&self, kind: ResourceKind, field: &str) -> bool {
        self.common.contains(field)
            || self
                .per_kind
                .get(&kind)
                .is_some_and(|fields| fields.contains(field))
    }
}

/// Engine for computing diffs between desired and observed states.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    computed: ComputedFields,
}

impl DiffEngine {
    /// Creates a diff engine with the default allow-list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a diff engine with a custom allow-list.
    #[must_use]
    pub const fn with_computed(computed: ComputedFields) -> Self {
        Self { computed }
    }

    /// Returns the allow-list in use.
    #[must_use]
    pub const fn computed(&self) -> &ComputedFields {
        &self.computed
    }

    /// Computes the diff between a desired graph and the stored snapshot.
    #[must_use]
    pub fn compute(&self, graph: &ResourceGraph, snapshot: &ObservedSnapshot) -> DiffResult {
        let mut ops = Vec::with_capacity(graph.len());

        for node in graph.nodes() {
            let op = match snapshot.get(&node.id) {
                None => {
                    debug!("{} needs to be created", node.id);
                    ChangeOp {
                        node_id: node.id.clone(),
                        kind: node.kind(),
                        op: OpKind::Create,
                        before: None,
                        after: Some(node.attributes.clone()),
                        changed_fields: vec![],
                    }
                }
                Some(stored) => {
                    let changed = self.compare(node.kind(), &stored.attributes, &node.attributes);
                    let op = if changed.is_empty() {
                        OpKind::NoOp
                    } else {
                        debug!("{} differs in {} field(s)", node.id, changed.len());
                        OpKind::Update
                    };
                    ChangeOp {
                        node_id: node.id.clone(),
                        kind: node.kind(),
                        op,
                        before: Some(stored.attributes.clone()),
                        after: Some(node.attributes.clone()),
                        changed_fields: changed,
                    }
                }
            };
            ops.push(op);
        }

        for (id, stored) in snapshot {
            if !graph.contains(id) {
                debug!("{id} is no longer desired");
                ops.push(ChangeOp {
                    node_id: id.clone(),
                    kind: stored.kind,
                    op: OpKind::Delete,
                    before: Some(stored.attributes.clone()),
                    after: None,
                    changed_fields: vec![],
                });
            }
        }

        DiffResult::from_ops(ops)
    }

    /// Diffs a snapshot against an empty graph: every stored node is deleted.
    #[must_use]
    pub fn compute_destroy(&self, snapshot: &ObservedSnapshot) -> DiffResult {
        self.compute(&ResourceGraph::default(), snapshot)
    }

    /// Compares two attribute maps, skipping computed fields.
    ///
    /// Returns every field that was added, removed or modified going from
    /// `before` to `after`.
    #[must_use]
    pub fn compare(&self, kind: ResourceKind, before: &Attributes, after: &Attributes) -> Vec<FieldChange> {
        let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

        keys.into_iter()
            .filter(|key| !self.computed.is_computed(kind, key))
            .filter_map(|key| {
                let old = before.get(key);
                let new = after.get(key);
                (old != new).then(|| FieldChange {
                    field: key.clone(),
                    before: old.cloned(),
                    after: new.cloned(),
                })
            })
            .collect()
    }

    /// Compares a stored snapshot with attributes read from the live resource.
    ///
    /// Only fields that are both recorded and reported are compared. A field
    /// missing from `live` is not drift, and neither is a provider default the
    /// record never held.
    #[must_use]
    pub fn drift(&self, stored: &ObservedState, live: &Attributes) -> Vec<FieldChange> {
        let mut overlaid = stored.attributes.clone();
        overlaid.extend(
            live.iter()
                .filter(|(k, _)| stored.attributes.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.compare(stored.kind, &stored.attributes, &overlaid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceNode;
    use serde_json::json;

    fn pool_attrs(max: u32) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("name"), json!("default"));
        attrs.insert(String::from("min_count"), json!(1));
        attrs.insert(String::from("max_count"), json!(max));
        attrs
    }

    fn graph(max: u32) -> ResourceGraph {
        let cluster = NodeId::new(ResourceKind::Cluster, "prod");
        let mut cluster_attrs = Attributes::new();
        cluster_attrs.insert(String::from("name"), json!("prod"));
        ResourceGraph::from_nodes(vec![
            ResourceNode::new(cluster.clone(), cluster_attrs),
            ResourceNode::new(NodeId::new(ResourceKind::NodePool, "default"), pool_attrs(max))
                .depends_on(cluster),
        ])
        .unwrap()
    }

    fn snapshot_of(graph: &ResourceGraph) -> ObservedSnapshot {
        graph
            .nodes()
            .map(|n| {
                let mut attrs = n.attributes.clone();
                attrs.insert(String::from("id"), json!(format!("prov-{}", n.id)));
                attrs.insert(String::from("status"), json!("ACTIVE"));
                (
                    n.id.clone(),
                    ObservedState::new(n.id.clone(), format!("prov-{}", n.id), attrs, n.dependencies.clone()),
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_snapshot_creates_everything() {
        let graph = graph(3);
        let diff = DiffEngine::new().compute(&graph, &ObservedSnapshot::new());

        assert_eq!(diff.creates, graph.len());
        assert!(diff.ops.iter().all(|o| o.op == OpKind::Create));
    }

    #[test]
    fn test_matching_snapshot_is_noop_despite_outputs() {
        let graph = graph(3);
        let diff = DiffEngine::new().compute(&graph, &snapshot_of(&graph));

        assert!(!diff.has_changes());
        assert_eq!(diff.unchanged, 2);
    }

    #[test]
    fn test_changed_max_count_is_single_update() {
        let snapshot = snapshot_of(&graph(3));
        let diff = DiffEngine::new().compute(&graph(5), &snapshot);

        assert_eq!(diff.updates, 1);
        let op = diff.get(&NodeId::new(ResourceKind::NodePool, "default")).unwrap();
        assert_eq!(op.op, OpKind::Update);
        assert_eq!(
            op.changed_fields,
            vec![FieldChange {
                field: String::from("max_count"),
                before: Some(json!(3)),
                after: Some(json!(5)),
            }]
        );
        assert_eq!(diff.op_of(&NodeId::new(ResourceKind::Cluster, "prod")), Some(OpKind::NoOp));
    }

    #[test]
    fn test_all_changed_fields_reported() {
        let engine = DiffEngine::new();
        let mut before = pool_attrs(3);
        before.insert(String::from("labels"), json!({"a": "b"}));
        let mut after = pool_attrs(5);
        after.insert(String::from("zones"), json!(["1"]));

        let changes = engine.compare(ResourceKind::NodePool, &before, &after);
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();

        assert_eq!(fields, vec!["labels", "max_count", "zones"]);
        assert!(changes[0].is_removed());
        assert!(changes[2].is_added());
    }

    #[test]
    fn test_orphan_is_deleted() {
        let mut snapshot = snapshot_of(&graph(3));
        let orphan = NodeId::new(ResourceKind::NodePool, "old");
        snapshot.insert(
            orphan.clone(),
            ObservedState::new(orphan.clone(), "p", pool_attrs(1), vec![]),
        );

        let diff = DiffEngine::new().compute(&graph(3), &snapshot);
        assert_eq!(diff.deletes, 1);
        assert_eq!(diff.op_of(&orphan), Some(OpKind::Delete));
    }

    #[test]
    fn test_ignore_fields_from_config() {
        let mut config = DiffConfig::default();
        config
            .ignore_fields
            .insert(String::from("node-pool"), vec![String::from("max_count")]);
        let engine = DiffEngine::with_computed(ComputedFields::from_config(&config).unwrap());

        let diff = engine.compute(&graph(5), &snapshot_of(&graph(3)));
        assert!(!diff.has_changes());

        config
            .ignore_fields
            .insert(String::from("pods"), vec![String::from("x")]);
        assert!(ComputedFields::from_config(&config).is_err());
    }

    #[test]
    fn test_drift_only_compares_reported_fields() {
        let graph = graph(3);
        let snapshot = snapshot_of(&graph);
        let stored = &snapshot[&NodeId::new(ResourceKind::NodePool, "default")];

        let mut live = Attributes::new();
        live.insert(String::from("max_count"), json!(7));
        live.insert(String::from("status"), json!("UPDATING"));

        let drift = DiffEngine::new().drift(stored, &live);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].after, Some(json!(7)));
    }

    #[test]
    fn test_drift_ignores_unrecorded_provider_defaults() {
        let graph = graph(3);
        let snapshot = snapshot_of(&graph);
        let stored = &snapshot[&NodeId::new(ResourceKind::Cluster, "prod")];

        let mut live = Attributes::new();
        live.insert(String::from("name"), json!("prod"));
        live.insert(String::from("kubernetes_version"), json!("1.29"));

        assert!(DiffEngine::new().drift(stored, &live).is_empty());
    }
}
