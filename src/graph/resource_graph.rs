//! Dependency graph of resource nodes backed by petgraph.
//!
//! Edges point from a dependency to its dependent, so a topological order is
//! a valid creation order and its reverse a valid deletion order.

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{BTreeSet, HashMap};

use super::node::{NodeId, ResourceNode};
use crate::error::{GraphError, ReconcilerError, Result};

/// An acyclic graph of resource nodes.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    graph: DiGraph<ResourceNode, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from nodes and verifies its invariants.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate ids, dangling dependencies or cycles.
    pub fn from_nodes(nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Self> {
        let mut graph = Self::new();

        for node in nodes {
            if graph.index.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode { id: node.id }.into());
            }
            let id = node.id.clone();
            let idx = graph.graph.add_node(node);
            graph.index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.graph.node_indices() {
            let node = &graph.graph[idx];
            for dependency in &node.dependencies {
                let dep_idx = graph.index.get(dependency).copied().ok_or_else(|| {
                    ReconcilerError::Graph(GraphError::UnknownDependency {
                        id: node.id.clone(),
                        dependency: dependency.clone(),
                    })
                })?;
                edges.push((dep_idx, idx));
            }
        }
        for (from, to) in edges {
            graph.graph.add_edge(from, to, ());
        }

        graph.verify()?;
        Ok(graph)
    }

    /// Checks that the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] naming a node on the cycle.
    pub fn verify(&self) -> Result<()> {
        toposort(&self.graph, None).map(|_| ()).map_err(|cycle| {
            ReconcilerError::Graph(GraphError::Cycle {
                id: self.graph[cycle.node_id()].id.clone(),
            })
        })
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns true if the graph contains the node.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&ResourceNode> {
        self.index.get(id).map(|idx| &self.graph[*idx])
    }

    /// Iterates over all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.graph.node_weights()
    }

    /// Returns the direct dependencies of a node.
    #[must_use]
    pub fn dependencies(&self, id: &NodeId) -> Vec<&NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Returns every node that depends on `id`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };

        let mut reached = BTreeSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                reached.insert(self.graph[idx].id.clone());
            }
        }
        reached
    }

    /// Returns node ids in dependency order (dependencies first).
    #[must_use]
    pub fn topological_order(&self) -> Vec<NodeId> {
        toposort(&self.graph, None)
            .map(|sorted| {
                sorted
                    .into_iter()
                    .map(|idx| self.graph[idx].id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<&NodeId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<&NodeId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| &self.graph[n].id)
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{Attributes, ResourceKind};

    fn node(kind: ResourceKind, name: &str) -> ResourceNode {
        ResourceNode::new(NodeId::new(kind, name), Attributes::new())
    }

    fn id(kind: ResourceKind, name: &str) -> NodeId {
        NodeId::new(kind, name)
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let cluster = node(ResourceKind::Cluster, "prod");
        let pool = node(ResourceKind::NodePool, "default").depends_on(cluster.id.clone());
        let dns = node(ResourceKind::Addon, "dns")
            .depends_on(cluster.id.clone())
            .depends_on(pool.id.clone());

        let graph = ResourceGraph::from_nodes(vec![dns, pool, cluster]).unwrap();
        let order = graph.topological_order();
        let pos = |i: &NodeId| order.iter().position(|o| o == i).unwrap();

        assert!(pos(&id(ResourceKind::Cluster, "prod")) < pos(&id(ResourceKind::NodePool, "default")));
        assert!(pos(&id(ResourceKind::NodePool, "default")) < pos(&id(ResourceKind::Addon, "dns")));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let pool = node(ResourceKind::NodePool, "default").depends_on(id(ResourceKind::Cluster, "x"));
        let err = ResourceGraph::from_nodes(vec![pool]).unwrap_err();
        assert!(matches!(err, ReconcilerError::Graph(GraphError::UnknownDependency { .. })));
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = ResourceGraph::from_nodes(vec![
            node(ResourceKind::Cluster, "prod"),
            node(ResourceKind::Cluster, "prod"),
        ])
        .unwrap_err();
        assert!(matches!(err, ReconcilerError::Graph(GraphError::DuplicateNode { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let a = node(ResourceKind::IamRole, "a").depends_on(id(ResourceKind::IamRole, "b"));
        let b = node(ResourceKind::IamRole, "b").depends_on(id(ResourceKind::IamRole, "a"));
        let err = ResourceGraph::from_nodes(vec![a, b]).unwrap_err();
        assert!(matches!(err, ReconcilerError::Graph(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_transitive_dependents() {
        let role = node(ResourceKind::IamRole, "nodes");
        let cluster = node(ResourceKind::Cluster, "prod");
        let pool = node(ResourceKind::NodePool, "default")
            .depends_on(cluster.id.clone())
            .depends_on(role.id.clone());
        let dns = node(ResourceKind::Addon, "dns").depends_on(pool.id.clone());

        let graph = ResourceGraph::from_nodes(vec![role, cluster, pool, dns]).unwrap();
        let blocked = graph.transitive_dependents(&id(ResourceKind::IamRole, "nodes"));

        assert_eq!(blocked.len(), 2);
        assert!(blocked.contains(&id(ResourceKind::Addon, "dns")));
        assert!(!blocked.contains(&id(ResourceKind::Cluster, "prod")));
        assert_eq!(graph.dependencies(&id(ResourceKind::NodePool, "default")).len(), 2);
    }
}
