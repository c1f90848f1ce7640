//! Resource graph module.
//!
//! A cluster spec expands into a set of resource nodes (IAM roles, the
//! cluster, node pools, service-account bindings, add-ons) connected by
//! dependency edges.

mod builder;
mod node;
mod resource_graph;

pub use builder::GraphBuilder;
pub use node::{Attributes, LifecycleState, NodeId, ResourceKind, ResourceNode};
pub use resource_graph::ResourceGraph;
