//! Expansion of a cluster spec into a resource graph.

use serde_json::{Value, json};
use tracing::debug;

use super::node::{Attributes, NodeId, ResourceKind, ResourceNode};
use super::resource_graph::ResourceGraph;
use crate::config::{
    AddonKind, AddonToggle, ClusterSpec, NodePoolConfig, ServiceAccountBindingConfig,
    SpecValidator,
};
use crate::error::Result;

/// Builds resource graphs from validated specs.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    validator: SpecValidator,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            validator: SpecValidator::new(),
        }
    }

    /// Validates the cluster spec and expands it into a resource graph.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid spec, or a graph error if the
    /// expanded graph breaks its invariants.
    pub fn build(&self, spec: &ClusterSpec) -> Result<ResourceGraph> {
        self.validator.validate(spec)?;

        let cluster_id = NodeId::new(ResourceKind::Cluster, &spec.cluster.name);
        let mut nodes = Vec::new();

        for role in spec.iam.roles.iter().filter(|r| r.create) {
            let mut policies = role.policies.clone();
            policies.sort();
            let mut attributes = Attributes::new();
            attributes.insert(String::from("name"), json!(role.name));
            attributes.insert(String::from("cluster"), json!(spec.cluster.name));
            attributes.insert(String::from("region"), json!(spec.cluster.region));
            attributes.insert(String::from("policies"), json!(policies));
            nodes.push(ResourceNode::new(
                NodeId::new(ResourceKind::IamRole, &role.name),
                attributes,
            ));
        }

        nodes.push(Self::cluster_node(spec, &cluster_id));

        let mut pool_ids = Vec::new();
        for pool in &spec.node_pools {
            let node = Self::pool_node(spec, pool, &cluster_id);
            pool_ids.push(node.id.clone());
            nodes.push(node);
        }

        for binding in &spec.iam.bindings {
            nodes.push(Self::binding_node(spec, binding, &cluster_id));
        }

        for (kind, toggle) in spec.addons.enabled() {
            nodes.push(Self::addon_node(spec, kind, toggle, &cluster_id, &pool_ids));
        }

        let graph = ResourceGraph::from_nodes(nodes)?;
        debug!(
            "Built resource graph for cluster '{}' with {} nodes",
            spec.cluster.name,
            graph.len()
        );
        Ok(graph)
    }

    fn cluster_node(spec: &ClusterSpec, id: &NodeId) -> ResourceNode {
        let cluster = &spec.cluster;
        let network = &spec.network;

        let mut net = serde_json::Map::new();
        insert_opt(&mut net, "cidr", network.cidr.as_ref());
        insert_opt(&mut net, "pod_cidr", network.pod_cidr.as_ref());
        insert_opt(&mut net, "service_cidr", network.service_cidr.as_ref());
        insert_opt(&mut net, "dns_service_ip", network.dns_service_ip.as_ref());
        insert_opt(&mut net, "plugin", network.plugin.as_ref());
        if !network.subnet_ids.is_empty() {
            net.insert(String::from("subnet_ids"), json!(network.subnet_ids));
        }
        net.insert(String::from("private_endpoint"), json!(network.private_endpoint));

        let mut attributes = Attributes::new();
        attributes.insert(String::from("name"), json!(cluster.name));
        attributes.insert(String::from("region"), json!(cluster.region));
        if let Some(version) = &cluster.kubernetes_version {
            attributes.insert(String::from("kubernetes_version"), json!(version));
        }
        if !cluster.tags.is_empty() {
            attributes.insert(String::from("tags"), json!(cluster.tags));
        }
        attributes.insert(String::from("network"), Value::Object(net));

        let node = ResourceNode::new(id.clone(), Attributes::new());
        let (mut node, role_attrs) = with_role(spec, node, cluster.role.as_deref());
        attributes.extend(role_attrs);
        node.attributes = attributes;
        node
    }

    fn pool_node(spec: &ClusterSpec, pool: &NodePoolConfig, cluster_id: &NodeId) -> ResourceNode {
        let mut taints: Vec<String> = pool.taints.iter().map(crate::config::TaintConfig::render).collect();
        taints.sort();

        let mut attributes = Attributes::new();
        attributes.insert(String::from("name"), json!(pool.name));
        attributes.insert(String::from("cluster"), json!(spec.cluster.name));
        attributes.insert(String::from("region"), json!(spec.cluster.region));
        attributes.insert(String::from("instance_class"), json!(pool.instance_class));
        attributes.insert(String::from("min_count"), json!(pool.min_count));
        attributes.insert(String::from("max_count"), json!(pool.max_count));
        attributes.insert(String::from("desired_count"), json!(pool.effective_desired()));
        attributes.insert(String::from("enable_autoscaling"), json!(pool.enable_autoscaling));
        if !pool.labels.is_empty() {
            attributes.insert(String::from("labels"), json!(pool.labels));
        }
        if !taints.is_empty() {
            attributes.insert(String::from("taints"), json!(taints));
        }
        if !pool.zones.is_empty() {
            attributes.insert(String::from("zones"), json!(pool.zones));
        }
        if let Some(disk) = pool.disk_size_gb {
            attributes.insert(String::from("disk_size_gb"), json!(disk));
        }
        if let Some(subnet) = &pool.subnet_cidr {
            attributes.insert(String::from("subnet_cidr"), json!(subnet));
        }

        let node = ResourceNode::new(NodeId::new(ResourceKind::NodePool, &pool.name), Attributes::new())
            .depends_on(cluster_id.clone());
        let (mut node, role_attrs) = with_role(spec, node, pool.role.as_deref());
        attributes.extend(role_attrs);
        node.attributes = attributes;
        node
    }

    fn binding_node(
        spec: &ClusterSpec,
        binding: &ServiceAccountBindingConfig,
        cluster_id: &NodeId,
    ) -> ResourceNode {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("name"), json!(binding.name));
        attributes.insert(String::from("cluster"), json!(spec.cluster.name));
        attributes.insert(String::from("region"), json!(spec.cluster.region));
        attributes.insert(String::from("namespace"), json!(binding.namespace));
        attributes.insert(String::from("service_account"), json!(binding.service_account));

        let node = ResourceNode::new(
            NodeId::new(ResourceKind::ServiceAccountBinding, &binding.name),
            Attributes::new(),
        )
        .depends_on(cluster_id.clone());
        let (mut node, role_attrs) = with_role(spec, node, Some(&binding.role));
        attributes.extend(role_attrs);
        node.attributes = attributes;
        node
    }

    fn addon_node(
        spec: &ClusterSpec,
        kind: AddonKind,
        toggle: &AddonToggle,
        cluster_id: &NodeId,
        pool_ids: &[NodeId],
    ) -> ResourceNode {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("name"), json!(kind.name()));
        attributes.insert(String::from("cluster"), json!(spec.cluster.name));
        attributes.insert(String::from("region"), json!(spec.cluster.region));
        if let Some(version) = &toggle.version {
            attributes.insert(String::from("version"), json!(version));
        }

        let mut node = ResourceNode::new(NodeId::new(ResourceKind::Addon, kind.name()), attributes)
            .depends_on(cluster_id.clone());

        if kind.requires_nodes() {
            for pool in pool_ids {
                node = node.depends_on(pool.clone());
            }
        }

        if let Some(binding) = &toggle.binding {
            node.attributes
                .insert(String::from("binding"), json!(binding));
            node = node.depends_on(NodeId::new(ResourceKind::ServiceAccountBinding, binding));
        }

        node
    }
}

/// Resolves a role reference into either an edge to a created role or a
/// `role_ref` attribute carrying the existing identifier.
fn with_role(
    spec: &ClusterSpec,
    node: ResourceNode,
    role: Option<&str>,
) -> (ResourceNode, Attributes) {
    let mut attrs = Attributes::new();
    let Some(role) = role.and_then(|name| spec.role(name)) else {
        return (node, attrs);
    };

    if role.create {
        attrs.insert(String::from("role"), json!(role.name));
        let node = node.depends_on(NodeId::new(ResourceKind::IamRole, &role.name));
        return (node, attrs);
    }

    if let Some(arn) = &role.arn {
        attrs.insert(String::from("role_ref"), json!(arn));
    }
    (node, attrs)
}

fn insert_opt(map: &mut serde_json::Map<String, Value>, key: &str, value: Option<&String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), json!(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AddonsConfig, CloudTarget, ClusterConfig, IamConfig, IamRoleConfig, NetworkConfig,
    };
    use std::collections::BTreeMap;

    fn pool(name: &str) -> NodePoolConfig {
        NodePoolConfig {
            name: name.to_string(),
            instance_class: String::from("m6i.large"),
            min_count: 1,
            max_count: 3,
            desired_count: None,
            enable_autoscaling: true,
            labels: BTreeMap::new(),
            taints: vec![],
            subnet_cidr: None,
            zones: vec![],
            disk_size_gb: None,
            role: None,
        }
    }

    fn spec() -> ClusterSpec {
        ClusterSpec {
            cloud: CloudTarget::Aws,
            cluster: ClusterConfig {
                name: String::from("prod"),
                region: String::from("eu-west-1"),
                kubernetes_version: Some(String::from("1.30")),
                role: None,
                tags: BTreeMap::new(),
            },
            network: NetworkConfig::default(),
            node_pools: vec![pool("default")],
            iam: IamConfig::default(),
            addons: AddonsConfig::default(),
        }
    }

    fn id(kind: ResourceKind, name: &str) -> NodeId {
        NodeId::new(kind, name)
    }

    #[test]
    fn test_minimal_spec_produces_cluster_and_pool() {
        let graph = GraphBuilder::new().build(&spec()).unwrap();

        assert_eq!(graph.len(), 2);
        let pool = graph.get(&id(ResourceKind::NodePool, "default")).unwrap();
        assert_eq!(pool.dependencies, vec![id(ResourceKind::Cluster, "prod")]);
        assert_eq!(pool.attributes["max_count"], json!(3));
        assert_eq!(pool.attributes["desired_count"], json!(1));
    }

    #[test]
    fn test_created_role_becomes_edge_existing_role_becomes_ref() {
        let mut spec = spec();
        spec.iam.roles = vec![
            IamRoleConfig {
                name: String::from("control-plane"),
                arn: Some(String::from("arn:aws:iam::1:role/cp")),
                create: false,
                policies: vec![],
            },
            IamRoleConfig {
                name: String::from("nodes"),
                arn: None,
                create: true,
                policies: vec![String::from("b"), String::from("a")],
            },
        ];
        spec.cluster.role = Some(String::from("control-plane"));
        spec.node_pools[0].role = Some(String::from("nodes"));

        let graph = GraphBuilder::new().build(&spec).unwrap();

        let cluster = graph.get(&id(ResourceKind::Cluster, "prod")).unwrap();
        assert!(cluster.dependencies.is_empty());
        assert_eq!(cluster.attr_str("role_ref"), Some("arn:aws:iam::1:role/cp"));
        assert!(!graph.contains(&id(ResourceKind::IamRole, "control-plane")));

        let role = graph.get(&id(ResourceKind::IamRole, "nodes")).unwrap();
        assert_eq!(role.attributes["policies"], json!(["a", "b"]));

        let deps = graph.dependencies(&id(ResourceKind::NodePool, "default"));
        assert!(deps.contains(&&id(ResourceKind::IamRole, "nodes")));
    }

    #[test]
    fn test_addons_wait_for_nodes_except_cni() {
        let mut spec = spec();
        spec.node_pools.push(pool("gpu"));
        spec.addons.dns.enabled = true;
        spec.addons.cni.enabled = true;

        let graph = GraphBuilder::new().build(&spec).unwrap();

        let dns = graph.get(&id(ResourceKind::Addon, "dns")).unwrap();
        assert_eq!(dns.dependencies.len(), 3);
        let cni = graph.get(&id(ResourceKind::Addon, "cni")).unwrap();
        assert_eq!(cni.dependencies, vec![id(ResourceKind::Cluster, "prod")]);
    }

    #[test]
    fn test_binding_precedes_addon() {
        let mut spec = spec();
        spec.iam.roles.push(IamRoleConfig {
            name: String::from("ebs"),
            arn: None,
            create: true,
            policies: vec![],
        });
        spec.iam.bindings.push(ServiceAccountBindingConfig {
            name: String::from("ebs-csi"),
            role: String::from("ebs"),
            namespace: String::from("kube-system"),
            service_account: String::from("ebs-csi-controller-sa"),
        });
        spec.addons.csi_driver.enabled = true;
        spec.addons.csi_driver.binding = Some(String::from("ebs-csi"));

        let graph = GraphBuilder::new().build(&spec).unwrap();
        let order = graph.topological_order();
        let pos = |i: NodeId| order.iter().position(|o| *o == i).unwrap();

        assert!(pos(id(ResourceKind::IamRole, "ebs")) < pos(id(ResourceKind::ServiceAccountBinding, "ebs-csi")));
        assert!(pos(id(ResourceKind::ServiceAccountBinding, "ebs-csi")) < pos(id(ResourceKind::Addon, "csi-driver")));
    }

    #[test]
    fn test_invalid_spec_never_builds() {
        let mut spec = spec();
        spec.node_pools.push(pool("default"));
        let err = GraphBuilder::new().build(&spec).unwrap_err();
        assert!(err.is_validation());
    }
}
