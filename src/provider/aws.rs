//! EKS and IAM request shapes.

use reqwest::Method;
use serde_json::{Value, json};

use super::DependencyOutputs;
use super::schema::{
    CloudSchema, attr, dependency_output, network_field, object, require_str,
    role_identifier, str_or_empty, taints,
};
use super::transport::OutputField;
use crate::config::CloudTarget;
use crate::error::ProviderResult;
use crate::graph::{Attributes, NodeId, ResourceKind, ResourceNode};

const ROLE_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/RoleId"),
    OutputField::new("arn", "/Arn"),
];

const CLUSTER_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/arn"),
    OutputField::new("arn", "/arn"),
    OutputField::new("endpoint", "/endpoint"),
    OutputField::new("oidc_issuer_url", "/identity/oidc/issuer"),
    OutputField::new("certificate_authority", "/certificateAuthority/data"),
    OutputField::new("status", "/status"),
];

const POOL_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/nodegroupArn"),
    OutputField::new("arn", "/nodegroupArn"),
    OutputField::new("status", "/status"),
];

const BINDING_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/associationArn"),
    OutputField::new("association_id", "/associationId"),
    OutputField::new("role_arn", "/roleArn"),
];

const ADDON_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/addonArn"),
    OutputField::new("arn", "/addonArn"),
    OutputField::new("status", "/status"),
];

const CLUSTER_OBSERVED: &[OutputField] = &[OutputField::new("kubernetes_version", "/version")];

const POOL_OBSERVED: &[OutputField] = &[
    OutputField::new("instance_class", "/instanceTypes/0"),
    OutputField::new("min_count", "/scalingConfig/minSize"),
    OutputField::new("max_count", "/scalingConfig/maxSize"),
    OutputField::new("desired_count", "/scalingConfig/desiredSize"),
];

const BINDING_OBSERVED: &[OutputField] = &[
    OutputField::new("namespace", "/namespace"),
    OutputField::new("service_account", "/serviceAccount"),
];

const ADDON_OBSERVED: &[OutputField] = &[OutputField::new("version", "/addonVersion")];

/// EKS schema for one AWS account.
#[derive(Debug, Clone)]
pub struct AwsSchema {
    account_id: String,
}

impl AwsSchema {
    /// Creates a schema for an account.
    #[must_use]
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }

    /// EKS managed add-on name for an add-on kind.
    fn addon_name(name: &str) -> &str {
        match name {
            "dns" => "coredns",
            "cni" => "vpc-cni",
            "csi-driver" => "aws-ebs-csi-driver",
            "monitoring" => "amazon-cloudwatch-observability",
            other => other,
        }
    }

    fn collection(id: &NodeId, attrs: &Attributes) -> String {
        let cluster = str_or_empty(attrs, "cluster");
        match id.kind() {
            ResourceKind::IamRole => String::from("/iam/roles"),
            ResourceKind::Cluster => String::from("/clusters"),
            ResourceKind::NodePool => format!("/clusters/{cluster}/node-groups"),
            ResourceKind::ServiceAccountBinding => {
                format!("/clusters/{cluster}/pod-identity-associations")
            }
            ResourceKind::Addon => format!("/clusters/{cluster}/addons"),
        }
    }

    fn trust_policy(&self) -> Value {
        json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": ["eks.amazonaws.com", "ec2.amazonaws.com", "pods.eks.amazonaws.com"] },
                "Action": ["sts:AssumeRole", "sts:TagSession"],
                "Condition": { "StringEquals": { "aws:SourceAccount": self.account_id } },
            }],
        })
    }

    fn taint_effect(effect: &str) -> &'static str {
        match effect {
            "PreferNoSchedule" => "PREFER_NO_SCHEDULE",
            "NoExecute" => "NO_EXECUTE",
            _ => "NO_SCHEDULE",
        }
    }
}

impl CloudSchema for AwsSchema {
    fn cloud(&self) -> CloudTarget {
        CloudTarget::Aws
    }

    fn item_path(&self, id: &NodeId, attrs: &Attributes) -> String {
        let collection = Self::collection(id, attrs);
        match id.kind() {
            ResourceKind::IamRole => {
                format!("{collection}/{}-{}", str_or_empty(attrs, "cluster"), id.name())
            }
            ResourceKind::Addon => format!("{collection}/{}", Self::addon_name(id.name())),
            _ => format!("{collection}/{}", id.name()),
        }
    }

    fn create_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String) {
        (Method::POST, Self::collection(id, attrs))
    }

    fn update_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String) {
        let item = self.item_path(id, attrs);
        match id.kind() {
            ResourceKind::IamRole => (Method::PUT, item),
            ResourceKind::Addon => (Method::POST, format!("{item}/update")),
            _ => (Method::POST, format!("{item}/update-config")),
        }
    }

    fn payload(&self, node: &ResourceNode, deps: &DependencyOutputs) -> ProviderResult<Value> {
        let attrs = &node.attributes;
        let body = match node.kind() {
            ResourceKind::IamRole => {
                let cluster = require_str(&node.id, attrs, "cluster")?;
                json!({
                    "RoleName": format!("{cluster}-{}", node.id.name()),
                    "AssumeRolePolicyDocument": self.trust_policy(),
                    "ManagedPolicyArns": attrs.get("policies").cloned().unwrap_or_else(|| json!([])),
                    "Tags": [{ "Key": "kubeplan-cluster", "Value": cluster }],
                })
            }
            ResourceKind::Cluster => {
                let private = network_field(attrs, "private_endpoint").as_bool().unwrap_or(false);
                object([
                    ("name", attr(attrs, "name")),
                    ("version", attr(attrs, "kubernetes_version")),
                    ("roleArn", role_identifier(node, deps)?.map_or(Value::Null, Value::String)),
                    ("resourcesVpcConfig", object([
                        ("subnetIds", network_field(attrs, "subnet_ids")),
                        ("endpointPrivateAccess", json!(private)),
                        ("endpointPublicAccess", json!(!private)),
                    ])),
                    ("kubernetesNetworkConfig", object([
                        ("serviceIpv4Cidr", network_field(attrs, "service_cidr")),
                    ])),
                    ("tags", attr(attrs, "tags")),
                ])
            }
            ResourceKind::NodePool => {
                let pool_taints: Vec<Value> = taints(attrs)
                    .into_iter()
                    .map(|t| {
                        object([
                            ("key", json!(t.key)),
                            ("value", t.value.map_or(Value::Null, |v| json!(v))),
                            ("effect", json!(Self::taint_effect(t.effect))),
                        ])
                    })
                    .collect();
                object([
                    ("nodegroupName", attr(attrs, "name")),
                    ("scalingConfig", json!({
                        "minSize": attr(attrs, "min_count"),
                        "maxSize": attr(attrs, "max_count"),
                        "desiredSize": attr(attrs, "desired_count"),
                    })),
                    ("instanceTypes", json!([attr(attrs, "instance_class")])),
                    ("labels", attr(attrs, "labels")),
                    ("taints", if pool_taints.is_empty() { Value::Null } else { json!(pool_taints) }),
                    ("diskSize", attr(attrs, "disk_size_gb")),
                    ("nodeRole", role_identifier(node, deps)?.map_or(Value::Null, Value::String)),
                ])
            }
            ResourceKind::ServiceAccountBinding => object([
                ("namespace", attr(attrs, "namespace")),
                ("serviceAccount", attr(attrs, "service_account")),
                ("roleArn", role_identifier(node, deps)?.map_or(Value::Null, Value::String)),
            ]),
            ResourceKind::Addon => {
                let role_arn = match node.attr_str("binding") {
                    Some(binding) => Value::String(dependency_output(
                        deps,
                        &NodeId::new(ResourceKind::ServiceAccountBinding, binding),
                        "role_arn",
                    )?),
                    None => Value::Null,
                };
                object([
                    ("addonName", json!(Self::addon_name(node.id.name()))),
                    ("addonVersion", attr(attrs, "version")),
                    ("serviceAccountRoleArn", role_arn),
                    ("resolveConflicts", json!("OVERWRITE")),
                ])
            }
        };
        Ok(body)
    }

    fn outputs(&self, kind: ResourceKind) -> &'static [OutputField] {
        match kind {
            ResourceKind::IamRole => ROLE_OUTPUTS,
            ResourceKind::Cluster => CLUSTER_OUTPUTS,
            ResourceKind::NodePool => POOL_OUTPUTS,
            ResourceKind::ServiceAccountBinding => BINDING_OUTPUTS,
            ResourceKind::Addon => ADDON_OUTPUTS,
        }
    }

    fn observed(&self, kind: ResourceKind) -> &'static [OutputField] {
        match kind {
            ResourceKind::Cluster => CLUSTER_OBSERVED,
            ResourceKind::NodePool => POOL_OBSERVED,
            ResourceKind::ServiceAccountBinding => BINDING_OBSERVED,
            ResourceKind::Addon => ADDON_OBSERVED,
            ResourceKind::IamRole => &[],
        }
    }

    fn envelope(&self, kind: ResourceKind) -> Option<&'static str> {
        Some(match kind {
            ResourceKind::IamRole => "Role",
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodePool => "nodegroup",
            ResourceKind::ServiceAccountBinding => "association",
            ResourceKind::Addon => "addon",
        })
    }

    fn client_token_field(&self, kind: ResourceKind) -> Option<&'static str> {
        match kind {
            ResourceKind::IamRole => None,
            _ => Some("clientRequestToken"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ResourceNode {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("name"), json!("default"));
        attrs.insert(String::from("cluster"), json!("prod"));
        attrs.insert(String::from("instance_class"), json!("m6i.large"));
        attrs.insert(String::from("min_count"), json!(1));
        attrs.insert(String::from("max_count"), json!(5));
        attrs.insert(String::from("desired_count"), json!(2));
        attrs.insert(String::from("taints"), json!(["dedicated=gpu:NoSchedule"]));
        attrs.insert(String::from("role"), json!("nodes"));
        ResourceNode::new(NodeId::new(ResourceKind::NodePool, "default"), attrs)
    }

    #[test]
    fn test_routes() {
        let schema = AwsSchema::new("123456789012");
        let node = pool();

        assert_eq!(
            schema.create_route(&node.id, &node.attributes),
            (Method::POST, String::from("/clusters/prod/node-groups"))
        );
        assert_eq!(
            schema.update_route(&node.id, &node.attributes),
            (Method::POST, String::from("/clusters/prod/node-groups/default/update-config"))
        );

        let addon = NodeId::new(ResourceKind::Addon, "dns");
        let mut attrs = Attributes::new();
        attrs.insert(String::from("cluster"), json!("prod"));
        assert_eq!(schema.item_path(&addon, &attrs), "/clusters/prod/addons/coredns");
    }

    #[test]
    fn test_pool_payload_resolves_node_role() {
        let schema = AwsSchema::new("123456789012");
        let mut role = Attributes::new();
        role.insert(String::from("arn"), json!("arn:aws:iam::123456789012:role/prod-nodes"));
        let mut deps = DependencyOutputs::new();
        deps.insert(NodeId::new(ResourceKind::IamRole, "nodes"), role);

        let body = schema.payload(&pool(), &deps).unwrap();

        assert_eq!(body["nodeRole"], json!("arn:aws:iam::123456789012:role/prod-nodes"));
        assert_eq!(body["scalingConfig"]["maxSize"], json!(5));
        assert_eq!(
            body["taints"],
            json!([{"key": "dedicated", "value": "gpu", "effect": "NO_SCHEDULE"}])
        );
    }

    #[test]
    fn test_tokens_on_eks_resources_only() {
        let schema = AwsSchema::new("1");
        assert_eq!(schema.client_token_field(ResourceKind::Cluster), Some("clientRequestToken"));
        assert_eq!(schema.client_token_field(ResourceKind::IamRole), None);
        assert_eq!(schema.envelope(ResourceKind::NodePool), Some("nodegroup"));
    }
}
