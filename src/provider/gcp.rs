//! GKE and IAM service account request shapes.

use reqwest::Method;
use serde_json::{Value, json};

use super::DependencyOutputs;
use super::schema::{
    CloudSchema, attr, network_field, object, or_empty_object, require_str, role_identifier,
    str_or_empty, taints,
};
use super::transport::OutputField;
use crate::config::CloudTarget;
use crate::error::ProviderResult;
use crate::graph::{Attributes, NodeId, ResourceKind, ResourceNode};

const WORKLOAD_IDENTITY_ROLE: &str = "roles/iam.workloadIdentityUser";

const ROLE_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/uniqueId"),
    OutputField::new("arn", "/email"),
];

const CLUSTER_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/selfLink"),
    OutputField::new("endpoint", "/endpoint"),
    OutputField::new("workload_pool", "/workloadIdentityConfig/workloadPool"),
    OutputField::new("status", "/status"),
];

const SELF_LINK_STATUS: &[OutputField] = &[
    OutputField::new("id", "/selfLink"),
    OutputField::new("status", "/status"),
];

const BINDING_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/selfLink"),
    OutputField::new("role_arn", "/serviceAccount"),
];

const CLUSTER_OBSERVED: &[OutputField] =
    &[OutputField::new("kubernetes_version", "/initialClusterVersion")];

const POOL_OBSERVED: &[OutputField] = &[
    OutputField::new("instance_class", "/config/machineType"),
    OutputField::new("min_count", "/autoscaling/minNodeCount"),
    OutputField::new("max_count", "/autoscaling/maxNodeCount"),
    OutputField::new("desired_count", "/initialNodeCount"),
    OutputField::new("enable_autoscaling", "/autoscaling/enabled"),
];

const ADDON_OBSERVED: &[OutputField] = &[OutputField::new("version", "/version")];

/// GKE schema for one project.
#[derive(Debug, Clone)]
pub struct GcpSchema {
    project_id: String,
}

impl GcpSchema {
    /// Creates a schema for a project.
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }

    fn cluster_path(&self, region: &str, cluster: &str) -> String {
        format!(
            "/projects/{}/locations/{region}/clusters/{cluster}",
            self.project_id
        )
    }

    fn account_email(&self, attrs: &Attributes, name: &str) -> String {
        format!(
            "{}-{name}@{}.iam.gserviceaccount.com",
            str_or_empty(attrs, "cluster"),
            self.project_id
        )
    }

    fn workload_pool(&self) -> String {
        format!("{}.svc.id.goog", self.project_id)
    }
}

impl CloudSchema for GcpSchema {
    fn cloud(&self) -> CloudTarget {
        CloudTarget::Gcp
    }

    fn item_path(&self, id: &NodeId, attrs: &Attributes) -> String {
        let region = str_or_empty(attrs, "region");
        let cluster = str_or_empty(attrs, "cluster");
        match id.kind() {
            ResourceKind::IamRole => format!(
                "/projects/{}/serviceAccounts/{}",
                self.project_id,
                self.account_email(attrs, id.name())
            ),
            ResourceKind::Cluster => self.cluster_path(region, id.name()),
            ResourceKind::NodePool => {
                format!("{}/nodePools/{}", self.cluster_path(region, cluster), id.name())
            }
            ResourceKind::ServiceAccountBinding => format!(
                "{}/workloadIdentityBindings/{}",
                self.cluster_path(region, cluster),
                id.name()
            ),
            ResourceKind::Addon => {
                format!("{}/addons/{}", self.cluster_path(region, cluster), id.name())
            }
        }
    }

    fn create_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String) {
        let region = str_or_empty(attrs, "region");
        let cluster = str_or_empty(attrs, "cluster");
        match id.kind() {
            ResourceKind::IamRole => (
                Method::POST,
                format!("/projects/{}/serviceAccounts", self.project_id),
            ),
            ResourceKind::Cluster => (
                Method::POST,
                format!("/projects/{}/locations/{region}/clusters", self.project_id),
            ),
            ResourceKind::NodePool => (
                Method::POST,
                format!("{}/nodePools", self.cluster_path(region, cluster)),
            ),
            ResourceKind::ServiceAccountBinding | ResourceKind::Addon => {
                (Method::PUT, self.item_path(id, attrs))
            }
        }
    }

    fn update_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String) {
        let method = match id.kind() {
            ResourceKind::IamRole => Method::PATCH,
            _ => Method::PUT,
        };
        (method, self.item_path(id, attrs))
    }

    fn payload(&self, node: &ResourceNode, deps: &DependencyOutputs) -> ProviderResult<Value> {
        let attrs = &node.attributes;
        let role = role_identifier(node, deps)?.map_or(Value::Null, Value::String);
        let body = match node.kind() {
            ResourceKind::IamRole => {
                let cluster = require_str(&node.id, attrs, "cluster")?;
                json!({
                    "accountId": format!("{cluster}-{}", node.id.name()),
                    "serviceAccount": {
                        "displayName": format!("kubeplan {cluster} {}", node.id.name()),
                        "description": attrs
                            .get("policies")
                            .and_then(Value::as_array)
                            .map(|p| p.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" "))
                            .unwrap_or_default(),
                    },
                })
            }
            ResourceKind::Cluster => object([
                ("name", attr(attrs, "name")),
                ("initialClusterVersion", attr(attrs, "kubernetes_version")),
                ("resourceLabels", attr(attrs, "tags")),
                ("ipAllocationPolicy", object([
                    ("useIpAliases", json!(true)),
                    ("clusterIpv4CidrBlock", network_field(attrs, "pod_cidr")),
                    ("servicesIpv4CidrBlock", network_field(attrs, "service_cidr")),
                ])),
                ("privateClusterConfig", json!({
                    "enablePrivateEndpoint": network_field(attrs, "private_endpoint"),
                })),
                ("workloadIdentityConfig", json!({ "workloadPool": self.workload_pool() })),
                ("nodeConfig", object([("serviceAccount", role)])),
            ]),
            ResourceKind::NodePool => {
                let pool_taints: Vec<Value> = taints(attrs)
                    .into_iter()
                    .map(|t| {
                        let effect = match t.effect {
                            "PreferNoSchedule" => "PREFER_NO_SCHEDULE",
                            "NoExecute" => "NO_EXECUTE",
                            _ => "NO_SCHEDULE",
                        };
                        json!({
                            "key": t.key,
                            "value": t.value.unwrap_or_default(),
                            "effect": effect,
                        })
                    })
                    .collect();
                object([
                    ("name", attr(attrs, "name")),
                    ("initialNodeCount", attr(attrs, "desired_count")),
                    ("autoscaling", json!({
                        "enabled": attr(attrs, "enable_autoscaling"),
                        "minNodeCount": attr(attrs, "min_count"),
                        "maxNodeCount": attr(attrs, "max_count"),
                    })),
                    ("locations", attr(attrs, "zones")),
                    ("config", object([
                        ("machineType", attr(attrs, "instance_class")),
                        ("labels", or_empty_object(attr(attrs, "labels"))),
                        ("taints", json!(pool_taints)),
                        ("diskSizeGb", attr(attrs, "disk_size_gb")),
                        ("serviceAccount", role),
                    ])),
                ])
            }
            ResourceKind::ServiceAccountBinding => {
                let namespace = require_str(&node.id, attrs, "namespace")?;
                let account = require_str(&node.id, attrs, "service_account")?;
                object([
                    ("member", json!(format!(
                        "serviceAccount:{}[{namespace}/{account}]",
                        self.workload_pool()
                    ))),
                    ("role", json!(WORKLOAD_IDENTITY_ROLE)),
                    ("serviceAccount", role),
                ])
            }
            ResourceKind::Addon => object([
                ("name", attr(attrs, "name")),
                ("enabled", json!(true)),
                ("version", attr(attrs, "version")),
                ("binding", attr(attrs, "binding")),
            ]),
        };
        Ok(body)
    }

    fn outputs(&self, kind: ResourceKind) -> &'static [OutputField] {
        match kind {
            ResourceKind::IamRole => ROLE_OUTPUTS,
            ResourceKind::Cluster => CLUSTER_OUTPUTS,
            ResourceKind::NodePool | ResourceKind::Addon => SELF_LINK_STATUS,
            ResourceKind::ServiceAccountBinding => BINDING_OUTPUTS,
        }
    }

    fn observed(&self, kind: ResourceKind) -> &'static [OutputField] {
        match kind {
            ResourceKind::Cluster => CLUSTER_OBSERVED,
            ResourceKind::NodePool => POOL_OBSERVED,
            ResourceKind::Addon => ADDON_OBSERVED,
            ResourceKind::IamRole | ResourceKind::ServiceAccountBinding => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_pool_routes_use_cluster_location() {
        let schema = GcpSchema::new("acme");
        let id = NodeId::new(ResourceKind::NodePool, "default");
        let attrs = attrs(&[("cluster", json!("prod")), ("region", json!("europe-west1"))]);

        assert_eq!(
            schema.create_route(&id, &attrs),
            (
                Method::POST,
                String::from("/projects/acme/locations/europe-west1/clusters/prod/nodePools")
            )
        );
        assert_eq!(
            schema.update_route(&id, &attrs).1,
            "/projects/acme/locations/europe-west1/clusters/prod/nodePools/default"
        );
    }

    #[test]
    fn test_binding_member_uses_workload_pool() {
        let schema = GcpSchema::new("acme");
        let node = ResourceNode::new(
            NodeId::new(ResourceKind::ServiceAccountBinding, "dns"),
            attrs(&[
                ("cluster", json!("prod")),
                ("namespace", json!("kube-system")),
                ("service_account", json!("external-dns")),
                ("role_ref", json!("dns@acme.iam.gserviceaccount.com")),
            ]),
        );

        let body = schema.payload(&node, &DependencyOutputs::new()).unwrap();
        assert_eq!(
            body["member"],
            json!("serviceAccount:acme.svc.id.goog[kube-system/external-dns]")
        );
        assert_eq!(body["serviceAccount"], json!("dns@acme.iam.gserviceaccount.com"));
    }

    #[test]
    fn test_service_account_path() {
        let schema = GcpSchema::new("acme");
        let id = NodeId::new(ResourceKind::IamRole, "nodes");
        let attrs = attrs(&[("cluster", json!("prod"))]);
        assert_eq!(
            schema.item_path(&id, &attrs),
            "/projects/acme/serviceAccounts/prod-nodes@acme.iam.gserviceaccount.com"
        );
    }
}
