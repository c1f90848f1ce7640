//! Azure Resource Manager shapes for AKS.
//!
//! Every resource has a deterministic ARM path and is created with PUT, so a
//! repeated create is naturally idempotent.

use reqwest::Method;
use serde_json::{Value, json};

use super::DependencyOutputs;
use super::schema::{
    CloudSchema, attr, cluster_output, dependency_output, network_field, object, require_str,
    role_identifier, str_or_empty,
};
use super::transport::OutputField;
use crate::config::CloudTarget;
use crate::error::ProviderResult;
use crate::graph::{Attributes, NodeId, ResourceKind, ResourceNode};

const AKS_API_VERSION: &str = "2024-05-01";
const IDENTITY_API_VERSION: &str = "2023-01-31";
const EXTENSION_API_VERSION: &str = "2023-05-01";

const TOKEN_EXCHANGE_AUDIENCE: &str = "api://AzureADTokenExchange";

const ROLE_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/id"),
    OutputField::new("arn", "/id"),
    OutputField::new("principal_id", "/properties/principalId"),
    OutputField::new("client_id", "/properties/clientId"),
];

const CLUSTER_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/id"),
    OutputField::new("fqdn", "/properties/fqdn"),
    OutputField::new("oidc_issuer_url", "/properties/oidcIssuerProfile/issuerURL"),
    OutputField::new("status", "/properties/provisioningState"),
];

const POOL_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/id"),
    OutputField::new("status", "/properties/provisioningState"),
];

const ID_ONLY: &[OutputField] = &[OutputField::new("id", "/id")];

const ADDON_OUTPUTS: &[OutputField] = &[
    OutputField::new("id", "/id"),
    OutputField::new("status", "/properties/provisioningState"),
];

const CLUSTER_OBSERVED: &[OutputField] = &[OutputField::new(
    "kubernetes_version",
    "/properties/kubernetesVersion",
)];

const POOL_OBSERVED: &[OutputField] = &[
    OutputField::new("instance_class", "/properties/vmSize"),
    OutputField::new("min_count", "/properties/minCount"),
    OutputField::new("max_count", "/properties/maxCount"),
    OutputField::new("desired_count", "/properties/count"),
    OutputField::new("enable_autoscaling", "/properties/enableAutoScaling"),
];

const ADDON_OBSERVED: &[OutputField] = &[OutputField::new("version", "/properties/version")];

/// AKS schema scoped to one subscription and resource group.
#[derive(Debug, Clone)]
pub struct AzureSchema {
    subscription_id: String,
    resource_group: String,
}

impl AzureSchema {
    /// Creates a schema for a subscription and resource group.
    #[must_use]
    pub fn new(subscription_id: impl Into<String>, resource_group: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
        }
    }

    fn providers(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers",
            self.subscription_id, self.resource_group
        )
    }

    fn identity(&self, cluster: &str, role: &str) -> String {
        format!(
            "{}/Microsoft.ManagedIdentity/userAssignedIdentities/{cluster}-{role}",
            self.providers()
        )
    }

    fn managed_cluster(&self, cluster: &str) -> String {
        format!(
            "{}/Microsoft.ContainerService/managedClusters/{cluster}",
            self.providers()
        )
    }

    fn extension_type(name: &str) -> String {
        format!("microsoft.aks.{name}")
    }
}

impl CloudSchema for AzureSchema {
    fn cloud(&self) -> CloudTarget {
        CloudTarget::Azure
    }

    fn item_path(&self, id: &NodeId, attrs: &Attributes) -> String {
        let cluster = str_or_empty(attrs, "cluster");
        match id.kind() {
            ResourceKind::IamRole => {
                format!("{}?api-version={IDENTITY_API_VERSION}", self.identity(cluster, id.name()))
            }
            ResourceKind::Cluster => {
                format!("{}?api-version={AKS_API_VERSION}", self.managed_cluster(id.name()))
            }
            ResourceKind::NodePool => format!(
                "{}/agentPools/{}?api-version={AKS_API_VERSION}",
                self.managed_cluster(cluster),
                id.name()
            ),
            ResourceKind::ServiceAccountBinding => {
                let identity = attrs
                    .get("role_ref")
                    .and_then(Value::as_str)
                    .map_or_else(
                        || self.identity(cluster, str_or_empty(attrs, "role")),
                        str::to_string,
                    );
                format!(
                    "{identity}/federatedIdentityCredentials/{}?api-version={IDENTITY_API_VERSION}",
                    id.name()
                )
            }
            ResourceKind::Addon => format!(
                "{}/providers/Microsoft.KubernetesConfiguration/extensions/{}?api-version={EXTENSION_API_VERSION}",
                self.managed_cluster(cluster),
                id.name()
            ),
        }
    }

    fn create_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String) {
        (Method::PUT, self.item_path(id, attrs))
    }

    fn update_route(&self, id: &NodeId, attrs: &Attributes) -> (Method, String) {
        (Method::PUT, self.item_path(id, attrs))
    }

    fn payload(&self, node: &ResourceNode, deps: &DependencyOutputs) -> ProviderResult<Value> {
        let attrs = &node.attributes;
        let body = match node.kind() {
            ResourceKind::IamRole => json!({
                "location": attr(attrs, "region"),
                "tags": {
                    "kubeplan-cluster": attr(attrs, "cluster"),
                    "kubeplan-policies": attrs
                        .get("policies")
                        .and_then(Value::as_array)
                        .map(|p| p.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(","))
                        .unwrap_or_default(),
                },
            }),
            ResourceKind::Cluster => {
                let identity = match role_identifier(node, deps)? {
                    Some(role) => json!({
                        "type": "UserAssigned",
                        "userAssignedIdentities": { role: {} },
                    }),
                    None => json!({ "type": "SystemAssigned" }),
                };
                let plugin = network_field(attrs, "plugin");
                json!({
                    "location": attr(attrs, "region"),
                    "tags": attr(attrs, "tags"),
                    "identity": identity,
                    "properties": object([
                        ("kubernetesVersion", attr(attrs, "kubernetes_version")),
                        ("dnsPrefix", attr(attrs, "name")),
                        ("oidcIssuerProfile", json!({ "enabled": true })),
                        ("securityProfile", json!({ "workloadIdentity": { "enabled": true } })),
                        ("networkProfile", object([
                            ("networkPlugin", if plugin.is_null() { json!("azure") } else { plugin }),
                            ("podCidr", network_field(attrs, "pod_cidr")),
                            ("serviceCidr", network_field(attrs, "service_cidr")),
                            ("dnsServiceIP", network_field(attrs, "dns_service_ip")),
                        ])),
                        ("apiServerAccessProfile", json!({
                            "enablePrivateCluster": network_field(attrs, "private_endpoint"),
                        })),
                    ]),
                })
            }
            ResourceKind::NodePool => json!({
                "properties": object([
                    ("vmSize", attr(attrs, "instance_class")),
                    ("count", attr(attrs, "desired_count")),
                    ("minCount", attr(attrs, "min_count")),
                    ("maxCount", attr(attrs, "max_count")),
                    ("enableAutoScaling", attr(attrs, "enable_autoscaling")),
                    ("nodeLabels", attr(attrs, "labels")),
                    ("nodeTaints", attr(attrs, "taints")),
                    ("availabilityZones", attr(attrs, "zones")),
                    ("osDiskSizeGB", attr(attrs, "disk_size_gb")),
                    ("mode", json!("User")),
                ]),
            }),
            ResourceKind::ServiceAccountBinding => {
                let issuer = cluster_output(node, deps, "oidc_issuer_url")?;
                let namespace = require_str(&node.id, attrs, "namespace")?;
                let account = require_str(&node.id, attrs, "service_account")?;
                json!({
                    "properties": {
                        "issuer": issuer,
                        "subject": format!("system:serviceaccount:{namespace}:{account}"),
                        "audiences": [TOKEN_EXCHANGE_AUDIENCE],
                    },
                })
            }
            ResourceKind::Addon => {
                let service_account = match node.attr_str("binding") {
                    Some(binding) => Value::String(dependency_output(
                        deps,
                        &NodeId::new(ResourceKind::ServiceAccountBinding, binding),
                        "service_account",
                    )?),
                    None => Value::Null,
                };
                let version = attr(attrs, "version");
                json!({
                    "properties": object([
                        ("extensionType", json!(Self::extension_type(node.id.name()))),
                        ("autoUpgradeMinorVersion", json!(version.is_null())),
                        ("version", version),
                        ("configurationSettings", object([
                            ("serviceAccount.name", service_account),
                        ])),
                    ]),
                })
            }
        };
        Ok(body)
    }

    fn outputs(&self, kind: ResourceKind) -> &'static [OutputField] {
        match kind {
            ResourceKind::IamRole => ROLE_OUTPUTS,
            ResourceKind::Cluster => CLUSTER_OUTPUTS,
            ResourceKind::NodePool => POOL_OUTPUTS,
            ResourceKind::ServiceAccountBinding => ID_ONLY,
            ResourceKind::Addon => ADDON_OUTPUTS,
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
