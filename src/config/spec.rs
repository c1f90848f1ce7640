//! Manifest and cluster specification types.
//!
//! This module defines all the structs that map to the `kubeplan.yaml`
//! manifest. A manifest holds one [`ClusterSpec`] (the desired state) plus
//! the settings that steer the reconciler itself: state backend, scheduler
//! bounds, diff tolerances and provider endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The root structure of a `kubeplan.yaml` manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterManifest {
    /// Desired state for the cluster and its dependent resources.
    #[serde(flatten)]
    pub spec: ClusterSpec,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Diff engine configuration.
    #[serde(default)]
    pub diff: DiffConfig,
    /// Cloud provider connection settings.
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Desired state of one managed Kubernetes cluster.
///
/// Immutable for the duration of a reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Target cloud.
    pub cloud: CloudTarget,
    /// Cluster identity and control-plane settings.
    pub cluster: ClusterConfig,
    /// Network attachment.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Node pools, in declaration order.
    #[serde(default)]
    pub node_pools: Vec<NodePoolConfig>,
    /// IAM roles and service-account bindings.
    #[serde(default)]
    pub iam: IamConfig,
    /// Add-on feature flags.
    #[serde(default)]
    pub addons: AddonsConfig,
}

/// Supported cloud targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CloudTarget {
    /// Azure Kubernetes Service.
    Azure,
    /// Amazon Elastic Kubernetes Service.
    Aws,
    /// Google Kubernetes Engine.
    Gcp,
}

/// Cluster identity and control-plane settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster name, unique within the target account/project.
    pub name: String,
    /// Region (Azure location, AWS region, GCP location).
    pub region: String,
    /// Kubernetes version; provider default when absent.
    #[serde(default)]
    pub kubernetes_version: Option<String>,
    /// Name of the IAM role the control plane runs as.
    #[serde(default)]
    pub role: Option<String>,
    /// Tags applied to the cluster resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Network attachment of the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Address range of the network the nodes attach to.
    #[serde(default)]
    pub cidr: Option<String>,
    /// Pod address range.
    #[serde(default)]
    pub pod_cidr: Option<String>,
    /// Kubernetes service address range.
    #[serde(default)]
    pub service_cidr: Option<String>,
    /// Cluster DNS service IP, must lie inside `service_cidr`.
    #[serde(default)]
    pub dns_service_ip: Option<String>,
    /// Existing subnet identifiers to attach to.
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Network plugin (e.g. "azure", "kubenet", "vpc-cni", "dataplane-v2").
    #[serde(default)]
    pub plugin: Option<String>,
    /// Whether the API server is only reachable privately.
    #[serde(default)]
    pub private_endpoint: bool,
}

/// Configuration for a single node pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodePoolConfig {
    /// Unique name for the pool within this cluster.
    pub name: String,
    /// Instance class (VM size, instance type or machine type).
    pub instance_class: String,
    /// Minimum node count.
    #[serde(default = "default_min_count")]
    pub min_count: u32,
    /// Maximum node count.
    #[serde(default = "default_max_count")]
    pub max_count: u32,
    /// Desired node count; defaults to `min_count`.
    #[serde(default)]
    pub desired_count: Option<u32>,
    /// Whether the provider autoscaler manages the count.
    #[serde(default)]
    pub enable_autoscaling: bool,
    /// Kubernetes node labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Kubernetes node taints.
    #[serde(default)]
    pub taints: Vec<TaintConfig>,
    /// Dedicated subnet range for this pool.
    #[serde(default)]
    pub subnet_cidr: Option<String>,
    /// Availability zones.
    #[serde(default)]
    pub zones: Vec<String>,
    /// OS disk size in GB.
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    /// Name of the IAM role the nodes run as.
    #[serde(default)]
    pub role: Option<String>,
}

/// A Kubernetes node taint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaintConfig {
    /// Taint key.
    pub key: String,
    /// Optional taint value.
    #[serde(default)]
    pub value: Option<String>,
    /// Taint effect.
    pub effect: TaintEffect,
}

/// Taint effects, spelled as Kubernetes spells them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaintEffect {
    /// Do not schedule new pods.
    NoSchedule,
    /// Avoid scheduling new pods.
    PreferNoSchedule,
    /// Evict running pods.
    NoExecute,
}

/// IAM roles and IRSA-equivalent bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IamConfig {
    /// Roles referenced by the cluster, node pools and bindings.
    #[serde(default)]
    pub roles: Vec<IamRoleConfig>,
    /// Service-account bindings.
    #[serde(default)]
    pub bindings: Vec<ServiceAccountBindingConfig>,
}

/// An IAM role: either an existing one referenced by identifier, or one to create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IamRoleConfig {
    /// Name used by references inside the manifest.
    pub name: String,
    /// Identifier of an existing role (ARN, resource id or service-account email).
    #[serde(default)]
    pub arn: Option<String>,
    /// Whether the reconciler creates the role.
    #[serde(default)]
    pub create: bool,
    /// Policies attached to a created role.
    #[serde(default)]
    pub policies: Vec<String>,
}

/// Trust relationship between an IAM role and a Kubernetes service account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAccountBindingConfig {
    /// Unique binding name.
    pub name: String,
    /// Name of the IAM role being bound.
    pub role: String,
    /// Kubernetes namespace of the service account.
    pub namespace: String,
    /// Kubernetes service account name.
    pub service_account: String,
}

/// Add-on feature flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonsConfig {
    /// Cluster DNS.
    #[serde(default)]
    pub dns: AddonToggle,
    /// Container network interface.
    #[serde(default)]
    pub cni: AddonToggle,
    /// Block storage CSI driver.
    #[serde(default)]
    pub csi_driver: AddonToggle,
    /// Cluster autoscaler.
    #[serde(default)]
    pub cluster_autoscaler: AddonToggle,
    /// Metrics and log collection.
    #[serde(default)]
    pub monitoring: AddonToggle,
}

/// Toggle and settings for a single add-on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonToggle {
    /// Whether the add-on is installed.
    #[serde(default)]
    pub enabled: bool,
    /// Pinned add-on version.
    #[serde(default)]
    pub version: Option<String>,
    /// Name of the service-account binding the add-on runs with.
    #[serde(default)]
    pub binding: Option<String>,
}

/// Known add-ons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddonKind {
    /// Cluster DNS.
    Dns,
    /// Container network interface.
    Cni,
    /// Block storage CSI driver.
    CsiDriver,
    /// Cluster autoscaler.
    ClusterAutoscaler,
    /// Metrics and log collection.
    Monitoring,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (for the local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region, AWS default when absent.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// One JSON file per resource in a local directory.
    #[default]
    Local,
    /// One object per resource in an S3 bucket.
    S3,
    /// Process-local, lost on exit.
    Memory,
}

/// Apply scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of provider operations in flight.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryConfig,
    /// What to do with unstarted work after a failure.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Exponential backoff policy for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Behaviour after an operation fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Block dependents, keep applying independent subtrees.
    #[default]
    Continue,
    /// Stop dispatching new operations after the first failure.
    Halt,
}

/// Diff engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffConfig {
    /// Extra fields to ignore per resource kind (e.g. `node-pool: [desired_count]`).
    #[serde(default)]
    pub ignore_fields: BTreeMap<String, Vec<String>>,
}

/// Cloud provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the cloud API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Azure subscription.
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Azure resource group.
    #[serde(default)]
    pub resource_group: Option<String>,
    /// AWS account.
    #[serde(default)]
    pub account_id: Option<String>,
    /// GCP project.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions

const fn default_min_count() -> u32 {
    1
}

const fn default_max_count() -> u32 {
    1
}

const fn default_max_workers() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            retry: RetryConfig::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            subscription_id: None,
            resource_group: None,
            account_id: None,
            project_id: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), honoring a provider hint.
    ///
    /// The delay grows as `initial * multiplier^(retry - 1)` and never
    /// exceeds `max_backoff_ms`; a larger provider hint wins over the curve
    /// but is capped the same way.
    #[must_use]
    pub fn delay_for(&self, retry: u32, hint_secs: Option<u64>) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let curve = (self.initial_backoff_ms as f64) * self.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let curve_ms = if curve.is_finite() {
            (curve as u64).min(self.max_backoff_ms)
        } else {
            self.max_backoff_ms
        };
        let hint_ms = hint_secs.map_or(0, |s| s.saturating_mul(1000).min(self.max_backoff_ms));
        Duration::from_millis(curve_ms.max(hint_ms))
    }
}

impl CloudTarget {
    /// Returns the lowercase name used in manifests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
        }
    }
}

impl std::fmt::Display for CloudTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoSchedule => "NoSchedule",
            Self::PreferNoSchedule => "PreferNoSchedule",
            Self::NoExecute => "NoExecute",
        };
        f.write_str(s)
    }
}

impl TaintConfig {
    /// Renders the taint as `key=value:Effect` (or `key:Effect`).
    #[must_use]
    pub fn render(&self) -> String {
        match &self.value {
            Some(value) => format!("{}={value}:{}", self.key, self.effect),
            None => format!("{}:{}", self.key, self.effect),
        }
    }
}

impl AddonKind {
    /// All add-ons, in graph order.
    pub const ALL: [Self; 5] = [
        Self::Cni,
        Self::Dns,
        Self::CsiDriver,
        Self::ClusterAutoscaler,
        Self::Monitoring,
    ];

    /// Node name of the add-on.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Cni => "cni",
            Self::CsiDriver => "csi-driver",
            Self::ClusterAutoscaler => "cluster-autoscaler",
            Self::Monitoring => "monitoring",
        }
    }

    /// Parses a node name back into an add-on.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether the add-on needs schedulable nodes before it can install.
    #[must_use]
    pub const fn requires_nodes(self) -> bool {
        !matches!(self, Self::Cni)
    }
}

impl AddonsConfig {
    /// Returns the toggle for an add-on.
    #[must_use]
    pub const fn toggle(&self, kind: AddonKind) -> &AddonToggle {
        match kind {
            AddonKind::Dns => &self.dns,
            AddonKind::Cni => &self.cni,
            AddonKind::CsiDriver => &self.csi_driver,
            AddonKind::ClusterAutoscaler => &self.cluster_autoscaler,
            AddonKind::Monitoring => &self.monitoring,
        }
    }

    /// Returns the enabled add-ons with their settings.
    #[must_use]
    pub fn enabled(&self) -> Vec<(AddonKind, &AddonToggle)> {
        AddonKind::ALL
            .into_iter()
            .map(|kind| (kind, self.toggle(kind)))
            .filter(|(_, toggle)| toggle.enabled)
            .collect()
    }
}

impl ClusterSpec {
    /// Returns node pool names in declaration order.
    #[must_use]
    pub fn node_pool_names(&self) -> Vec<&str> {
        self.node_pools.iter().map(|p| p.name.as_str()).collect()
    }

    /// Looks up a declared IAM role by name.
    #[must_use]
    pub fn role(&self, name: &str) -> Option<&IamRoleConfig> {
        self.iam.roles.iter().find(|r| r.name == name)
    }

    /// Looks up a declared service-account binding by name.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&ServiceAccountBindingConfig> {
        self.iam.bindings.iter().find(|b| b.name == name)
    }

    /// Returns true if any node pool is autoscaled.
    #[must_use]
    pub fn has_autoscaling(&self) -> bool {
        self.node_pools.iter().any(|p| p.enable_autoscaling)
    }
}

impl NodePoolConfig {
    /// Returns the desired count, defaulting to the minimum.
    #[must_use]
    pub fn effective_desired(&self) -> u32 {
        self.desired_count.unwrap_or(self.min_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_curve_is_capped() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        };

        assert_eq!(retry.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3, None), Duration::from_millis(400));
        assert_eq!(retry.delay_for(10, None), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_honors_retry_hint() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
        };

        assert_eq!(retry.delay_for(1, Some(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_taint_rendering() {
        let taint = TaintConfig {
            key: String::from("dedicated"),
            value: Some(String::from("gpu")),
            effect: TaintEffect::NoSchedule,
        };
        assert_eq!(taint.render(), "dedicated=gpu:NoSchedule");

        let bare = TaintConfig {
            key: String::from("spot"),
            value: None,
            effect: TaintEffect::PreferNoSchedule,
        };
        assert_eq!(bare.render(), "spot:PreferNoSchedule");
    }

    #[test]
    fn test_enabled_addons_in_graph_order() {
        let addons = AddonsConfig {
            dns: AddonToggle {
                enabled: true,
                ..AddonToggle::default()
            },
            cni: AddonToggle {
                enabled: true,
                ..AddonToggle::default()
            },
            ..AddonsConfig::default()
        };

        let names: Vec<_> = addons.enabled().iter().map(|(k, _)| k.name()).collect();
        assert_eq!(names, vec!["cni", "dns"]);
    }
}
