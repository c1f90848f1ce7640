//! Validation of cluster specs and manifests.
//!
//! Every rule runs before any provider call. All problems are collected into a
//! [`ValidationResult`]; the first error is returned and the rest are logged.

use crate::error::{ConfigError, ReconcilerError, Result};
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, warn};

use super::cidr::Cidr;
use super::spec::{ClusterManifest, ClusterSpec, CloudTarget, NodePoolConfig, StateBackend};

/// Validator for cluster specs.
#[derive(Debug, Default)]
pub struct SpecValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl SpecValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a cluster spec.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, spec: &ClusterSpec) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();
        Self::check_spec(spec, &mut result);
        Self::finish(result)
    }

    /// Validates a full manifest: the cluster spec plus state and provider sections.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate_manifest(&self, manifest: &ClusterManifest) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();
        Self::check_spec(&manifest.spec, &mut result);
        Self::check_state(manifest, &mut result);
        Self::check_provider_identity(manifest, &mut result);
        Self::check_scheduler(manifest, &mut result);
        Self::finish(result)
    }

    /// Collects all spec-level problems without failing.
    #[must_use]
    pub fn collect(&self, spec: &ClusterSpec) -> ValidationResult {
        let mut result = ValidationResult::default();
        Self::check_spec(spec, &mut result);
        result
    }

    fn finish(result: ValidationResult) -> Result<ValidationResult> {
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let Some(first) = result.errors.first() else {
            debug!("Spec validation passed");
            return Ok(result);
        };

        for extra in result.errors.iter().skip(1) {
            warn!("Additional validation error: {extra}");
        }

        Err(ReconcilerError::Config(ConfigError::ValidationError {
            message: first.message.clone(),
            field: Some(first.field.clone()),
        }))
    }

    fn check_spec(spec: &ClusterSpec, result: &mut ValidationResult) {
        Self::check_cluster(spec, result);
        Self::check_network(spec, result);
        Self::check_node_pools(spec, result);
        Self::check_iam(spec, result);
        Self::check_addons(spec, result);
    }

    fn check_cluster(spec: &ClusterSpec, result: &mut ValidationResult) {
        check_name(&spec.cluster.name, "cluster.name", result);

        if spec.cluster.region.trim().is_empty() {
            result.error("cluster.region", "Region cannot be empty");
        }

        if let Some(role) = &spec.cluster.role {
            Self::check_role_ref(spec, role, "cluster.role", result);
        }
    }

    fn check_network(spec: &ClusterSpec, result: &mut ValidationResult) {
        let network = &spec.network;
        let mut ranges: Vec<(String, Cidr)> = Vec::new();

        for (field, value) in [
            ("network.cidr", &network.cidr),
            ("network.pod_cidr", &network.pod_cidr),
            ("network.service_cidr", &network.service_cidr),
        ] {
            if let Some(cidr) = value.as_deref().and_then(|v| parse_cidr(v, field, result)) {
                ranges.push((field.to_string(), cidr));
            }
        }

        // Pod and service ranges must be disjoint from each other and from the
        // node network.
        for i in 0..ranges.len() {
            for j in (i + 1)..ranges.len() {
                if ranges[i].1.overlaps(&ranges[j].1) {
                    result.error(
                        &ranges[j].0,
                        format!(
                            "{} ({}) overlaps {} ({})",
                            ranges[j].0, ranges[j].1, ranges[i].0, ranges[i].1
                        ),
                    );
                }
            }
        }

        let service = ranges
            .iter()
            .find(|(f, _)| f == "network.service_cidr")
            .map(|(_, c)| *c);

        if let Some(ip) = &network.dns_service_ip {
            match ip.parse::<IpAddr>() {
                Ok(addr) => match service {
                    Some(service) if !service.contains(addr) => result.error(
                        "network.dns_service_ip",
                        format!("DNS service IP {addr} is outside the service CIDR {service}"),
                    ),
                    None if network.service_cidr.is_none() => result.error(
                        "network.dns_service_ip",
                        "DNS service IP requires network.service_cidr",
                    ),
                    _ => {}
                },
                Err(_) => result.error(
                    "network.dns_service_ip",
                    format!("Invalid IP address: {ip}"),
                ),
            }
        }

        let node_network = ranges
            .iter()
            .find(|(f, _)| f == "network.cidr")
            .map(|(_, c)| *c);

        let mut subnets: Vec<(String, Cidr)> = Vec::new();
        for (i, pool) in spec.node_pools.iter().enumerate() {
            let field = format!("node_pools[{i}].subnet_cidr");
            let Some(subnet) = pool
                .subnet_cidr
                .as_deref()
                .and_then(|v| parse_cidr(v, &field, result))
            else {
                continue;
            };

            if let Some(parent) = node_network
                && !parent.contains_cidr(&subnet)
            {
                result.error(
                    &field,
                    format!("Subnet {subnet} of pool '{}' is outside network {parent}", pool.name),
                );
            }

            for (other_field, other) in ranges.iter().filter(|(f, _)| f != "network.cidr") {
                if subnet.overlaps(other) {
                    result.error(
                        &field,
                        format!("Subnet {subnet} of pool '{}' overlaps {other_field} ({other})", pool.name),
                    );
                }
            }

            for (other_field, other) in &subnets {
                if subnet.overlaps(other) {
                    result.error(
                        &field,
                        format!("Subnet {subnet} overlaps {other_field} ({other})"),
                    );
                }
            }

            subnets.push((field, subnet));
        }
    }

    fn check_node_pools(spec: &ClusterSpec, result: &mut ValidationResult) {
        if spec.node_pools.is_empty() {
            result
                .warnings
                .push(String::from("No node pools defined; workloads cannot be scheduled"));
        }

        let mut seen = HashSet::new();
        for (i, pool) in spec.node_pools.iter().enumerate() {
            let prefix = format!("node_pools[{i}]");

            if !seen.insert(pool.name.as_str()) {
                result.error(
                    &format!("{prefix}.name"),
                    format!("Duplicate node pool name: {}", pool.name),
                );
            }

            check_name(&pool.name, &format!("{prefix}.name"), result);

            if pool.instance_class.trim().is_empty() {
                result.error(
                    &format!("{prefix}.instance_class"),
                    "Instance class cannot be empty",
                );
            }

            Self::check_counts(pool, &prefix, result);

            if let Some(role) = &pool.role {
                Self::check_role_ref(spec, role, &format!("{prefix}.role"), result);
            }

            if pool.disk_size_gb == Some(0) {
                result.error(&format!("{prefix}.disk_size_gb"), "Disk size must be positive");
            }
        }
    }

    fn check_counts(pool: &NodePoolConfig, prefix: &str, result: &mut ValidationResult) {
        if pool.max_count == 0 {
            result.error(&format!("{prefix}.max_count"), "max_count must be at least 1");
        }

        if pool.min_count > pool.max_count {
            result.error(
                &format!("{prefix}.min_count"),
                format!(
                    "min_count ({}) exceeds max_count ({})",
                    pool.min_count, pool.max_count
                ),
            );
        }

        if let Some(desired) = pool.desired_count
            && (desired < pool.min_count || desired > pool.max_count)
        {
            result.error(
                &format!("{prefix}.desired_count"),
                format!(
                    "desired_count ({desired}) is outside [{}, {}]",
                    pool.min_count, pool.max_count
                ),
            );
        }
    }

    fn check_iam(spec: &ClusterSpec, result: &mut ValidationResult) {
        let mut seen_roles = HashSet::new();
        for (i, role) in spec.iam.roles.iter().enumerate() {
            let prefix = format!("iam.roles[{i}]");

            if !seen_roles.insert(role.name.as_str()) {
                result.error(
                    &format!("{prefix}.name"),
                    format!("Duplicate IAM role name: {}", role.name),
                );
            }
            check_name(&role.name, &format!("{prefix}.name"), result);

            match (&role.arn, role.create) {
                (Some(_), true) => result.error(
                    &prefix,
                    format!("IAM role '{}' sets both arn and create", role.name),
                ),
                (None, false) => result.error(
                    &prefix,
                    format!(
                        "IAM role '{}' needs either an existing arn or create: true",
                        role.name
                    ),
                ),
                (Some(arn), false) if arn.trim().is_empty() => result.error(
                    &format!("{prefix}.arn"),
                    format!("IAM role '{}' has an empty arn", role.name),
                ),
                _ => {}
            }

            if !role.policies.is_empty() && !role.create {
                result.warnings.push(format!(
                    "{prefix}.policies: policies are ignored for existing role '{}'",
                    role.name
                ));
            }
        }

        let mut seen_bindings = HashSet::new();
        for (i, binding) in spec.iam.bindings.iter().enumerate() {
            let prefix = format!("iam.bindings[{i}]");

            if !seen_bindings.insert(binding.name.as_str()) {
                result.error(
                    &format!("{prefix}.name"),
                    format!("Duplicate binding name: {}", binding.name),
                );
            }
            check_name(&binding.name, &format!("{prefix}.name"), result);
            Self::check_role_ref(spec, &binding.role, &format!("{prefix}.role"), result);

            if binding.namespace.trim().is_empty() || binding.service_account.trim().is_empty() {
                result.error(
                    &prefix,
                    format!(
                        "Binding '{}' needs both namespace and service_account",
                        binding.name
                    ),
                );
            }
        }
    }

    fn check_addons(spec: &ClusterSpec, result: &mut ValidationResult) {
        for (kind, toggle) in spec.addons.enabled() {
            if let Some(binding) = &toggle.binding
                && spec.binding(binding).is_none()
            {
                result.error(
                    &format!("addons.{}.binding", kind.name()),
                    format!("Add-on '{}' references unknown binding '{binding}'", kind.name()),
                );
            }
        }

        if spec.addons.cluster_autoscaler.enabled && !spec.has_autoscaling() {
            result.warnings.push(String::from(
                "addons.cluster_autoscaler is enabled but no node pool has enable_autoscaling",
            ));
        }
    }

    fn check_role_ref(spec: &ClusterSpec, role: &str, field: &str, result: &mut ValidationResult) {
        match spec.role(role) {
            None => result.error(
                field,
                format!("IAM role '{role}' is not declared in iam.roles"),
            ),
            Some(declared) if declared.arn.is_none() && !declared.create => result.error(
                field,
                format!("IAM role '{role}' has neither an existing arn nor create: true"),
            ),
            Some(_) => {}
        }
    }

    fn check_state(manifest: &ClusterManifest, result: &mut ValidationResult) {
        if manifest.state.backend == StateBackend::S3
            && manifest.state.bucket.as_ref().is_none_or(String::is_empty)
        {
            result.error(
                "state.bucket",
                "S3 bucket name is required when using S3 backend",
            );
        }
    }

    fn check_provider_identity(manifest: &ClusterManifest, result: &mut ValidationResult) {
        let provider = &manifest.provider;
        let required: Vec<(&str, &Option<String>)> = match manifest.spec.cloud {
            CloudTarget::Azure => vec![
                ("provider.subscription_id", &provider.subscription_id),
                ("provider.resource_group", &provider.resource_group),
            ],
            CloudTarget::Aws => vec![("provider.account_id", &provider.account_id)],
            CloudTarget::Gcp => vec![("provider.project_id", &provider.project_id)],
        };

        for (field, value) in required {
            if value.as_ref().is_none_or(|v| v.trim().is_empty()) {
                result.error(
                    field,
                    format!("{field} is required for cloud '{}'", manifest.spec.cloud),
                );
            }
        }

        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Timeout must be positive");
        }
    }

    fn check_scheduler(manifest: &ClusterManifest, result: &mut ValidationResult) {
        let scheduler = &manifest.scheduler;
        if scheduler.max_workers == 0 {
            result.error("scheduler.max_workers", "max_workers must be at least 1");
        }
        if scheduler.retry.max_attempts == 0 {
            result.error("scheduler.retry.max_attempts", "max_attempts must be at least 1");
        }
        if scheduler.retry.multiplier < 1.0 {
            result.error("scheduler.retry.multiplier", "multiplier must be at least 1.0");
        }
    }
}

fn parse_cidr(value: &str, field: &str, result: &mut ValidationResult) -> Option<Cidr> {
    match value.parse::<Cidr>() {
        Ok(cidr) => Some(cidr),
        Err(e) => {
            result.error(field, e.to_string());
            None
        }
    }
}

fn check_name(name: &str, field: &str, result: &mut ValidationResult) {
    if name.is_empty() {
        result.error(field, "Name cannot be empty");
    } else if !is_valid_name(name) {
        result.error(
            field,
            format!("Name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
        );
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{
        AddonsConfig, ClusterConfig, IamConfig, IamRoleConfig, NetworkConfig,
    };
    use std::collections::BTreeMap;

    fn pool(name: &str) -> NodePoolConfig {
        NodePoolConfig {
            name: name.to_string(),
            instance_class: String::from("Standard_D4s_v5"),
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
            cloud: CloudTarget::Azure,
            cluster: ClusterConfig {
                name: String::from("prod"),
                region: String::from("westeurope"),
                kubernetes_version: None,
                role: None,
                tags: BTreeMap::new(),
            },
            network: NetworkConfig {
                cidr: Some(String::from("10.0.0.0/16")),
                pod_cidr: Some(String::from("10.244.0.0/16")),
                service_cidr: Some(String::from("10.96.0.0/16")),
                dns_service_ip: Some(String::from("10.96.0.10")),
                ..NetworkConfig::default()
            },
            node_pools: vec![pool("default")],
            iam: IamConfig::default(),
            addons: AddonsConfig::default(),
        }
    }

    fn first_field(spec: &ClusterSpec) -> String {
        SpecValidator::new().collect(spec).errors[0].field.clone()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("default"));
        assert!(is_valid_name("gpu-pool-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Default"));
        assert!(!is_valid_name("2pool"));
        assert!(!is_valid_name("pool_a"));
        assert!(!is_valid_name("pool-"));
        assert!(!is_valid_name("pool--a"));
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(SpecValidator::new().validate(&spec()).is_ok());
    }

    #[test]
    fn test_pod_cidr_overlapping_network_rejected() {
        let mut spec = spec();
        spec.network.pod_cidr = Some(String::from("10.0.128.0/17"));
        assert_eq!(first_field(&spec), "network.pod_cidr");
    }

    #[test]
    fn test_pool_subnets_must_not_overlap() {
        let mut spec = spec();
        let mut a = pool("a");
        a.subnet_cidr = Some(String::from("10.0.0.0/24"));
        let mut b = pool("b");
        b.subnet_cidr = Some(String::from("10.0.0.128/25"));
        spec.node_pools = vec![a, b];

        let result = SpecValidator::new().collect(&spec);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "node_pools[1].subnet_cidr");
    }

    #[test]
    fn test_dns_ip_outside_service_cidr() {
        let mut spec = spec();
        spec.network.dns_service_ip = Some(String::from("10.97.0.10"));
        assert_eq!(first_field(&spec), "network.dns_service_ip");
    }

    #[test]
    fn test_duplicate_pool_rejected() {
        let mut spec = spec();
        spec.node_pools.push(pool("default"));
        let err = SpecValidator::new().validate(&spec).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("Duplicate node pool name"));
    }

    #[test]
    fn test_inconsistent_counts() {
        let mut spec = spec();
        spec.node_pools[0].min_count = 4;
        assert_eq!(first_field(&spec), "node_pools[0].min_count");

        let mut spec = self::spec();
        spec.node_pools[0].desired_count = Some(9);
        assert_eq!(first_field(&spec), "node_pools[0].desired_count");
    }

    #[test]
    fn test_unresolvable_role_reference() {
        let mut spec = spec();
        spec.node_pools[0].role = Some(String::from("nodes"));
        assert_eq!(first_field(&spec), "node_pools[0].role");

        spec.iam.roles.push(IamRoleConfig {
            name: String::from("nodes"),
            arn: None,
            create: true,
            policies: vec![],
        });
        assert!(SpecValidator::new().validate(&spec).is_ok());
    }

    #[test]
    fn test_provider_identity_required() {
        let manifest = ClusterManifest {
            spec: spec(),
            state: Default::default(),
            scheduler: Default::default(),
            diff: Default::default(),
            provider: Default::default(),
        };

        let err = SpecValidator::new().validate_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("subscription_id"));
    }
}
