//! Configuration module for kubeplan.
//!
//! This module handles everything that happens before a graph is built:
//! - Parsing and deserializing `kubeplan.yaml`
//! - Validation of cluster specs (names, counts, CIDRs, IAM references)
//! - Fingerprints for change detection and idempotent creates

mod cidr;
mod hash;
mod parser;
mod spec;
mod validator;

pub use cidr::Cidr;
pub use hash::SpecHasher;
pub use parser::{API_TOKEN_ENV, DEFAULT_MANIFEST_FILES, ManifestParser, find_manifest};
pub use spec::{
    AddonKind, AddonToggle, AddonsConfig, CloudTarget, ClusterConfig, ClusterManifest,
    ClusterSpec, DiffConfig, FailurePolicy, IamConfig, IamRoleConfig, NetworkConfig,
    NodePoolConfig, ProviderConfig, RetryConfig, SchedulerConfig, ServiceAccountBindingConfig,
    StateBackend, StateConfig, TaintConfig, TaintEffect,
};
pub use validator::{SpecValidator, ValidationError, ValidationResult, is_valid_name};
