// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # kubeplan
//!
//! A provisioning reconciler for managed Kubernetes clusters on Azure (AKS),
//! AWS (EKS) and GCP (GKE).
//!
//! ## Overview
//!
//! A `ClusterSpec` describes one cluster with its node pools, IAM roles,
//! service-account bindings and add-ons. Each reconciliation pass:
//!
//! 1. **Builds** a resource graph from the cluster spec (validated, acyclic)
//! 2. **Diffs** the graph against the observed state recorded by earlier passes
//! 3. **Applies** the resulting ops in dependency order with bounded
//!    concurrency and retries, recording every confirmed change
//!
//! ## Modules
//!
//! - [`config`]: Manifest parsing, validation and fingerprints
//! - [`graph`]: Resource nodes and the dependency graph
//! - [`planner`]: Diff engine, execution plan and apply scheduler
//! - [`provider`]: Cloud schemas, HTTP and simulated transports
//! - [`state`]: Observed-state backends (local, S3, memory)
//! - [`reconciler`]: The reconciliation controller
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! cloud: aws
//! cluster:
//!   name: prod
//!   region: eu-west-1
//!   kubernetes_version: "1.30"
//!
//! node_pools:
//!   - name: default
//!     instance_class: m6i.large
//!     min_count: 1
//!     max_count: 3
//!     enable_autoscaling: true
//!
//! provider:
//!   account_id: "123456789012"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ClusterManifest, ClusterSpec, ManifestParser, SpecHasher, SpecValidator};
pub use error::{ReconcilerError, Result};
pub use graph::{GraphBuilder, NodeId, ResourceGraph, ResourceKind};
pub use planner::{ApplyScheduler, DiffEngine, ExecutionPlan};
pub use provider::{CloudProvider, HttpTransport, SimulatedCloud, provider_for};
pub use reconciler::{DriftReport, PlanReport, ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, ObservedState, S3StateStore, StateStore};
