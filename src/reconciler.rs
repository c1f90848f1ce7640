//! Reconciliation controller.
//!
//! One pass validates the cluster spec and builds the resource graph, takes the state
//! lock, diffs the graph against the stored snapshot, applies the resulting
//! plan and releases the lock. Plan, drift check and destroy reuse the same
//! pieces.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterManifest, ClusterSpec, SchedulerConfig, SpecHasher};
use crate::error::{ApplyError, ProviderError, ReconcileError, ReconcilerError, Result};
use crate::graph::{GraphBuilder, NodeId, ResourceGraph, ResourceKind};
use crate::planner::{
    ApplyReport, ApplyScheduler, ComputedFields, DiffEngine, DiffResult, ExecutionPlan,
    FieldChange, NodeOutcome, OpKind, Transition,
};
use crate::provider::CloudProvider;
use crate::state::{LockInfo, ObservedSnapshot, StateStore, generate_holder_id};

/// Drives reconciliation passes for one cluster.
pub struct Reconciler {
    provider: Arc<dyn CloudProvider>,
    store: Arc<dyn StateStore>,
    scheduler: SchedulerConfig,
    builder: GraphBuilder,
    diff_engine: DiffEngine,
    hasher: SpecHasher,
    holder: String,
    cancel: CancellationToken,
}

/// A node that failed or never started.
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    /// Node identifier.
    pub node_id: NodeId,
    /// Operation that was planned.
    pub op: OpKind,
    /// Rendered error.
    pub error: String,
    /// Typed error.
    #[serde(skip)]
    pub cause: ApplyError,
}

/// Values other tooling needs after a pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ClusterOutputs {
    /// Provider identifier of the cluster.
    pub cluster_id: Option<String>,
    /// API server endpoint (or FQDN).
    pub endpoint: Option<String>,
    /// OIDC issuer for workload identity.
    pub oidc_issuer_url: Option<String>,
    /// Node-pool name to provider identifier.
    pub node_pools: BTreeMap<String, String>,
    /// Network profile as applied.
    pub network: Option<Value>,
}

impl ClusterOutputs {
    /// Projects outputs from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &ObservedSnapshot) -> Self {
        let mut outputs = Self::default();
        for (id, state) in snapshot {
            match id.kind() {
                ResourceKind::Cluster => {
                    outputs.cluster_id = Some(state.provider_id.clone());
                    outputs.endpoint = state
                        .attr_str("endpoint")
                        .or_else(|| state.attr_str("fqdn"))
                        .map(str::to_string);
                    outputs.oidc_issuer_url = state.attr_str("oidc_issuer_url").map(str::to_string);
                    outputs.network = state.attributes.get("network").cloned();
                }
                ResourceKind::NodePool => {
                    outputs
                        .node_pools
                        .insert(id.name().to_string(), state.provider_id.clone());
                }
                _ => {}
            }
        }
        outputs
    }
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    /// Whether every node ended applied or unchanged.
    pub success: bool,
    /// Nodes whose op succeeded.
    pub applied: Vec<NodeId>,
    /// Nodes whose op failed.
    pub failed: Vec<NodeFailure>,
    /// Nodes that never started.
    pub blocked: Vec<NodeFailure>,
    /// Nodes that needed no change.
    pub unchanged: Vec<NodeId>,
    /// Number of nodes created.
    pub created: usize,
    /// Number of nodes updated.
    pub updated: usize,
    /// Number of nodes deleted.
    pub deleted: usize,
    /// Projected outputs.
    pub outputs: ClusterOutputs,
    /// Lifecycle transitions in order.
    pub transitions: Vec<Transition>,
}

impl ReconciliationResult {
    fn from_report(report: &ApplyReport, outputs: ClusterOutputs) -> Self {
        let mut failed = Vec::new();
        let mut blocked = Vec::new();
        for (id, outcome) in &report.outcomes {
            match outcome {
                NodeOutcome::Failed { op, error, .. } => failed.push(NodeFailure {
                    node_id: id.clone(),
                    op: *op,
                    error: error.to_string(),
                    cause: error.clone(),
                }),
                NodeOutcome::Blocked { op, reason } => blocked.push(NodeFailure {
                    node_id: id.clone(),
                    op: *op,
                    error: reason.to_string(),
                    cause: reason.clone(),
                }),
                NodeOutcome::Applied { .. } | NodeOutcome::Unchanged => {}
            }
        }

        Self {
            success: report.is_success(),
            applied: report.applied(),
            failed,
            blocked,
            unchanged: report.unchanged(),
            created: report.count_applied(OpKind::Create),
            updated: report.count_applied(OpKind::Update),
            deleted: report.count_applied(OpKind::Delete),
            outputs,
            transitions: report.transitions.clone(),
        }
    }
}

/// What a pass would do.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    /// Per-node diff.
    pub diff: DiffResult,
    /// Ordered steps.
    pub plan: ExecutionPlan,
}

/// Differences between one stored node and its live resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Node identifier.
    pub node_id: NodeId,
    /// Fields whose live value differs from the stored one.
    pub fields: Vec<FieldChange>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Nodes whose live attributes differ from state.
    pub drifted: Vec<DriftEntry>,
    /// Nodes recorded in state whose resource no longer exists.
    pub missing: Vec<NodeId>,
    /// Nodes that could not be read.
    pub errors: Vec<(NodeId, String)>,
    /// Nodes checked.
    pub checked: usize,
    /// Ops a pass would perform against the stored snapshot.
    pub pending_changes: usize,
}

impl DriftReport {
    /// Returns true if live resources match state.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty() && self.missing.is_empty()
    }
}

impl Reconciler {
    /// Creates a reconciler with default scheduling and diff settings.
    #[must_use]
    pub fn new(provider: Arc<dyn CloudProvider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            scheduler: SchedulerConfig::default(),
            builder: GraphBuilder::new(),
            diff_engine: DiffEngine::new(),
            hasher: SpecHasher::new(),
            holder: generate_holder_id(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a reconciler configured from a manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if `diff.ignore_fields` names an unknown kind.
    pub fn from_manifest(
        manifest: &ClusterManifest,
        provider: Arc<dyn CloudProvider>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let computed = ComputedFields::from_config(&manifest.diff)?;
        Ok(Self::new(provider, store)
            .with_scheduler(manifest.scheduler.clone())
            .with_diff_engine(DiffEngine::with_computed(computed)))
    }

    /// Sets the scheduler configuration.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the diff engine.
    #[must_use]
    pub fn with_diff_engine(mut self, diff_engine: DiffEngine) -> Self {
        self.diff_engine = diff_engine;
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels the running pass.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn check_cloud(&self, spec: &ClusterSpec) -> Result<()> {
        let served = self.provider.cloud();
        if spec.cloud != served {
            return Err(ReconcilerError::Reconcile(ReconcileError::CloudMismatch {
                spec: spec.cloud.to_string(),
                provider: served.to_string(),
            }));
        }
        Ok(())
    }

    /// Performs one reconciliation pass.
    ///
    /// Per-node failures are reported in the result; an `Err` means the pass
    /// did not run (invalid spec, lock held, unreadable state).
    ///
    /// # Errors
    ///
    /// Returns an error if validation, locking or loading state fails.
    pub async fn reconcile(&self, spec: &ClusterSpec) -> Result<ReconciliationResult> {
        info!("Starting reconciliation for cluster '{}' on {}", spec.cluster.name, spec.cloud);

        let graph = self.builder.build(spec)?;
        self.check_cloud(spec)?;
        let spec_hash = self.hasher.hash_spec(spec);

        self.locked(|| self.apply_graph(&graph, &spec_hash)).await
    }

    /// Deletes every resource recorded in state, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if locking or loading state fails.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        info!("Destroying all recorded resources");
        let graph = ResourceGraph::default();
        self.locked(|| self.apply_graph(&graph, "destroy")).await
    }

    /// Computes what a pass would do without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster spec is invalid or state cannot be read.
    pub async fn plan(&self, spec: &ClusterSpec) -> Result<PlanReport> {
        let graph = self.builder.build(spec)?;
        let snapshot = self.store.list().await?;
        let diff = self.diff_engine.compute(&graph, &snapshot);
        let plan = ExecutionPlan::build(&diff, &graph, &snapshot, &self.hasher.hash_spec(spec))?;

        info!(
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            diff.creates, diff.updates, diff.deletes, diff.unchanged
        );
        Ok(PlanReport { diff, plan })
    }

    /// Reads every recorded resource and compares it with state.
    ///
    /// Differences are reported, never written.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster spec is invalid or state cannot be read.
    pub async fn check_drift(&self, spec: &ClusterSpec) -> Result<DriftReport> {
        info!("Checking for drift in cluster '{}'", spec.cluster.name);

        let graph = self.builder.build(spec)?;
        self.check_cloud(spec)?;
        let snapshot = self.store.list().await?;

        let mut report = DriftReport {
            pending_changes: self.diff_engine.compute(&graph, &snapshot).changes().count(),
            ..DriftReport::default()
        };

        for (id, stored) in &snapshot {
            report.checked += 1;
            match self.provider.read(stored).await {
                Ok(live) => {
                    let fields = self.diff_engine.drift(stored, &live.attributes);
                    if !fields.is_empty() {
                        warn!("{id} drifted in {} field(s)", fields.len());
                        report.drifted.push(DriftEntry {
                            node_id: id.clone(),
                            fields,
                        });
                    }
                }
                Err(ProviderError::NotFound { .. }) => {
                    warn!("{id} no longer exists");
                    report.missing.push(id.clone());
                }
                Err(e) => {
                    error!("Failed to read {id}: {e}");
                    report.errors.push((id.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Runs `pass` while holding the state lock.
    async fn locked<F, Fut>(&self, pass: F) -> Result<ReconciliationResult>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ReconciliationResult>>,
    {
        if self.cancel.is_cancelled() {
            return Err(ReconcileError::Aborted {
                reason: String::from("cancelled before the pass started"),
            }
            .into());
        }

        let lock: LockInfo = self.store.acquire_lock(&self.holder).await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let result = pass().await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    async fn apply_graph(&self, graph: &ResourceGraph, spec_hash: &str) -> Result<ReconciliationResult> {
        let snapshot = self.store.list().await?;
        debug!("Loaded {} stored node(s)", snapshot.len());

        let diff = self.diff_engine.compute(graph, &snapshot);
        info!(
            "Diff: {} creates, {} updates, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.deletes, diff.unchanged
        );

        let plan = ExecutionPlan::build(&diff, graph, &snapshot, spec_hash)?;
        let scheduler = ApplyScheduler::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            &self.scheduler,
        );
        let report = scheduler.apply(&plan, graph, &snapshot, &self.cancel).await;

        let mut after = snapshot;
        for (id, written) in &report.written {
            match written {
                Some(state) => {
                    after.insert(id.clone(), state.clone());
                }
                None => {
                    after.remove(id);
                }
            }
        }

        let result = ReconciliationResult::from_report(&report, ClusterOutputs::from_snapshot(&after));
        if result.success {
            info!("Reconciliation successful");
        } else {
            warn!(
                "Reconciliation incomplete: {} failed, {} blocked",
                result.failed.len(),
                result.blocked.len()
            );
        }
        Ok(result)
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            write!(f, "No drift detected across {} resource(s)", self.checked)?;
        } else {
            writeln!(f, "Drift detected:")?;
            for entry in &self.drifted {
                writeln!(f, "  ~ {}", entry.node_id)?;
                for field in &entry.fields {
                    writeln!(f, "      {field}")?;
                }
            }
            for id in &self.missing {
                writeln!(f, "  - {id} (missing)")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "incomplete" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged.len())?;

        for failure in &self.failed {
            writeln!(f, "  Failed: {} {} ({})", failure.op, failure.node_id, failure.error)?;
        }
        for blocked in &self.blocked {
            writeln!(f, "  Blocked: {} {} ({})", blocked.op, blocked.node_id, blocked.error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudTarget;
    use crate::provider::MockCloudProvider;
    use crate::state::{MemoryStateStore, ObservedState};
    use serde_json::json;

    fn spec() -> ClusterSpec {
        serde_yaml::from_str(
            r"
cloud: aws
cluster:
  name: prod
  region: eu-west-1
node_pools:
  - name: default
    instance_class: m6i.large
    min_count: 1
    max_count: 3
    enable_autoscaling: true
",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cloud_mismatch_rejected_before_lock() {
        let mut provider = MockCloudProvider::new();
        provider.expect_cloud().return_const(CloudTarget::Azure);
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = Reconciler::new(Arc::new(provider), store.clone());

        let err = reconciler.reconcile(&spec()).await.unwrap_err();
        assert!(matches!(err, ReconcilerError::Reconcile(ReconcileError::CloudMismatch { .. })));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_held_by_other_aborts() {
        let mut provider = MockCloudProvider::new();
        provider.expect_cloud().return_const(CloudTarget::Aws);
        let store = Arc::new(MemoryStateStore::new());
        store.acquire_lock("someone-else").await.unwrap();
        let reconciler = Reconciler::new(Arc::new(provider), store.clone());

        let err = reconciler.reconcile(&spec()).await.unwrap_err();
        assert!(matches!(err, ReconcilerError::State(_)));
    }

    #[tokio::test]
    async fn test_drift_reports_changed_and_missing() {
        let cluster = NodeId::new(ResourceKind::Cluster, "prod");
        let pool = NodeId::new(ResourceKind::NodePool, "default");
        let mut snapshot = ObservedSnapshot::new();
        let mut attrs = crate::graph::Attributes::new();
        attrs.insert(String::from("max_count"), json!(3));
        snapshot.insert(pool.clone(), ObservedState::new(pool.clone(), "np", attrs, vec![]));
        snapshot.insert(
            cluster.clone(),
            ObservedState::new(cluster.clone(), "c", crate::graph::Attributes::new(), vec![]),
        );

        let mut provider = MockCloudProvider::new();
        provider.expect_cloud().return_const(CloudTarget::Aws);
        provider.expect_read().returning(|stored| {
            if stored.id.kind() == ResourceKind::Cluster {
                return Err(ProviderError::not_found("/clusters/prod"));
            }
            let mut live = crate::graph::Attributes::new();
            live.insert(String::from("max_count"), json!(9));
            Ok(crate::provider::ProviderResource {
                provider_id: String::from("np"),
                attributes: live,
            })
        });

        let reconciler = Reconciler::new(
            Arc::new(provider),
            Arc::new(MemoryStateStore::with_snapshot(snapshot)),
        );
        let report = reconciler.check_drift(&spec()).await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.missing, vec![cluster]);
        assert_eq!(report.drifted.len(), 1);
        assert_eq!(report.drifted[0].node_id, pool);
        assert!(!report.is_converged());
    }

    #[test]
    fn test_outputs_projection() {
        let cluster = NodeId::new(ResourceKind::Cluster, "prod");
        let mut attrs = crate::graph::Attributes::new();
        attrs.insert(String::from("endpoint"), json!("https://api"));
        attrs.insert(String::from("oidc_issuer_url"), json!("https://oidc"));
        attrs.insert(String::from("network"), json!({"service_cidr": "10.100.0.0/16"}));
        let pool = NodeId::new(ResourceKind::NodePool, "default");

        let mut snapshot = ObservedSnapshot::new();
        snapshot.insert(cluster.clone(), ObservedState::new(cluster, "arn:cluster", attrs, vec![]));
        snapshot.insert(
            pool.clone(),
            ObservedState::new(pool, "arn:pool", crate::graph::Attributes::new(), vec![]),
        );

        let outputs = ClusterOutputs::from_snapshot(&snapshot);
        assert_eq!(outputs.cluster_id.as_deref(), Some("arn:cluster"));
        assert_eq!(outputs.endpoint.as_deref(), Some("https://api"));
        assert_eq!(outputs.node_pools["default"], "arn:pool");
        assert!(outputs.network.is_some());
    }
}
