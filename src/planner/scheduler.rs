//! Apply scheduler.
//!
//! A single coordinator owns readiness bookkeeping and dispatches plan steps
//! onto a [`JoinSet`] holding at most `max_workers` tasks. Workers call the
//! provider, retry transient failures with backoff, and write the state store
//! after the provider confirms success.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::diff::OpKind;
use super::plan::{ExecutionPlan, PlanStep};
use crate::config::{FailurePolicy, RetryConfig, SchedulerConfig};
use crate::error::{ApplyError, ProviderError};
use crate::graph::{Attributes, LifecycleState, NodeId, ResourceGraph, ResourceNode};
use crate::provider::{CloudProvider, DependencyOutputs, ProviderResource};
use crate::state::{ObservedSnapshot, ObservedState, StateStore};

/// Final outcome of one node in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// The op succeeded and state was written.
    Applied {
        /// Operation performed.
        op: OpKind,
        /// Provider attempts used.
        attempts: u32,
    },
    /// Nothing to do.
    Unchanged,
    /// The op failed.
    Failed {
        /// Operation attempted.
        op: OpKind,
        /// Last error.
        error: ApplyError,
        /// Provider attempts used.
        attempts: u32,
    },
    /// The op never started.
    Blocked {
        /// Operation that was planned.
        op: OpKind,
        /// Why it did not start.
        reason: ApplyError,
    },
}

impl NodeOutcome {
    /// Lifecycle state the outcome corresponds to.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        match self {
            Self::Applied { .. } | Self::Unchanged => LifecycleState::Applied,
            Self::Failed { .. } => LifecycleState::Failed,
            Self::Blocked { .. } => LifecycleState::Blocked,
        }
    }

    /// The error attached to a failed or blocked node.
    #[must_use]
    pub const fn error(&self) -> Option<&ApplyError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            Self::Blocked { reason, .. } => Some(reason),
            Self::Applied { .. } | Self::Unchanged => None,
        }
    }
}

/// A recorded lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// Node that changed state.
    pub node_id: NodeId,
    /// Previous state.
    pub from: LifecycleState,
    /// New state.
    pub to: LifecycleState,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// Everything that happened during one apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Outcome per node.
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
    /// Lifecycle transitions in the order they happened.
    pub transitions: Vec<Transition>,
    /// State written for applied nodes; `None` for deleted nodes.
    pub written: BTreeMap<NodeId, Option<ObservedState>>,
}

impl ApplyReport {
    fn ids_where(&self, pred: impl Fn(&NodeOutcome) -> bool) -> Vec<NodeId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Nodes whose op succeeded.
    #[must_use]
    pub fn applied(&self) -> Vec<NodeId> {
        self.ids_where(|o| matches!(o, NodeOutcome::Applied { .. }))
    }

    /// Nodes whose op failed.
    #[must_use]
    pub fn failed(&self) -> Vec<NodeId> {
        self.ids_where(|o| matches!(o, NodeOutcome::Failed { .. }))
    }

    /// Nodes that never started.
    #[must_use]
    pub fn blocked(&self) -> Vec<NodeId> {
        self.ids_where(|o| matches!(o, NodeOutcome::Blocked { .. }))
    }

    /// Nodes that needed no change.
    #[must_use]
    pub fn unchanged(&self) -> Vec<NodeId> {
        self.ids_where(|o| matches!(o, NodeOutcome::Unchanged))
    }

    /// Number of successful ops of one kind.
    #[must_use]
    pub fn count_applied(&self, op: OpKind) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, NodeOutcome::Applied { op: done, .. } if *done == op))
            .count()
    }

    /// Returns true if every node was applied or unchanged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, NodeOutcome::Applied { .. } | NodeOutcome::Unchanged))
    }

    /// Transitions of one node, in order.
    #[must_use]
    pub fn transitions_of(&self, id: &NodeId) -> Vec<(LifecycleState, LifecycleState)> {
        self.transitions
            .iter()
            .filter(|t| &t.node_id == id)
            .map(|t| (t.from, t.to))
            .collect()
    }

    fn transition(&mut self, id: &NodeId, from: LifecycleState, to: LifecycleState) {
        self.transitions.push(Transition {
            node_id: id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

/// Work handed to one worker task.
struct Job {
    step: PlanStep,
    desired: Option<ResourceNode>,
    current: Option<ObservedState>,
    deps: DependencyOutputs,
}

/// What a worker reports back.
struct JobResult {
    id: NodeId,
    op: OpKind,
    attempts: u32,
    result: Result<Option<ObservedState>, ApplyError>,
}

/// Shared by all workers.
struct Worker {
    provider: Arc<dyn CloudProvider>,
    store: Arc<dyn StateStore>,
    retry: RetryConfig,
}

impl Worker {
    async fn run(&self, job: Job) -> JobResult {
        let id = job.step.node_id.clone();
        let op = job.step.op;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.call(&job).await {
                Ok(resource) => {
                    let result = self.persist(&job, resource).await;
                    return JobResult { id, op, attempts, result };
                }
                Err(ProviderError::NotFound { .. }) if op == OpKind::Delete => {
                    debug!("{id} was already gone");
                    let result = self.persist(&job, None).await;
                    return JobResult { id, op, attempts, result };
                }
                Err(e) if e.is_transient() && attempts < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempts, e.retry_after_secs());
                    warn!(
                        "{op} {id} failed (attempt {attempts}/{}), retrying in {delay:?}: {e}",
                        self.retry.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if op == OpKind::Update && matches!(e, ProviderError::NotFound { .. }) {
                        // Dropping the record makes the next pass recreate it.
                        if let Err(store_err) = self.store.delete(&id).await {
                            warn!("Failed to drop state of vanished {id}: {store_err}");
                        }
                    }
                    error!("{op} {id} failed after {attempts} attempt(s): {e}");
                    return JobResult {
                        id,
                        op,
                        attempts,
                        result: Err(ApplyError::Provider(e)),
                    };
                }
            }
        }
    }

    async fn call(&self, job: &Job) -> Result<Option<ProviderResource>, ProviderError> {
        match (job.step.op, &job.desired, &job.current) {
            (OpKind::Create, Some(node), _) => self.provider.create(node, &job.deps).await.map(Some),
            (OpKind::Update, Some(node), Some(current)) => {
                self.provider.update(node, current, &job.deps).await.map(Some)
            }
            (OpKind::Delete, _, Some(current)) => self.provider.delete(current).await.map(|()| None),
            _ => Err(ProviderError::permanent(
                422,
                format!("{} {} has nothing to act on", job.step.op, job.step.node_id),
            )),
        }
    }

    async fn persist(
        &self,
        job: &Job,
        resource: Option<ProviderResource>,
    ) -> Result<Option<ObservedState>, ApplyError> {
        let id = &job.step.node_id;
        match (resource, &job.desired) {
            (Some(resource), Some(node)) => {
                let mut attributes = resource.attributes;
                attributes.extend(node.attributes.clone());
                let dependencies = node.dependencies.clone();
                let state = match &job.current {
                    Some(current) => current.reapplied(resource.provider_id, attributes, dependencies),
                    None => ObservedState::new(id.clone(), resource.provider_id, attributes, dependencies),
                };
                self.store
                    .put(id, &state)
                    .await
                    .map_err(|e| ApplyError::State(e.to_string()))?;
                Ok(Some(state))
            }
            _ => {
                self.store
                    .delete(id)
                    .await
                    .map_err(|e| ApplyError::State(e.to_string()))?;
                Ok(None)
            }
        }
    }
}

/// Executes plans against a provider and a state store.
pub struct ApplyScheduler {
    worker: Arc<Worker>,
    max_workers: usize,
    failure_policy: FailurePolicy,
}

impl ApplyScheduler {
    /// Creates a scheduler.
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        store: Arc<dyn StateStore>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                provider,
                store,
                retry: config.retry.clone(),
            }),
            max_workers: config.max_workers.max(1),
            failure_policy: config.failure_policy,
        }
    }

    /// Applies every step of `plan`.
    ///
    /// `graph` supplies desired attributes for creates and updates; `snapshot`
    /// supplies the stored state of updated and deleted nodes and the outputs
    /// of dependencies that are not part of the plan.
    pub async fn apply(
        &self,
        plan: &ExecutionPlan,
        graph: &ResourceGraph,
        snapshot: &ObservedSnapshot,
        cancel: &CancellationToken,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        for id in &plan.unchanged {
            report.transition(id, LifecycleState::Planned, LifecycleState::Diffed);
            report.outcomes.insert(id.clone(), NodeOutcome::Unchanged);
        }

        let steps: HashMap<&NodeId, &PlanStep> = plan.steps.iter().map(|s| (&s.node_id, s)).collect();
        let mut waiting: HashMap<&NodeId, usize> = plan
            .steps
            .iter()
            .map(|s| (&s.node_id, s.prerequisites.len()))
            .collect();
        let mut dependents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for step in &plan.steps {
            for pre in &step.prerequisites {
                dependents.entry(pre).or_default().push(&step.node_id);
            }
        }

        let mut outputs: HashMap<NodeId, Attributes> = snapshot
            .iter()
            .map(|(id, s)| (id.clone(), s.attributes.clone()))
            .collect();

        // Dispatch in plan order among ready steps.
        let position: HashMap<&NodeId, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (&s.node_id, i))
            .collect();
        let mut ready: BTreeSet<(usize, &NodeId)> = plan
            .steps
            .iter()
            .filter(|s| s.prerequisites.is_empty())
            .map(|s| (position[&s.node_id], &s.node_id))
            .collect();
        let mut finished: BTreeSet<&NodeId> = BTreeSet::new();

        let mut tasks: JoinSet<JobResult> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, NodeId> = HashMap::new();
        let mut halted_by: Option<NodeId> = None;

        info!("Applying {} step(s) with up to {} worker(s)", plan.steps.len(), self.max_workers);

        loop {
            while tasks.len() < self.max_workers && halted_by.is_none() && !cancel.is_cancelled() {
                let Some((_, id)) = ready.pop_first() else {
                    break;
                };
                let step = steps[id];
                let job = Job {
                    step: step.clone(),
                    desired: graph.get(id).cloned(),
                    current: snapshot.get(id).cloned(),
                    deps: graph
                        .dependencies(id)
                        .into_iter()
                        .filter_map(|dep| outputs.get(dep).map(|a| (dep.clone(), a.clone())))
                        .collect(),
                };

                report.transition(id, LifecycleState::Planned, LifecycleState::Applying);
                debug!("Dispatching {} {id}", step.op);
                let worker = Arc::clone(&self.worker);
                let handle = tasks.spawn(async move { worker.run(job).await });
                running.insert(handle.id(), id.clone());
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            let done = match joined {
                Ok((task_id, done)) => {
                    running.remove(&task_id);
                    done
                }
                Err(join_err) => {
                    let Some(id) = running.remove(&join_err.id()) else {
                        continue;
                    };
                    let op = steps.get(&id).map_or(OpKind::NoOp, |s| s.op);
                    JobResult {
                        id,
                        op,
                        attempts: 0,
                        result: Err(ApplyError::State(format!("worker aborted: {join_err}"))),
                    }
                }
            };

            let Some((&id_ref, _)) = steps.get_key_value(&done.id) else {
                continue;
            };
            finished.insert(id_ref);

            match done.result {
                Ok(state) => {
                    report.transition(id_ref, LifecycleState::Applying, LifecycleState::Applied);
                    match &state {
                        Some(s) => {
                            outputs.insert(id_ref.clone(), s.attributes.clone());
                        }
                        None => {
                            outputs.remove(id_ref);
                        }
                    }
                    report.written.insert(id_ref.clone(), state);
                    report.outcomes.insert(
                        id_ref.clone(),
                        NodeOutcome::Applied {
                            op: done.op,
                            attempts: done.attempts,
                        },
                    );

                    for &next in dependents.get(id_ref).into_iter().flatten() {
                        if let Some(count) = waiting.get_mut(next) {
                            *count = count.saturating_sub(1);
                            if *count == 0 && !finished.contains(next) {
                                ready.insert((position[next], next));
                            }
                        }
                    }
                }
                Err(err) => {
                    report.transition(id_ref, LifecycleState::Applying, LifecycleState::Failed);
                    report.outcomes.insert(
                        id_ref.clone(),
                        NodeOutcome::Failed {
                            op: done.op,
                            error: err,
                            attempts: done.attempts,
                        },
                    );

                    // Block everything downstream of the failure: plan successors
                    // (which covers deletes) and graph dependents, unchanged ones included.
                    let mut downstream = graph.transitive_dependents(id_ref);
                    let mut queue: VecDeque<&NodeId> = VecDeque::from([id_ref]);
                    while let Some(current) = queue.pop_front() {
                        for &next in dependents.get(current).into_iter().flatten() {
                            if downstream.insert(next.clone()) {
                                queue.push_back(next);
                            }
                        }
                    }

                    let reason = ApplyError::DependencyBlocked {
                        upstream: id_ref.clone(),
                    };
                    for next in &downstream {
                        let (from, op) = if let Some((&step_id, step)) = steps.get_key_value(next) {
                            if !finished.insert(step_id) {
                                continue;
                            }
                            ready.retain(|(_, r)| *r != step_id);
                            (LifecycleState::Planned, step.op)
                        } else if report.outcomes.get(next) == Some(&NodeOutcome::Unchanged) {
                            (LifecycleState::Diffed, OpKind::NoOp)
                        } else {
                            continue;
                        };
                        warn!("{next} blocked by failed {id_ref}");
                        report.transition(next, from, LifecycleState::Blocked);
                        report.outcomes.insert(
                            next.clone(),
                            NodeOutcome::Blocked {
                                op,
                                reason: reason.clone(),
                            },
                        );
                    }

                    if self.failure_policy == FailurePolicy::Halt && halted_by.is_none() {
                        warn!("Halting dispatch after {id_ref} failed");
                        halted_by = Some(id_ref.clone());
                    }
                }
            }
        }

        // Whatever was never dispatched.
        for step in &plan.steps {
            if report.outcomes.contains_key(&step.node_id) {
                continue;
            }
            let reason = match &halted_by {
                Some(upstream) if !cancel.is_cancelled() => ApplyError::Halted {
                    upstream: upstream.clone(),
                },
                _ => ApplyError::Cancelled,
            };
            warn!("{} {} not started: {reason}", step.op, step.node_id);
            report.transition(&step.node_id, LifecycleState::Planned, LifecycleState::Blocked);
            report.outcomes.insert(
                step.node_id.clone(),
                NodeOutcome::Blocked {
                    op: step.op,
                    reason,
                },
            );
        }

        self.refresh_unchanged(&mut report, graph, snapshot).await;

        info!(
            "Apply finished: {} applied, {} failed, {} blocked, {} unchanged",
            report.applied().len(),
            report.failed().len(),
            report.blocked().len(),
            report.unchanged().len()
        );
        report
    }

    /// Settles nodes that needed no provider call.
    ///
    /// A node whose dependency set changed is rewritten with its new edges so
    /// later delete ordering sees them.
    async fn refresh_unchanged(
        &self,
        report: &mut ApplyReport,
        graph: &ResourceGraph,
        snapshot: &ObservedSnapshot,
    ) {
        let unchanged = report.unchanged();
        for id in &unchanged {
            let (Some(node), Some(stored)) = (graph.get(id), snapshot.get(id)) else {
                report.transition(id, LifecycleState::Diffed, LifecycleState::Applied);
                continue;
            };

            let recorded: BTreeSet<&NodeId> = stored.dependencies.iter().collect();
            let desired: BTreeSet<&NodeId> = node.dependencies.iter().collect();
            if recorded != desired {
                debug!("Recording new dependencies of {id}");
                let state = stored.reapplied(
                    stored.provider_id.clone(),
                    stored.attributes.clone(),
                    node.dependencies.clone(),
                );
                if let Err(e) = self.worker.store.put(id, &state).await {
                    error!("Failed to record dependencies of {id}: {e}");
                    report.transition(id, LifecycleState::Diffed, LifecycleState::Failed);
                    report.outcomes.insert(
                        id.clone(),
                        NodeOutcome::Failed {
                            op: OpKind::NoOp,
                            error: ApplyError::State(e.to_string()),
                            attempts: 0,
                        },
                    );
                    continue;
                }
                report.written.insert(id.clone(), Some(state));
            }
            report.transition(id, LifecycleState::Diffed, LifecycleState::Applied);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use crate::planner::DiffEngine;
    use crate::provider::{CloudProvider, MockCloudProvider};
    use crate::state::MemoryStateStore;
    use serde_json::json;

    fn id(kind: ResourceKind, name: &str) -> NodeId {
        NodeId::new(kind, name)
    }

    fn graph() -> ResourceGraph {
        let cluster = id(ResourceKind::Cluster, "prod");
        let mut attrs = Attributes::new();
        attrs.insert(String::from("name"), json!("prod"));
        ResourceGraph::from_nodes(vec![
            ResourceNode::new(cluster.clone(), attrs.clone()),
            ResourceNode::new(id(ResourceKind::NodePool, "a"), attrs.clone()).depends_on(cluster.clone()),
            ResourceNode::new(id(ResourceKind::NodePool, "b"), attrs).depends_on(cluster),
        ])
        .unwrap()
    }

    fn fast_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        config
    }

    fn plan_for(graph: &ResourceGraph) -> ExecutionPlan {
        let snapshot = ObservedSnapshot::new();
        let diff = DiffEngine::new().compute(graph, &snapshot);
        ExecutionPlan::build(&diff, graph, &snapshot, "h").unwrap()
    }

    fn created(node: &ResourceNode) -> ProviderResource {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("id"), json!(format!("p-{}", node.id.name())));
        ProviderResource {
            provider_id: format!("p-{}", node.id.name()),
            attributes,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let mut provider = MockCloudProvider::new();
        let mut failures = 2;
        provider.expect_create().times(5).returning(move |node, _| {
            if node.id.kind() == ResourceKind::Cluster && failures > 0 {
                failures -= 1;
                return Err(ProviderError::transient("throttled"));
            }
            Ok(created(node))
        });

        let store = Arc::new(MemoryStateStore::new());
        let provider: Arc<dyn CloudProvider> = Arc::new(provider);
        let scheduler = ApplyScheduler::new(provider, store.clone(), &fast_config());
        let graph = graph();

        let report = scheduler
            .apply(&plan_for(&graph), &graph, &ObservedSnapshot::new(), &CancellationToken::new())
            .await;

        assert!(report.is_success());
        assert_eq!(
            report.outcomes[&id(ResourceKind::Cluster, "prod")],
            NodeOutcome::Applied { op: OpKind::Create, attempts: 3 }
        );
        assert_eq!(store.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_blocks_dependents() {
        let mut provider = MockCloudProvider::new();
        provider
            .expect_create()
            .times(1)
            .returning(|_, _| Err(ProviderError::permanent(400, "bad version")));

        let store = Arc::new(MemoryStateStore::new());
        let provider: Arc<dyn CloudProvider> = Arc::new(provider);
        let scheduler = ApplyScheduler::new(provider, store.clone(), &fast_config());
        let graph = graph();

        let report = scheduler
            .apply(&plan_for(&graph), &graph, &ObservedSnapshot::new(), &CancellationToken::new())
            .await;

        assert_eq!(report.failed(), vec![id(ResourceKind::Cluster, "prod")]);
        assert_eq!(report.blocked().len(), 2);
        assert_eq!(
            report.outcomes[&id(ResourceKind::NodePool, "a")].error(),
            Some(&ApplyError::DependencyBlocked {
                upstream: id(ResourceKind::Cluster, "prod")
            })
        );
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_capped_by_max_attempts() {
        let mut provider = MockCloudProvider::new();
        provider
            .expect_create()
            .times(3)
            .returning(|_, _| Err(ProviderError::transient("unavailable")));

        let mut config = fast_config();
        config.retry.max_attempts = 3;
        let provider: Arc<dyn CloudProvider> = Arc::new(provider);
        let scheduler = ApplyScheduler::new(provider, Arc::new(MemoryStateStore::new()), &config);
        let graph = graph();

        let report = scheduler
            .apply(&plan_for(&graph), &graph, &ObservedSnapshot::new(), &CancellationToken::new())
            .await;

        assert!(matches!(
            report.outcomes[&id(ResourceKind::Cluster, "prod")],
            NodeOutcome::Failed { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_blocked() {
        let provider: Arc<dyn CloudProvider> = Arc::new(MockCloudProvider::new());
        let scheduler = ApplyScheduler::new(provider, Arc::new(MemoryStateStore::new()), &fast_config());
        let graph = graph();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler
            .apply(&plan_for(&graph), &graph, &ObservedSnapshot::new(), &cancel)
            .await;

        assert_eq!(report.blocked().len(), 3);
        assert!(report
            .outcomes
            .values()
            .all(|o| o.error() == Some(&ApplyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_halt_policy_stops_dispatch() {
        let mut provider = MockCloudProvider::new();
        provider.expect_create().returning(|node, _| {
            if node.id.name() == "a" {
                Err(ProviderError::permanent(403, "denied"))
            } else {
                Ok(created(node))
            }
        });

        let mut config = fast_config();
        config.max_workers = 1;
        config.failure_policy = FailurePolicy::Halt;
        let provider: Arc<dyn CloudProvider> = Arc::new(provider);
        let scheduler = ApplyScheduler::new(provider, Arc::new(MemoryStateStore::new()), &config);
        let graph = graph();

        let report = scheduler
            .apply(&plan_for(&graph), &graph, &ObservedSnapshot::new(), &CancellationToken::new())
            .await;

        assert_eq!(report.failed(), vec![id(ResourceKind::NodePool, "a")]);
        assert_eq!(
            report.outcomes[&id(ResourceKind::NodePool, "b")].error(),
            Some(&ApplyError::Halted {
                upstream: id(ResourceKind::NodePool, "a")
            })
        );
    }

    fn attrs(value: u32) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("value"), json!(value));
        attrs
    }

    fn recorded(graph: &ResourceGraph) -> ObservedSnapshot {
        graph
            .nodes()
            .map(|n| {
                (
                    n.id.clone(),
                    ObservedState::new(n.id.clone(), "p", n.attributes.clone(), n.dependencies.clone()),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_behind_unchanged_node() {
        let role = id(ResourceKind::IamRole, "cp");
        let cluster = id(ResourceKind::Cluster, "prod");
        let pool = id(ResourceKind::NodePool, "default");
        let before = ResourceGraph::from_nodes(vec![
            ResourceNode::new(role.clone(), attrs(1)),
            ResourceNode::new(cluster.clone(), attrs(1)).depends_on(role.clone()),
            ResourceNode::new(pool.clone(), attrs(1)).depends_on(cluster.clone()),
        ])
        .unwrap();
        let snapshot = recorded(&before);
        let after = ResourceGraph::from_nodes(vec![
            ResourceNode::new(role.clone(), attrs(2)),
            ResourceNode::new(cluster.clone(), attrs(1)).depends_on(role.clone()),
            ResourceNode::new(pool.clone(), attrs(2)).depends_on(cluster.clone()),
        ])
        .unwrap();

        let mut provider = MockCloudProvider::new();
        provider
            .expect_update()
            .times(1)
            .returning(|_, _, _| Err(ProviderError::permanent(403, "denied")));

        let diff = DiffEngine::new().compute(&after, &snapshot);
        let plan = ExecutionPlan::build(&diff, &after, &snapshot, "h").unwrap();
        let provider: Arc<dyn CloudProvider> = Arc::new(provider);
        let store = Arc::new(MemoryStateStore::with_snapshot(snapshot.clone()));
        let scheduler = ApplyScheduler::new(provider, store, &fast_config());

        let report = scheduler.apply(&plan, &after, &snapshot, &CancellationToken::new()).await;

        assert_eq!(report.failed(), vec![role.clone()]);
        assert_eq!(report.blocked(), vec![cluster.clone(), pool.clone()]);
        assert!(report.unchanged().is_empty());
        assert_eq!(
            report.outcomes[&cluster],
            NodeOutcome::Blocked {
                op: OpKind::NoOp,
                reason: ApplyError::DependencyBlocked { upstream: role.clone() },
            }
        );
        assert_eq!(
            report.outcomes[&pool].error(),
            Some(&ApplyError::DependencyBlocked { upstream: role })
        );
        assert_eq!(
            report.transitions_of(&cluster),
            vec![
                (LifecycleState::Planned, LifecycleState::Diffed),
                (LifecycleState::Diffed, LifecycleState::Blocked),
            ]
        );
    }

    #[tokio::test]
    async fn test_unchanged_node_records_new_dependencies() {
        let cluster = id(ResourceKind::Cluster, "prod");
        let pool = id(ResourceKind::NodePool, "batch");
        let dns = id(ResourceKind::Addon, "dns");
        let graph = ResourceGraph::from_nodes(vec![
            ResourceNode::new(cluster.clone(), attrs(1)),
            ResourceNode::new(pool.clone(), attrs(1)).depends_on(cluster.clone()),
            ResourceNode::new(dns.clone(), attrs(1))
                .depends_on(cluster.clone())
                .depends_on(pool.clone()),
        ])
        .unwrap();
        let mut snapshot = recorded(&graph);
        snapshot.insert(
            dns.clone(),
            ObservedState::new(dns.clone(), "p", attrs(1), vec![cluster.clone()]),
        );
        let store = Arc::new(MemoryStateStore::with_snapshot(snapshot.clone()));

        let diff = DiffEngine::new().compute(&graph, &snapshot);
        let plan = ExecutionPlan::build(&diff, &graph, &snapshot, "h").unwrap();
        assert!(plan.is_empty());

        let provider: Arc<dyn CloudProvider> = Arc::new(MockCloudProvider::new());
        let scheduler = ApplyScheduler::new(provider, store.clone(), &fast_config());
        let report = scheduler.apply(&plan, &graph, &snapshot, &CancellationToken::new()).await;

        assert!(report.is_success());
        assert_eq!(report.unchanged().len(), 3);
        let stored = store.get(&dns).await.unwrap().unwrap();
        assert!(stored.depends_on(&pool));
        assert_eq!(stored.provider_id, "p");
        assert!(report.written.contains_key(&dns));
        assert!(!report.written.contains_key(&cluster));
        assert_eq!(
            report.transitions_of(&dns),
            vec![
                (LifecycleState::Planned, LifecycleState::Diffed),
                (LifecycleState::Diffed, LifecycleState::Applied),
            ]
        );
    }

    #[tokio::test]
    async fn test_update_not_found_drops_state() {
        let graph = graph();
        let pool = id(ResourceKind::NodePool, "a");
        let mut snapshot = ObservedSnapshot::new();
        for node in graph.nodes() {
            let mut attrs = node.attributes.clone();
            if node.id == pool {
                attrs.insert(String::from("name"), json!("old"));
            }
            snapshot.insert(
                node.id.clone(),
                ObservedState::new(node.id.clone(), "p", attrs, node.dependencies.clone()),
            );
        }
        let store = Arc::new(MemoryStateStore::with_snapshot(snapshot.clone()));

        let mut provider = MockCloudProvider::new();
        provider
            .expect_update()
            .times(1)
            .returning(|_, _, _| Err(ProviderError::not_found("/clusters/prod/node-groups/a")));

        let diff = DiffEngine::new().compute(&graph, &snapshot);
        let plan = ExecutionPlan::build(&diff, &graph, &snapshot, "h").unwrap();
        let provider: Arc<dyn CloudProvider> = Arc::new(provider);
        let scheduler = ApplyScheduler::new(provider, store.clone(), &fast_config());

        let report = scheduler.apply(&plan, &graph, &snapshot, &CancellationToken::new()).await;

        assert_eq!(report.failed(), vec![pool.clone()]);
        assert!(store.get(&pool).await.unwrap().is_none());
        assert_eq!(
            report.transitions_of(&pool),
            vec![
                (LifecycleState::Planned, LifecycleState::Applying),
                (LifecycleState::Applying, LifecycleState::Failed),
            ]
        );
    }
}
