//! Execution plan types and construction.
//!
//! A plan orders the mutating ops of a diff. Creates and updates wait for
//! their nearest changed ancestors, seen through unchanged nodes; a delete waits for every node that recorded the
//! deleted node as a dependency and is itself deleted or re-applied.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::diff::{DiffResult, OpKind};
use crate::error::{GraphError, Result};
use crate::graph::{NodeId, ResourceGraph};
use crate::state::ObservedSnapshot;

/// One mutating op with the ops it waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// Node to act on.
    pub node_id: NodeId,
    /// Operation to perform.
    pub op: OpKind,
    /// Steps that must be applied first.
    pub prerequisites: Vec<NodeId>,
}

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the cluster spec this plan is based on.
    pub spec_hash: String,
    /// Mutating steps in a valid dispatch order.
    pub steps: Vec<PlanStep>,
    /// Nodes that need no change.
    pub unchanged: Vec<NodeId>,
}

impl ExecutionPlan {
    /// Orders the ops of a diff.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the prerequisites form a cycle.
    pub fn build(
        diff: &DiffResult,
        graph: &ResourceGraph,
        snapshot: &ObservedSnapshot,
        spec_hash: &str,
    ) -> Result<Self> {
        let mut prerequisites: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();

        for change in diff.changes() {
            let id = &change.node_id;
            let mut waits: Vec<NodeId> = match change.op {
                OpKind::Create | OpKind::Update => Self::changing_ancestors(id, diff, graph),
                OpKind::Delete => snapshot
                    .values()
                    .filter(|stored| stored.depends_on(id))
                    .filter(|stored| {
                        matches!(diff.op_of(&stored.id), Some(OpKind::Delete | OpKind::Update))
                    })
                    .map(|stored| stored.id.clone())
                    .collect(),
                OpKind::NoOp => continue,
            };
            waits.sort();
            waits.dedup();
            prerequisites.insert(id.clone(), waits);
        }

        let steps = Self::order(&prerequisites, diff)?;
        let unchanged = diff
            .ops
            .iter()
            .filter(|o| o.op == OpKind::NoOp)
            .map(|o| o.node_id.clone())
            .collect();

        Ok(Self {
            created_at: Utc::now(),
            spec_hash: spec_hash.to_string(),
            steps,
            unchanged,
        })
    }

    /// Nearest created or updated ancestors of `id`, looking through
    /// unchanged nodes.
    fn changing_ancestors(id: &NodeId, diff: &DiffResult, graph: &ResourceGraph) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut seen: BTreeSet<&NodeId> = BTreeSet::new();
        let mut stack = graph.dependencies(id);

        while let Some(dep) = stack.pop() {
            if !seen.insert(dep) {
                continue;
            }
            match diff.op_of(dep) {
                Some(OpKind::Create | OpKind::Update) => found.push(dep.clone()),
                _ => stack.extend(graph.dependencies(dep)),
            }
        }
        found
    }

    /// Kahn's algorithm; among ready steps the smallest node id goes first.
    fn order(prerequisites: &BTreeMap<NodeId, Vec<NodeId>>, diff: &DiffResult) -> Result<Vec<PlanStep>> {
        let mut waiting: BTreeMap<&NodeId, usize> = prerequisites
            .iter()
            .map(|(id, waits)| (id, waits.iter().filter(|w| prerequisites.contains_key(*w)).count()))
            .collect();
        let mut dependents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for (id, waits) in prerequisites {
            for wait in waits {
                dependents.entry(wait).or_default().push(id);
            }
        }

        let mut ready: BTreeSet<&NodeId> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut steps = Vec::with_capacity(prerequisites.len());

        while let Some(id) = ready.pop_first() {
            waiting.remove(id);
            for &next in dependents.get(id).into_iter().flatten() {
                if let Some(count) = waiting.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(next);
                    }
                }
            }
            steps.push(PlanStep {
                node_id: id.clone(),
                op: diff.op_of(id).unwrap_or(OpKind::NoOp),
                prerequisites: prerequisites.get(id).cloned().unwrap_or_default(),
            });
        }

        if let Some((&id, _)) = waiting.iter().next() {
            return Err(GraphError::Cycle { id: id.clone() }.into());
        }
        Ok(steps)
    }

    /// Returns true if the plan mutates nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the number of steps performing `op`.
    #[must_use]
    pub fn count(&self, op: OpKind) -> usize {
        self.steps.iter().filter(|s| s.op == op).count()
    }

    /// Looks up the step of a node.
    #[must_use]
    pub fn step(&self, id: &NodeId) -> Option<&PlanStep> {
        self.steps.iter().find(|s| &s.node_id == id)
    }

    /// Steps without prerequisites.
    #[must_use]
    pub fn ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.prerequisites.is_empty())
            .collect()
    }

}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op, self.node_id)?;
        if !self.prerequisites.is_empty() {
            let waits: Vec<String> = self.prerequisites.iter().map(ToString::to_string).collect();
            write!(f, " (after {})", waits.join(", "))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} steps):", self.steps.len())?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {i}. {step}")?;
        }
        Ok(())
    }
}
