//! Planning and apply.
//!
//! The diff engine compares a resource graph with the stored snapshot, the
//! plan orders the resulting ops, and the scheduler executes them.

mod diff;
mod plan;
mod scheduler;

pub use diff::{ChangeOp, ComputedFields, DiffEngine, DiffResult, FieldChange, OpKind};
pub use plan::{ExecutionPlan, PlanStep};
pub use scheduler::{ApplyReport, ApplyScheduler, NodeOutcome, Transition};
