//! State management module for kubeplan.
//!
//! This module provides durable per-node storage of observed state: what was
//! last applied for each resource node, plus an advisory lock per cluster.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{NodeLocks, StateStore};
pub use types::{ObservedSnapshot, ObservedState, STATE_VERSION};
