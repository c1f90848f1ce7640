//! Error types for the kubeplan reconciler.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation pass: configuration and spec validation, graph
//! construction, state storage, provider calls, and the controller itself.

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::NodeId;

/// The main error type for the kubeplan reconciler.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Configuration and spec validation errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Cloud provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The manifest file was not found.
    #[error("Manifest file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The manifest could not be parsed.
    #[error("Failed to parse manifest: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// The cluster spec failed validation. No provider call has been made.
    #[error("Spec validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A CIDR string could not be parsed.
    #[error("Invalid CIDR '{value}': {reason}")]
    InvalidCidr {
        /// The offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised while building or traversing a resource graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two nodes share the same identifier.
    #[error("Duplicate resource node: {id}")]
    DuplicateNode {
        /// The duplicated node id.
        id: NodeId,
    },

    /// A node depends on an id that is not part of the graph.
    #[error("Node {id} depends on unknown node {dependency}")]
    UnknownDependency {
        /// The dependent node.
        id: NodeId,
        /// The missing dependency.
        dependency: NodeId,
    },

    /// The dependency edges form a cycle.
    #[error("Dependency cycle detected at {id}")]
    Cycle {
        /// A node taking part in the cycle.
        id: NodeId,
    },

    /// A node id string could not be parsed.
    #[error("Invalid node id '{value}'")]
    InvalidNodeId {
        /// The unparsable value.
        value: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Io {
        /// Description of the IO failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors surfaced by a cloud provider adapter.
///
/// Every provider failure is classified into exactly one of these variants;
/// the scheduler's retry decision depends only on the variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Retriable failure: rate limiting, timeouts, 5xx responses.
    #[error("Transient provider error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Provider hint for when to retry, in seconds.
        retry_after_secs: Option<u64>,
    },

    /// Non-retriable failure: bad parameters, permission denied.
    #[error("Permanent provider error ({status}): {message}")]
    Permanent {
        /// HTTP-like status code reported by the provider.
        status: u16,
        /// Description of the failure.
        message: String,
    },

    /// The remote resource does not exist.
    #[error("Resource not found: {resource}")]
    NotFound {
        /// Path or identifier of the missing resource.
        resource: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reconciliation was aborted before any mutation.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// The manifest targets a different cloud than the provider.
    #[error("Cloud mismatch: spec targets {spec}, provider serves {provider}")]
    CloudMismatch {
        /// Cloud named in the cluster spec.
        spec: String,
        /// Cloud served by the configured provider.
        provider: String,
    },
}

/// Why a single node did not reach `Applied` in a pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// The provider rejected the operation.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The provider succeeded but the state write failed.
    #[error("State write failed: {0}")]
    State(String),

    /// An upstream node failed.
    #[error("Blocked by failed dependency {upstream}")]
    DependencyBlocked {
        /// The failed node.
        upstream: NodeId,
    },

    /// Dispatching stopped after a failure under the `halt` policy.
    #[error("Not started: apply halted after {upstream} failed")]
    Halted {
        /// The first failed node.
        upstream: NodeId,
    },

    /// The pass was cancelled before the operation started.
    #[error("Cancelled before start")]
    Cancelled,
}

/// Result type alias for kubeplan operations.
pub type Result<T> = std::result::Result<T, ReconcilerError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ReconcilerError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a spec validation failure.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Config(ConfigError::ValidationError { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transient { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local IO error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error without a retry hint.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(status: u16, message: impl Into<String>) -> Self {
        Self::Permanent {
            status,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Classifies an HTTP status code returned by a cloud API.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        match status {
            404 => Self::NotFound {
                resource: message.into(),
            },
            408 | 429 | 500..=599 => Self::Transient {
                message: format!("HTTP {status}: {}", message.into()),
                retry_after_secs,
            },
            _ => Self::Permanent {
                status,
                message: message.into(),
            },
        }
    }

    /// Returns true if the scheduler may retry this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the provider's retry hint in seconds, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Transient {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}
