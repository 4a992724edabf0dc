//! Error types for the cairn reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state management, planning, provider
//! calls, and execution.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the cairn engine.
#[derive(Debug, Error)]
pub enum CairnError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph validation errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

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
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
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
}

/// Errors raised while building the resource graph.
///
/// All of them are fatal and are reported before any provider call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two declarations share the same identifier.
    #[error("Duplicate resource: {id}")]
    DuplicateResource {
        /// The colliding identifier.
        id: String,
    },

    /// A reference points to an unknown resource or attribute.
    #[error("Unresolved reference in {from}.{attribute}: {target} does not exist")]
    UnresolvedReference {
        /// Resource holding the reference.
        from: String,
        /// Attribute holding the reference.
        attribute: String,
        /// The reference target that could not be resolved.
        target: String,
    },

    /// The dependency relation contains a cycle.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Members of the cycle in discovery order.
        cycle: Vec<String>,
    },

    /// A declaration's type or name cannot form a `type.name` identifier.
    #[error("Invalid resource identifier '{id}': {reason}")]
    InvalidIdentifier {
        /// The identifier as declared.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A reference expression is malformed.
    #[error("Invalid reference '{expression}' in {from}.{attribute}: {reason}")]
    InvalidReference {
        /// Resource holding the expression.
        from: String,
        /// Attribute holding the expression.
        attribute: String,
        /// The offending expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A state record is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
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

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
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

/// Planning errors. No partial plan is ever returned alongside one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The topological sort could not order every resource.
    #[error("Cycle detected while ordering resources: {}", remaining.join(", "))]
    CycleDetected {
        /// Resources left unordered.
        remaining: Vec<String>,
    },

    /// The recorded state holds resources the graph no longer declares.
    #[error("Inconsistent state: recorded resources missing from declarations: {}", orphans.join(", "))]
    InconsistentState {
        /// Orphaned identifiers.
        orphans: Vec<String>,
    },

    /// An attribute value could not be substituted.
    #[error("Cannot resolve {id}.{attribute}: {reason}")]
    InvalidAttribute {
        /// Resource holding the attribute.
        id: String,
        /// Attribute name.
        attribute: String,
        /// Why substitution failed.
        reason: String,
    },
}

/// Errors returned by a provider call, tagged for retry eligibility.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Throttling, timeouts, and other failures worth retrying.
    #[error("transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Delay suggested by the provider before retrying.
        retry_after_secs: Option<u64>,
    },

    /// Invalid configuration, permission denied, and other final failures.
    #[error("permanent provider failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },
}

/// Execution errors that abort a run before any operation starts.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The recorded state changed between planning and execution.
    #[error("Plan is stale: state fingerprint {planned} no longer matches {current}")]
    StalePlan {
        /// Fingerprint the plan was computed against.
        planned: String,
        /// Fingerprint of the state now.
        current: String,
    },

    /// The run was aborted.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for cairn operations.
pub type Result<T> = std::result::Result<T, CairnError>;

impl CairnError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
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
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
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

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates the error returned when `lock_id` no longer owns the lock.
    #[must_use]
    pub fn lock_lost(lock_id: &str) -> Self {
        Self::LockFailed {
            message: format!("Lock {lock_id} is no longer held"),
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
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the delay suggested by the provider, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}
