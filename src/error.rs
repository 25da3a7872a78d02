//! Error types for the reconciliation engine
//!
//! The taxonomy follows how failures are allowed to affect a cluster:
//! transient failures are retried with back-off, conflicting observations
//! block topology progress until new observations arrive, invalid specs are
//! only re-evaluated on spec change, and internal invariant violations abort
//! a single pass. None of these ever terminate the controller process.

use std::fmt;

/// Errors surfaced by a reconciliation pass.
#[derive(Debug, Clone)]
pub enum ReconcileError {
    /// Platform API unavailability, instance command timeout, or a dependent
    /// object not yet ready. Retried with exponential back-off.
    Transient { reason: String },

    /// Ambiguous membership or role data (e.g. two instances both believe
    /// they are primary). Halts topology progress for the resource and
    /// surfaces a blocking condition; never auto-resolved by guessing.
    ConflictingObservation { reason: String },

    /// Invalid declared spec. Surfaced as a persistent condition and only
    /// re-evaluated on spec change, not on a timer.
    InvalidSpec { reason: String },

    /// Programming invariant violation. Logged, the pass is aborted, the
    /// process keeps serving other clusters.
    Internal { reason: String },
}

impl ReconcileError {
    pub fn transient(reason: impl Into<String>) -> Self {
        ReconcileError::Transient {
            reason: reason.into(),
        }
    }

    pub fn conflicting(reason: impl Into<String>) -> Self {
        ReconcileError::ConflictingObservation {
            reason: reason.into(),
        }
    }

    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        ReconcileError::InvalidSpec {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        ReconcileError::Internal {
            reason: reason.into(),
        }
    }

    /// Whether the error should be retried with back-off.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Transient { .. })
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Transient { reason } => {
                write!(f, "Transient failure: {}", reason)
            }
            ReconcileError::ConflictingObservation { reason } => {
                write!(f, "Conflicting observation: {}", reason)
            }
            ReconcileError::InvalidSpec { reason } => {
                write!(f, "Invalid spec: {}", reason)
            }
            ReconcileError::Internal { reason } => {
                write!(f, "Internal error: {}", reason)
            }
        }
    }
}

impl std::error::Error for ReconcileError {}

/// Errors from the administrative command channel to a database instance.
#[derive(Debug, Clone)]
pub enum AdminError {
    /// Command did not complete within the bounded timeout
    Timeout { ordinal: u32, command: String },

    /// Instance could not be reached at all
    Unreachable { ordinal: u32, reason: String },

    /// Instance rejected or failed the command
    CommandFailed { ordinal: u32, reason: String },
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminError::Timeout { ordinal, command } => {
                write!(f, "Command '{}' timed out on instance {}", command, ordinal)
            }
            AdminError::Unreachable { ordinal, reason } => {
                write!(f, "Instance {} unreachable: {}", ordinal, reason)
            }
            AdminError::CommandFailed { ordinal, reason } => {
                write!(f, "Command failed on instance {}: {}", ordinal, reason)
            }
        }
    }
}

impl std::error::Error for AdminError {}

impl From<AdminError> for ReconcileError {
    /// Admin failures are transient by definition: the whole pass is retried
    /// with back-off rather than partially committed.
    fn from(err: AdminError) -> Self {
        ReconcileError::Transient {
            reason: err.to_string(),
        }
    }
}

/// Errors from the platform object API.
#[derive(Debug, Clone)]
pub enum PlatformError {
    /// Resource does not exist (may have been deleted mid-flight)
    NotFound { key: String },

    /// API temporarily unavailable
    Unavailable { reason: String },

    /// Write lost a conflict against a concurrent update
    Conflict { key: String },
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::NotFound { key } => write!(f, "Resource '{}' not found", key),
            PlatformError::Unavailable { reason } => {
                write!(f, "Platform API unavailable: {}", reason)
            }
            PlatformError::Conflict { key } => {
                write!(f, "Conflicting write on resource '{}'", key)
            }
        }
    }
}

impl std::error::Error for PlatformError {}

impl From<PlatformError> for ReconcileError {
    fn from(err: PlatformError) -> Self {
        ReconcileError::Transient {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ReconcileError::transient("api down").is_transient());
        assert!(!ReconcileError::conflicting("dual primary").is_transient());
        assert!(!ReconcileError::invalid_spec("bad mode").is_transient());
        assert!(!ReconcileError::internal("bug").is_transient());
    }

    #[test]
    fn test_admin_error_converts_to_transient() {
        let err: ReconcileError = AdminError::Timeout {
            ordinal: 2,
            command: "promote".to_string(),
        }
        .into();
        assert!(err.is_transient());
    }
}
