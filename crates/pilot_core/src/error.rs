//! Error taxonomy shared by every PILOT crate.
//!
//! Component crates define their own detailed errors and convert them into
//! [`PilotError`] at their public boundaries.

/// Core result type
pub type PilotResult<T> = Result<T, PilotError>;

/// Top-level error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PilotError {
    /// The IR is not purely declarative; compilation must not proceed
    #[error("Validation failed: {}", .errors.join("; "))]
    Validation {
        /// Offending fields, one message each
        errors: Vec<String>,
    },

    /// Every compiler strategy failed
    #[error("Compilation failed: {}", .errors.join("; "))]
    Compilation {
        /// Errors from all attempted strategies
        errors: Vec<String>,
    },

    /// The step graph has a dangling reference or a cycle
    #[error("Graph integrity violated: {reason}")]
    GraphIntegrity {
        /// What is broken
        reason: String,
    },

    /// A step failed and the failure must halt the caller
    #[error("Step {step_id} failed ({category}): {message}")]
    StepExecution {
        /// Failing step
        step_id: String,
        /// Failure category (parameter_error, execution_error, configuration_error)
        category: String,
        /// Failure message
        message: String,
    },

    /// Another holder owns the lock; retry later
    #[error("Lock conflict on {key}")]
    LockConflict {
        /// Lock key
        key: String,
    },

    /// Persistence failed
    #[error("Persistence error: {reason}")]
    Persistence {
        /// Underlying reason
        reason: String,
    },

    /// Entity not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind
        kind: String,
        /// Entity id
        id: String,
    },

    /// Operation not allowed in the current state
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Why the state is invalid
        reason: String,
    },

    /// Internal error (for unexpected errors)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl PilotError {
    /// Stable machine-readable error kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Compilation { .. } => "compilation_error",
            Self::GraphIntegrity { .. } => "graph_integrity_error",
            Self::StepExecution { .. } => "step_execution_error",
            Self::LockConflict { .. } => "lock_conflict",
            Self::Persistence { .. } => "persistence_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Shorthand for a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("json: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PilotError::not_found("Execution", "exec_1");
        assert_eq!(format!("{}", err), "Execution not found: exec_1");

        let err = PilotError::Validation {
            errors: vec!["steps: step identifiers are not allowed".to_string(), "loop: nope".to_string()],
        };
        let s = err.to_string();
        assert!(s.contains("steps"));
        assert!(s.contains("; loop"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(PilotError::LockConflict { key: "k".into() }.kind(), "lock_conflict");
        assert_eq!(PilotError::Persistence { reason: "io".into() }.kind(), "persistence_error");
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: PilotError = err.into();
        assert!(matches!(err, PilotError::Internal { .. }));
    }
}
