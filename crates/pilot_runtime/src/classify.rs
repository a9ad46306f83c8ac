//! Step failures and their classification.
//!
//! Parameter and configuration failures pause an execution so the user can
//! fix inputs and resume; anything else is a hard failure. Plugin error
//! kinds decide first, then a fixed table of message patterns. A failure
//! matching neither is an execution error.

use crate::plugin::PluginError;
use pilot_storage::FailureCategory;
use serde_json::{json, Value};

const PARAMETER_PATTERNS: &[&str] = &[
    "missing required",
    "required parameter",
    "invalid parameter",
    "invalid value",
    "is not a valid",
    "expected type",
    "must be provided",
];

const CONFIGURATION_PATTERNS: &[&str] = &[
    "not configured",
    "not connected",
    "no handler registered",
    "credentials",
    "unauthorized",
    "api key",
    "permission denied",
    "forbidden",
];

/// A step failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// The plugin call failed
    #[error("{plugin}.{action}: {source}")]
    Plugin {
        /// Plugin name
        plugin: String,
        /// Action name
        action: String,
        /// Plugin failure
        source: PluginError,
    },

    /// Step configuration is missing a value
    #[error("invalid parameter '{name}': {reason}")]
    Parameter {
        /// Offending parameter
        name: String,
        /// What is wrong
        reason: String,
    },

    /// Nested steps exceed the configured depth
    #[error("nesting depth {depth} exceeds maximum {max}")]
    DepthExceeded {
        /// Depth reached
        depth: usize,
        /// Configured maximum
        max: usize,
    },

    /// One scattered or looped item failed
    #[error("item {index}: {source}")]
    Item {
        /// Item position
        index: usize,
        /// Item failure
        source: Box<StepError>,
    },

    /// The step task panicked
    #[error("step panicked: {0}")]
    Panicked(String),

    /// Any other execution failure
    #[error("{0}")]
    Execution(String),
}

impl StepError {
    /// Innermost failure, unwrapping item wrappers
    #[must_use]
    pub fn root_cause(&self) -> &StepError {
        match self {
            Self::Item { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Category of a failure
#[must_use]
pub fn classify(error: &StepError) -> FailureCategory {
    match error.root_cause() {
        StepError::Parameter { .. } => FailureCategory::ParameterError,
        StepError::Plugin { source, .. } => match source {
            PluginError::MissingParameter { .. } | PluginError::InvalidParameter { .. } => {
                FailureCategory::ParameterError
            }
            PluginError::NotConfigured { .. } | PluginError::UnknownAction { .. } => {
                FailureCategory::ConfigurationError
            }
            PluginError::Failed(message) => classify_message(message),
        },
        StepError::Panicked(_) | StepError::DepthExceeded { .. } => FailureCategory::ExecutionError,
        other => classify_message(&other.to_string()),
    }
}

/// Category implied by a failure message
#[must_use]
pub fn classify_message(message: &str) -> FailureCategory {
    let lower = message.to_ascii_lowercase();
    if PARAMETER_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureCategory::ParameterError
    } else if CONFIGURATION_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureCategory::ConfigurationError
    } else {
        FailureCategory::ExecutionError
    }
}

/// Parameter name and reason for parameter failures
#[must_use]
pub fn parameter_details(error: &StepError) -> Option<Value> {
    match error.root_cause() {
        StepError::Parameter { name, reason } => Some(json!({"parameter": name, "reason": reason})),
        StepError::Plugin { plugin, action, source } => source.parameter().map(|name| {
            json!({
                "parameter": name,
                "plugin": plugin,
                "action": action,
                "reason": source.to_string(),
            })
        }),
        _ => None,
    }
}
