//! Execution event types.

use chrono::{DateTime, Utc};
use pilot_core::{ExecutionId, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A step was dispatched
    StepStarted,
    /// A step produced its output
    StepCompleted,
    /// A step failed
    StepFailed,
    /// The execution reached a final or paused state
    ExecutionComplete,
    /// The execution aborted on an engine error
    ExecutionError,
}

impl EventKind {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::ExecutionComplete => "execution_complete",
            Self::ExecutionError => "execution_error",
        }
    }

    /// Whether the event closes the execution
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ExecutionComplete | Self::ExecutionError)
    }

    /// Whether the event reports a failure
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::StepFailed | Self::ExecutionError)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Unique event id
    pub event_id: Uuid,
    /// Execution the event belongs to
    pub execution_id: ExecutionId,
    /// Event kind
    pub kind: EventKind,
    /// Step the event is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    /// Kind-specific details; never a raw step output
    #[serde(default)]
    pub payload: Value,
    /// Wall-clock time of emission
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Create an execution-level event
    #[must_use]
    pub fn new(execution_id: ExecutionId, kind: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            execution_id,
            kind,
            step_id: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Create a step-level event
    #[must_use]
    pub fn for_step(execution_id: ExecutionId, kind: EventKind, step_id: StepId) -> Self {
        Self {
            step_id: Some(step_id),
            ..Self::new(execution_id, kind)
        }
    }

    /// Attach details
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// See [`EventKind::is_terminal`]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// See [`EventKind::is_error`]
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.kind.is_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_flags() {
        assert!(EventKind::ExecutionComplete.is_terminal());
        assert!(!EventKind::StepCompleted.is_terminal());
        assert!(EventKind::StepFailed.is_error());
        assert!(!EventKind::StepStarted.is_error());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ExecutionEvent::for_step(ExecutionId::new(), EventKind::StepFailed, StepId::new("step2"))
            .with_payload(json!({"category": "parameter_error"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "step_failed");
        assert_eq!(value["step_id"], "step2");
        assert_eq!(value["payload"]["category"], "parameter_error");

        let execution = serde_json::to_value(ExecutionEvent::new(ExecutionId::new(), EventKind::ExecutionComplete)).unwrap();
        assert!(execution.get("step_id").is_none());
    }
}
