//! Persisted records.
//!
//! Field names follow the wire format consumed by status and resume callers
//! (`execution_trace.completedSteps`, `cached_outputs`, ...).

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use pilot_core::{ExecutionId, Fingerprint, StepId, WorkflowId};
use pilot_plan::CompiledStep;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet scheduled
    #[default]
    Pending,
    /// Scheduler is dispatching steps
    Running,
    /// Every step completed or was skipped
    Completed,
    /// At least one hard failure
    Failed,
    /// Waiting for user input or an external pause
    Paused,
    /// Side effects were compensated
    RolledBack,
}

impl ExecutionStatus {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Whether a resume may pick the execution up
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Failed | Self::Paused | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not dispatched
    #[default]
    Pending,
    /// In flight
    Running,
    /// Produced an output
    Completed,
    /// Failed, see the metadata
    Failed,
    /// On an untaken branch
    Skipped,
}

impl StepStatus {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Why a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A parameter value is missing or wrong; the user can fix it
    ParameterError,
    /// The step itself failed
    ExecutionError,
    /// A connection or plugin setting is missing; the user can fix it
    ConfigurationError,
}

impl FailureCategory {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParameterError => "parameter_error",
            Self::ExecutionError => "execution_error",
            Self::ConfigurationError => "configuration_error",
        }
    }

    /// Whether the failure pauses the execution for user input
    #[must_use]
    pub const fn awaits_user_input(self) -> bool {
        matches!(self, Self::ParameterError | Self::ConfigurationError)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata-only snapshot of a step output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSummary {
    /// JSON type of the output
    #[serde(rename = "type")]
    pub kind: String,
    /// Elements for arrays, 0 for null and empty strings, 1 otherwise
    pub item_count: usize,
    /// Object keys, or the union of element keys for arrays of objects
    pub field_names: Vec<String>,
    /// Null, empty array, empty object or empty string
    pub is_empty: bool,
    /// BLAKE3 of the canonical payload
    pub fingerprint: String,
}

impl OutputSummary {
    /// Summarize a payload
    #[must_use]
    pub fn of(value: &Value) -> Self {
        let (kind, item_count, field_names, is_empty) = match value {
            Value::Null => ("null", 0, Vec::new(), true),
            Value::Bool(_) => ("boolean", 1, Vec::new(), false),
            Value::Number(_) => ("number", 1, Vec::new(), false),
            Value::String(s) => ("string", usize::from(!s.is_empty()), Vec::new(), s.is_empty()),
            Value::Array(items) => {
                let fields: IndexSet<&String> = items
                    .iter()
                    .filter_map(Value::as_object)
                    .flat_map(Map::keys)
                    .collect();
                (
                    "array",
                    items.len(),
                    fields.into_iter().cloned().collect(),
                    items.is_empty(),
                )
            }
            Value::Object(map) => ("object", 1, map.keys().cloned().collect(), map.is_empty()),
        };
        Self {
            kind: kind.to_string(),
            item_count,
            field_names,
            is_empty,
            fingerprint: Fingerprint::of_json(value).to_hex(),
        }
    }

    /// Whether `value` is the payload this summary was taken from
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        self.fingerprint == Fingerprint::of_json(value).to_hex()
    }
}

/// Checkpoint state of an execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Completed steps, each exactly once, in completion order
    #[serde(rename = "completedSteps", default)]
    pub completed_steps: Vec<StepId>,
    /// Steps that failed in the current attempt
    #[serde(rename = "failedSteps", default)]
    pub failed_steps: Vec<StepId>,
    /// Steps on untaken branches
    #[serde(rename = "skippedSteps", default)]
    pub skipped_steps: Vec<StepId>,
    /// Output summaries by step
    #[serde(default)]
    pub cached_outputs: IndexMap<StepId, OutputSummary>,
}

impl ExecutionTrace {
    /// Record a completion; repeated completions are ignored
    pub fn mark_completed(&mut self, step: &StepId, summary: OutputSummary) {
        self.failed_steps.retain(|s| s != step);
        if !self.completed_steps.contains(step) {
            self.completed_steps.push(step.clone());
        }
        self.cached_outputs.insert(step.clone(), summary);
    }

    /// Record a failure
    pub fn mark_failed(&mut self, step: &StepId) {
        if !self.failed_steps.contains(step) {
            self.failed_steps.push(step.clone());
        }
    }

    /// Record a skip
    pub fn mark_skipped(&mut self, step: &StepId) {
        if !self.skipped_steps.contains(step) {
            self.skipped_steps.push(step.clone());
        }
    }

    /// Whether the step already completed
    #[must_use]
    pub fn is_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Whether the step was skipped
    #[must_use]
    pub fn is_skipped(&self, step: &str) -> bool {
        self.skipped_steps.iter().any(|s| s == step)
    }
}

/// One run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution id
    pub id: ExecutionId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Lifecycle status
    pub status: ExecutionStatus,
    /// Top-level step count
    pub total_steps: usize,
    /// Failures in the current attempt; reset together with `failedSteps`
    pub failed_steps_count: usize,
    /// Checkpoint state
    pub execution_trace: ExecutionTrace,
    /// Tokens across all attempts
    #[serde(default)]
    pub total_tokens_used: u64,
    /// Step time across all attempts
    #[serde(default)]
    pub total_execution_time_ms: u64,
    /// Number of resumes
    #[serde(default)]
    pub resume_count: u32,
    /// Last engine-level error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
    /// First dispatch
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the execution reached a final state
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// New pending execution
    #[must_use]
    pub fn new(workflow_id: WorkflowId, total_steps: usize) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            workflow_id,
            status: ExecutionStatus::Pending,
            total_steps,
            failed_steps_count: 0,
            execution_trace: ExecutionTrace::default(),
            total_tokens_used: 0,
            total_execution_time_ms: 0,
            resume_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to a new status and stamp the transition
    pub fn transition(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        if status == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status == ExecutionStatus::Completed {
            self.completed_at = Some(now);
        }
        self.status = status;
        self.updated_at = now;
    }

    /// Record a step failure in the trace and the counter
    pub fn record_failure(&mut self, step: &StepId) {
        self.execution_trace.mark_failed(step);
        self.failed_steps_count = self.execution_trace.failed_steps.len();
    }

    /// Clear failures ahead of a resume; completions and summaries stay
    pub fn reset_failures(&mut self) {
        self.execution_trace.failed_steps.clear();
        self.failed_steps_count = 0;
        self.error = None;
    }
}

/// Per-step diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionMetadata {
    /// Input was repaired by the runtime before the step ran
    #[serde(default)]
    pub auto_repaired: bool,
    /// Output item count
    #[serde(default)]
    pub item_count: Option<usize>,
    /// Output field names
    #[serde(default)]
    pub field_names: Vec<String>,
    /// Failure classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    /// Parameter name and offending value for parameter errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_error_details: Option<Value>,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One step's execution within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// Owning execution
    pub execution_id: ExecutionId,
    /// Step id
    pub step_id: StepId,
    /// Display name
    pub step_name: String,
    /// Step type name
    pub step_type: String,
    /// Lifecycle status
    pub status: StepStatus,
    /// Diagnostics
    #[serde(default)]
    pub execution_metadata: StepExecutionMetadata,
    /// Dispatch time
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Final transition time
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Generative tokens consumed
    #[serde(default)]
    pub tokens_used: u64,
    /// Wall time of the last attempt
    #[serde(default)]
    pub execution_time_ms: u64,
    /// 1 for the first run, incremented on every retry by resume
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

const fn first_attempt() -> u32 {
    1
}

impl StepExecutionRecord {
    /// Pending record for a step
    #[must_use]
    pub fn pending(execution_id: ExecutionId, step: &CompiledStep) -> Self {
        Self {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: step.type_name().to_string(),
            status: StepStatus::Pending,
            execution_metadata: StepExecutionMetadata::default(),
            started_at: None,
            completed_at: None,
            tokens_used: 0,
            execution_time_ms: 0,
            attempt: first_attempt(),
        }
    }
}

/// A compiled workflow and its user inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Workflow id
    pub id: WorkflowId,
    /// Display name
    pub name: String,
    /// Goal the workflow was compiled from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Normalized steps
    pub steps: Vec<CompiledStep>,
    /// Values for `{{input.*}}` references
    #[serde(default)]
    pub input_values: Map<String, Value>,
    /// Run every this many seconds; never on a timer when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_seconds: Option<u64>,
    /// Timer runs are allowed
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

fn enabled_by_default() -> bool {
    true
}

impl WorkflowRecord {
    /// New workflow record
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<CompiledStep>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            goal: None,
            steps,
            input_values: Map::new(),
            schedule_seconds: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the goal
    #[must_use]
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Set initial inputs
    #[must_use]
    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.input_values = inputs;
        self
    }

    /// Run on a timer every `seconds`
    #[must_use]
    pub fn with_schedule(mut self, seconds: u64) -> Self {
        self.schedule_seconds = Some(seconds);
        self
    }

    /// Timer interval, if the workflow is enabled and scheduled
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.schedule_seconds
            .filter(|s| self.enabled && *s > 0)
            .map(Duration::from_secs)
    }

    /// Overlay updated inputs; returns the names that changed
    pub fn merge_inputs(&mut self, updates: &Map<String, Value>) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in updates {
            if self.input_values.get(name) != Some(value) {
                self.input_values.insert(name.clone(), value.clone());
                changed.push(name.clone());
            }
        }
        if !changed.is_empty() {
            self.updated_at = Utc::now();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_summary_shapes() {
        let rows = json!([{"subject": "a", "from": "x"}, {"subject": "b", "to": "y"}]);
        let summary = OutputSummary::of(&rows);
        assert_eq!(summary.kind, "array");
        assert_eq!(summary.item_count, 2);
        assert_eq!(summary.field_names, vec!["from", "subject", "to"]);
        assert!(!summary.is_empty);
        assert!(summary.matches(&rows));
        assert!(!summary.matches(&json!([])));

        let empty = OutputSummary::of(&Value::Null);
        assert_eq!((empty.kind.as_str(), empty.item_count, empty.is_empty), ("null", 0, true));
        assert!(OutputSummary::of(&json!("")).is_empty);
        assert_eq!(OutputSummary::of(&json!({"sent": true})).field_names, vec!["sent"]);
    }

    #[test]
    fn test_summary_serializes_without_payload() {
        let value = serde_json::to_value(OutputSummary::of(&json!({"secret": "token-123"}))).unwrap();
        assert_eq!(value["type"], "object");
        assert!(!value.to_string().contains("token-123"));
    }

    #[test]
    fn test_trace_completion_once() {
        let mut trace = ExecutionTrace::default();
        let a = StepId::new("A");
        trace.mark_failed(&a);
        trace.mark_completed(&a, OutputSummary::of(&json!(1)));
        trace.mark_completed(&a, OutputSummary::of(&json!(2)));
        assert_eq!(trace.completed_steps, vec![a.clone()]);
        assert!(trace.failed_steps.is_empty());
        assert!(trace.is_completed("A"));

        let wire = serde_json::to_value(&trace).unwrap();
        assert_eq!(wire["completedSteps"], json!(["A"]));
        assert!(wire["cached_outputs"]["A"].is_object());
    }

    #[test]
    fn test_reset_failures_keeps_completions() {
        let mut record = ExecutionRecord::new(WorkflowId::new(), 2);
        record
            .execution_trace
            .mark_completed(&StepId::new("A"), OutputSummary::of(&json!([1])));
        record.record_failure(&StepId::new("B"));
        record.transition(ExecutionStatus::Failed);
        assert_eq!(record.failed_steps_count, 1);

        record.reset_failures();
        assert_eq!(record.failed_steps_count, 0);
        assert!(record.execution_trace.failed_steps.is_empty());
        assert!(record.execution_trace.is_completed("A"));
        assert!(record.execution_trace.cached_outputs.contains_key("A"));
    }

    #[test]
    fn test_merge_inputs_reports_changes() {
        let mut workflow = WorkflowRecord::new("w", Vec::new());
        workflow.input_values.insert("to".into(), json!("a@example.com"));
        let mut updates = Map::new();
        updates.insert("to".into(), json!("a@example.com"));
        updates.insert("subject".into(), json!("Hi"));
        assert_eq!(workflow.merge_inputs(&updates), vec!["subject"]);
    }

    #[test]
    fn test_schedule_interval() {
        let workflow = WorkflowRecord::new("w", Vec::new());
        assert_eq!(workflow.interval(), None);

        let mut scheduled = workflow.with_schedule(300);
        assert_eq!(scheduled.interval(), Some(Duration::from_secs(300)));
        scheduled.enabled = false;
        assert_eq!(scheduled.interval(), None);
        assert_eq!(WorkflowRecord::new("w", Vec::new()).with_schedule(0).interval(), None);

        let mut value = serde_json::to_value(WorkflowRecord::new("w", Vec::new())).unwrap();
        value.as_object_mut().unwrap().remove("enabled");
        let older: WorkflowRecord = serde_json::from_value(value).unwrap();
        assert!(older.enabled);
        assert_eq!(older.schedule_seconds, None);
    }

    #[test]
    fn test_status_flags() {
        assert!(ExecutionStatus::Paused.is_resumable());
        assert!(!ExecutionStatus::Completed.is_resumable());
        assert!(FailureCategory::ConfigurationError.awaits_user_input());
        assert!(!FailureCategory::ExecutionError.awaits_user_input());
        assert_eq!(serde_json::to_value(ExecutionStatus::RolledBack).unwrap(), "rolled_back");
    }
}
