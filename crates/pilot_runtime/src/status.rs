//! User-facing execution status.
//!
//! Reports carry per-step friendly text and output summaries only; step
//! payloads never leave the engine. Paused executions list the decisions
//! the user has to make before resuming.

use pilot_core::{ExecutionId, PilotResult, StepId, WorkflowId};
use pilot_storage::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, FailureCategory, OutputSummary, StepExecutionRecord, StepStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Step counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Top-level steps
    pub total_steps: usize,
    /// Completed
    pub completed: usize,
    /// Failed in the current attempt
    pub failed: usize,
    /// Skipped
    pub skipped: usize,
    /// Not yet run
    pub pending: usize,
}

/// Status of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusReport {
    /// Step id
    pub step_id: StepId,
    /// Display name
    pub step_name: String,
    /// Step type
    pub step_type: String,
    /// Lifecycle status
    pub status: StepStatus,
    /// Short text for display
    pub friendly_status: String,
    /// Input was repaired before the step ran
    pub auto_repaired: bool,
    /// Failure explained for the user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_error: Option<String>,
    /// Output snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<OutputSummary>,
    /// Failure classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    /// Attempt number of the latest run
    pub attempt: u32,
}

/// A question the user must answer before resuming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Step awaiting input
    pub step_id: StepId,
    /// Step name
    pub step_name: String,
    /// Why the step stopped
    pub category: FailureCategory,
    /// What the user is asked to do
    pub question: String,
    /// Parameter to supply, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    /// Raw parameter failure details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Status of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Execution id
    pub execution_id: ExecutionId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Lifecycle status
    pub status: ExecutionStatus,
    /// One-line description
    pub friendly_summary: String,
    /// Step counts
    pub progress: Progress,
    /// Top-level steps in workflow order
    pub steps: Vec<StepStatusReport>,
    /// Decisions awaiting the user
    pub pending_decisions: Vec<DecisionRequest>,
    /// Tokens across all attempts
    pub total_tokens_used: u64,
    /// Resumes so far
    pub resume_count: u32,
}

/// Builds [`StatusReport`]s from persisted records
pub struct StatusReporter {
    store: Arc<dyn ExecutionStore>,
}

impl StatusReporter {
    /// Create a reporter
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Report on an execution
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the execution or its workflow is missing
    pub async fn report(&self, execution_id: ExecutionId) -> PilotResult<StatusReport> {
        let execution = self.store.load_execution(execution_id).await?;
        let workflow = self.store.load_workflow(execution.workflow_id).await?;
        let mut records: HashMap<StepId, StepExecutionRecord> = self
            .store
            .list_step_executions(execution_id)
            .await?
            .into_iter()
            .map(|r| (r.step_id.clone(), r))
            .collect();

        let trace = &execution.execution_trace;
        let mut steps = Vec::with_capacity(workflow.steps.len());
        let mut details: HashMap<StepId, Option<Value>> = HashMap::new();
        for step in &workflow.steps {
            let record = records.remove(&step.id);
            let status = if trace.is_completed(step.id.as_str()) {
                StepStatus::Completed
            } else if trace.is_skipped(step.id.as_str()) {
                StepStatus::Skipped
            } else {
                match record.as_ref().map(|r| r.status) {
                    Some(StepStatus::Failed) if !trace.failed_steps.contains(&step.id) => StepStatus::Pending,
                    Some(status) => status,
                    None => StepStatus::Pending,
                }
            };
            let metadata = record.as_ref().map(|r| &r.execution_metadata);
            let failure_category = metadata
                .and_then(|m| m.failure_category)
                .filter(|_| status == StepStatus::Failed);
            let parameter_details = metadata.and_then(|m| m.parameter_error_details.clone());
            let output_summary = trace.cached_outputs.get(&step.id).cloned();

            steps.push(StepStatusReport {
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                step_type: step.type_name().to_string(),
                status,
                friendly_status: friendly_status(status, failure_category, output_summary.as_ref()),
                auto_repaired: metadata.is_some_and(|m| m.auto_repaired),
                friendly_error: failure_category.map(|category| {
                    friendly_error(
                        category,
                        parameter_name(parameter_details.as_ref()),
                        metadata.and_then(|m| m.error_message.as_deref()).unwrap_or_default(),
                    )
                }),
                output_summary,
                failure_category,
                attempt: record.as_ref().map_or(0, |r| r.attempt),
            });
            if status == StepStatus::Failed {
                details.insert(step.id.clone(), parameter_details);
            }
        }

        let pending_decisions = if execution.status == ExecutionStatus::Paused {
            decisions(&steps, &details)
        } else {
            Vec::new()
        };

        let progress = Progress {
            total_steps: steps.len(),
            completed: count(&steps, StepStatus::Completed),
            failed: count(&steps, StepStatus::Failed),
            skipped: count(&steps, StepStatus::Skipped),
            pending: count(&steps, StepStatus::Pending) + count(&steps, StepStatus::Running),
        };

        Ok(StatusReport {
            execution_id,
            workflow_id: execution.workflow_id,
            status: execution.status,
            friendly_summary: friendly_summary(&execution, &progress, pending_decisions.len()),
            progress,
            steps,
            pending_decisions,
            total_tokens_used: execution.total_tokens_used,
            resume_count: execution.resume_count,
        })
    }
}

fn decisions(steps: &[StepStatusReport], details: &HashMap<StepId, Option<Value>>) -> Vec<DecisionRequest> {
    steps
        .iter()
        .filter_map(|step| {
            let category = step.failure_category.filter(|c| c.awaits_user_input())?;
            let details = details.get(&step.step_id).cloned().flatten();
            let parameter = parameter_name(details.as_ref());
            let question = match (category, parameter.as_deref()) {
                (FailureCategory::ParameterError, Some(name)) => {
                    format!("Provide a value for '{}' used by \"{}\", then resume.", name, step.step_name)
                }
                (FailureCategory::ParameterError, None) => {
                    format!("Correct the parameters of \"{}\", then resume.", step.step_name)
                }
                _ => format!("Connect or configure the integration used by \"{}\", then resume.", step.step_name),
            };
            Some(DecisionRequest {
                step_id: step.step_id.clone(),
                step_name: step.step_name.clone(),
                category,
                question,
                parameter,
                details,
            })
        })
        .collect()
}

fn parameter_name(details: Option<&Value>) -> Option<String> {
    details
        .and_then(|d| d.get("parameter"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn count(steps: &[StepStatusReport], status: StepStatus) -> usize {
    steps.iter().filter(|s| s.status == status).count()
}

fn friendly_status(status: StepStatus, category: Option<FailureCategory>, summary: Option<&OutputSummary>) -> String {
    match status {
        StepStatus::Pending => "Waiting to run".to_string(),
        StepStatus::Running => "Running".to_string(),
        StepStatus::Skipped => "Skipped (branch not taken)".to_string(),
        StepStatus::Completed => match summary {
            Some(s) if s.is_empty => "Completed with no results".to_string(),
            Some(s) if s.kind == "array" => format!("Completed with {} {}", s.item_count, plural(s.item_count, "item")),
            _ => "Completed".to_string(),
        },
        StepStatus::Failed => match category {
            Some(c) if c.awaits_user_input() => "Needs your input".to_string(),
            _ => "Failed".to_string(),
        },
    }
}

fn friendly_error(category: FailureCategory, parameter: Option<String>, message: &str) -> String {
    match (category, parameter) {
        (FailureCategory::ParameterError, Some(name)) => {
            format!("The value for '{}' is missing or invalid. Update it and resume.", name)
        }
        (FailureCategory::ParameterError, None) => format!("A parameter is missing or invalid: {}", message),
        (FailureCategory::ConfigurationError, _) => format!("An integration is not set up: {}", message),
        (FailureCategory::ExecutionError, _) => format!("The step failed: {}", message),
    }
}

fn friendly_summary(execution: &ExecutionRecord, progress: &Progress, decisions: usize) -> String {
    let done = progress.completed;
    let total = progress.total_steps;
    match execution.status {
        ExecutionStatus::Pending => "Not started yet".to_string(),
        ExecutionStatus::Running => format!("Running: {} of {} steps completed", done, total),
        ExecutionStatus::Completed => format!("Completed all {} {}", total, plural(total, "step")),
        ExecutionStatus::Paused if decisions > 0 => format!(
            "Paused: {} {} waiting for your input ({} of {} steps completed)",
            decisions,
            plural(decisions, "step"),
            done,
            total
        ),
        ExecutionStatus::Paused => format!("Paused after {} of {} steps", done, total),
        ExecutionStatus::Failed => match &execution.error {
            Some(error) => format!("Failed after {} of {} steps: {}", done, total, error),
            None => format!("Failed after {} of {} steps", done, total),
        },
        ExecutionStatus::RolledBack => "Rolled back".to_string(),
    }
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_plan::CompiledStep;
    use pilot_storage::{MemoryStore, WorkflowRecord};
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_paused_report_lists_decision_without_payloads() {
        let store = Arc::new(MemoryStore::new());
        let fetch = CompiledStep::action("step1", "mock_email", "fetch", Map::new());
        let send = CompiledStep::action("step2", "email", "send", Map::new()).depends_on("step1");
        let workflow = WorkflowRecord::new("digest", vec![fetch.clone(), send.clone()]);
        store.save_workflow(&workflow).await.unwrap();

        let mut execution = ExecutionRecord::new(workflow.id, 2);
        let output = json!([{"subject": "secret invoice", "from": "a@example.com"}]);
        execution
            .execution_trace
            .mark_completed(&fetch.id, OutputSummary::of(&output));
        execution.record_failure(&send.id);
        execution.transition(ExecutionStatus::Paused);
        store.save_execution(&execution).await.unwrap();

        let mut failed = StepExecutionRecord::pending(execution.id, &send);
        failed.status = StepStatus::Failed;
        failed.execution_metadata.failure_category = Some(FailureCategory::ParameterError);
        failed.execution_metadata.parameter_error_details = Some(json!({"parameter": "to"}));
        failed.execution_metadata.error_message = Some("missing required parameter 'to'".into());
        store.save_step_execution(&failed).await.unwrap();

        let report = StatusReporter::new(store).report(execution.id).await.unwrap();
        assert_eq!(report.steps[0].friendly_status, "Completed with 1 item");
        assert_eq!(report.steps[1].friendly_status, "Needs your input");
        assert_eq!(report.pending_decisions.len(), 1);
        assert_eq!(report.pending_decisions[0].parameter.as_deref(), Some("to"));
        assert!(report.friendly_summary.starts_with("Paused: 1 step waiting"));

        let text = serde_json::to_string(&report).unwrap();
        assert!(!text.contains("secret invoice"));
        assert!(text.contains("\"field_names\""));
    }

    #[tokio::test]
    async fn test_retried_failure_reads_as_pending() {
        let store = Arc::new(MemoryStore::new());
        let step = CompiledStep::action("step1", "log", "write", Map::new());
        let workflow = WorkflowRecord::new("w", vec![step.clone()]);
        store.save_workflow(&workflow).await.unwrap();

        let mut execution = ExecutionRecord::new(workflow.id, 1);
        execution.transition(ExecutionStatus::Running);
        store.save_execution(&execution).await.unwrap();
        let mut record = StepExecutionRecord::pending(execution.id, &step);
        record.status = StepStatus::Failed;
        store.save_step_execution(&record).await.unwrap();

        let report = StatusReporter::new(store).report(execution.id).await.unwrap();
        assert_eq!(report.steps[0].status, StepStatus::Pending);
        assert!(report.pending_decisions.is_empty());
        assert_eq!(report.progress.pending, 1);
    }
}
