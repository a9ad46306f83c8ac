//! Calibration against stored workflows.

use crate::detect::{referenced_inputs, DetectionReport, HardcodeDetector};
use pilot_core::{ExecutionId, PilotError, PilotResult, StepId, WorkflowId};
use pilot_plan::CompiledStep;
use pilot_storage::{ExecutionStore, WorkflowRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

/// Hardcode detection request as accepted over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectRequest {
    /// Workflow to scan
    #[serde(alias = "agentId", alias = "agent_id")]
    pub workflow_id: WorkflowId,
    /// Step to scan; the whole workflow when absent
    #[serde(default, alias = "stepId")]
    pub step_id: Option<StepId>,
}

/// Result of a calibration scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Scanned workflow
    pub workflow_id: WorkflowId,
    /// Scanned step, if scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    /// Findings by category
    pub findings: DetectionReport,
    /// Inputs the scanned steps already reference
    pub referenced_inputs: Vec<String>,
}

/// Runs the detector against persisted workflows
pub struct CalibrationService {
    store: Arc<dyn ExecutionStore>,
    detector: HardcodeDetector,
}

impl std::fmt::Debug for CalibrationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationService").finish_non_exhaustive()
    }
}

impl CalibrationService {
    /// Create a service over `store`
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            detector: HardcodeDetector::new(),
        }
    }

    /// Scan one step of a workflow, or all of it
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the workflow or step does not exist
    #[instrument(skip(self), fields(workflow = %workflow_id))]
    pub async fn detect(&self, workflow_id: WorkflowId, step_id: Option<&StepId>) -> PilotResult<CalibrationReport> {
        let workflow = self.store.load_workflow(workflow_id).await?;
        self.scan(&workflow, step_id)
    }

    /// Scan the first failed step of an execution
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the execution or its workflow is missing and
    /// `InvalidState` if no step failed
    #[instrument(skip(self), fields(execution = %execution_id))]
    pub async fn detect_failed(&self, execution_id: ExecutionId) -> PilotResult<CalibrationReport> {
        let execution = self.store.load_execution(execution_id).await?;
        let failed = execution
            .execution_trace
            .failed_steps
            .first()
            .cloned()
            .ok_or_else(|| PilotError::InvalidState {
                reason: format!("execution {} has no failed step", execution_id),
            })?;
        let workflow = self.store.load_workflow(execution.workflow_id).await?;
        self.scan(&workflow, Some(&failed))
    }

    fn scan(&self, workflow: &WorkflowRecord, step_id: Option<&StepId>) -> PilotResult<CalibrationReport> {
        let scope: Vec<CompiledStep> = match step_id {
            Some(id) => vec![find_step(&workflow.steps, id)
                .cloned()
                .ok_or_else(|| PilotError::not_found("step", id))?],
            None => workflow.steps.clone(),
        };

        let findings = self.detector.detect(&scope, Some(&workflow.input_values));
        let mut inputs: Vec<String> = Vec::new();
        for name in scope.iter().flat_map(referenced_inputs) {
            if !inputs.contains(&name) {
                inputs.push(name);
            }
        }

        let scoped = step_id.map(StepId::as_str);
        info!(
            step = ?scoped,
            findings = findings.len(),
            referenced = inputs.len(),
            "calibration scan"
        );
        Ok(CalibrationReport {
            workflow_id: workflow.id,
            step_id: step_id.cloned(),
            findings,
            referenced_inputs: inputs,
        })
    }
}

/// Find a step by id, searching nested bodies
fn find_step<'a>(steps: &'a [CompiledStep], id: &StepId) -> Option<&'a CompiledStep> {
    steps.iter().find_map(|step| {
        if &step.id == id {
            Some(step)
        } else {
            find_step(step.kind.nested_steps(), id)
        }
    })
}
