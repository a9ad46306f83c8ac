//! Route handlers

use crate::api::AppState;
use crate::error::{ApiError, ApiResult};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use pilot_calibrate::{CalibrationReport, DetectRequest};
use pilot_core::{ExecutionId, WorkflowId};
use pilot_plan::{CompileMetadata, CompileRequest, CompileResponse, PipelineContext};
use pilot_runtime::{ResumeResponse, RunSummary, StatusReport};
use pilot_storage::{ExecutionRecord, ExecutionStatus, WorkflowRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "env": state.runtime.settings().env,
        "uptime_seconds": state.started.elapsed().as_secs(),
    }))
}

/// `POST /compile`
///
/// Failures come back as `success: false` with status 422.
pub async fn compile(
    State(state): State<AppState>,
    Json(request): Json<CompileRequest>,
) -> (StatusCode, Json<CompileResponse>) {
    let compiler = state.runtime.compiler();
    let result = match request.compiler_config {
        Some(config) => compiler.reconfigured(config).compile(&request.ir, request.pipeline_context).await,
        None => compiler.compile(&request.ir, request.pipeline_context).await,
    };
    let response = CompileResponse::from(result);
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(response))
}

/// Body of `POST /workflows`
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    /// Display name
    pub name: String,
    /// Raw IR document
    pub ir: Value,
    /// Optional planning context
    #[serde(default)]
    pub pipeline_context: Option<PipelineContext>,
    /// Initial input values
    #[serde(default, alias = "inputValues")]
    pub input_values: Map<String, Value>,
    /// Run every this many seconds
    #[serde(default, alias = "scheduleSeconds")]
    pub schedule_seconds: Option<u64>,
}

/// Response of `POST /workflows`
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorkflowResponse {
    /// Stored workflow
    pub workflow_id: WorkflowId,
    /// Top-level steps
    pub step_count: usize,
    /// Normalizer warnings
    pub warnings: Vec<String>,
    /// Compilation metadata
    pub metadata: CompileMetadata,
}

/// `POST /workflows`
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<CreateWorkflowResponse>)> {
    let (mut workflow, output) = state
        .runtime
        .create_workflow(&request.name, &request.ir, request.pipeline_context)
        .await?;
    if !request.input_values.is_empty() || request.schedule_seconds.is_some() {
        workflow.merge_inputs(&request.input_values);
        workflow.schedule_seconds = request.schedule_seconds;
        state.runtime.store().save_workflow(&workflow).await.map_err(pilot_core::PilotError::from)?;
    }
    if let Some(every) = workflow.interval() {
        state.runtime.trigger().schedule(workflow.id, every).await;
    }
    Ok((
        StatusCode::CREATED,
        Json(CreateWorkflowResponse {
            workflow_id: workflow.id,
            step_count: workflow.steps.len(),
            warnings: output.warnings,
            metadata: output.metadata,
        }),
    ))
}

/// Entry of `GET /workflows`
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow id
    pub workflow_id: WorkflowId,
    /// Display name
    pub name: String,
    /// Goal the workflow was compiled from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Top-level steps
    pub step_count: usize,
    /// Timer interval in seconds
    pub schedule_seconds: Option<u64>,
    /// Timer runs allowed
    pub enabled: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl From<WorkflowRecord> for WorkflowSummary {
    fn from(workflow: WorkflowRecord) -> Self {
        Self {
            workflow_id: workflow.id,
            step_count: workflow.steps.len(),
            name: workflow.name,
            goal: workflow.goal,
            schedule_seconds: workflow.schedule_seconds,
            enabled: workflow.enabled,
            created_at: workflow.created_at,
        }
    }
}

/// `GET /workflows`
pub async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkflowSummary>>> {
    let workflows = state
        .runtime
        .store()
        .list_workflows()
        .await
        .map_err(pilot_core::PilotError::from)?;
    Ok(Json(workflows.into_iter().map(WorkflowSummary::from).collect()))
}

/// Entry of `GET /workflows/{id}/executions`
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Execution id
    pub execution_id: ExecutionId,
    /// Lifecycle status
    pub status: ExecutionStatus,
    /// Steps in the workflow
    pub total_steps: usize,
    /// Steps completed so far
    pub completed_steps: usize,
    /// Resumes so far
    pub resume_count: u32,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ExecutionRecord> for ExecutionSummary {
    fn from(execution: ExecutionRecord) -> Self {
        Self {
            execution_id: execution.id,
            status: execution.status,
            total_steps: execution.total_steps,
            completed_steps: execution.execution_trace.completed_steps.len(),
            resume_count: execution.resume_count,
            error: execution.error,
            created_at: execution.created_at,
            completed_at: execution.completed_at,
        }
    }
}

/// `GET /workflows/{id}/executions`, oldest first
pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<WorkflowId>,
) -> ApiResult<Json<Vec<ExecutionSummary>>> {
    state.runtime.workflow(id).await?;
    let executions = state
        .runtime
        .store()
        .list_executions(id)
        .await
        .map_err(pilot_core::PilotError::from)?;
    Ok(Json(executions.into_iter().map(ExecutionSummary::from).collect()))
}

/// `POST /workflows/{id}/run`
pub async fn run_workflow(State(state): State<AppState>, Path(id): Path<WorkflowId>) -> ApiResult<Json<RunSummary>> {
    let summary = state.runtime.engine().run_workflow(id).await?;
    Ok(Json(summary))
}

/// Body of `POST /executions/{id}/resume`
#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    /// Corrected input values
    #[serde(default, alias = "updatedInputValues")]
    pub updated_input_values: Option<Map<String, Value>>,
}

/// `POST /executions/{id}/resume`
///
/// Answers 409 while another resume holds the lock.
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
    body: Option<Json<ResumeRequest>>,
) -> ApiResult<Json<ResumeResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let response = state.runtime.resume().resume(id, request.updated_input_values).await?;
    Ok(Json(response))
}

/// `POST /executions/{id}/pause`
pub async fn pause(State(state): State<AppState>, Path(id): Path<ExecutionId>) -> ApiResult<Json<Value>> {
    if state.runtime.engine().pause(id).await {
        info!(execution = %id, "pause accepted");
        Ok(Json(serde_json::json!({"execution_id": id, "pause_requested": true})))
    } else {
        Err(ApiError::new(
            StatusCode::CONFLICT,
            "invalid_state",
            format!("execution {} is not running in this process", id),
        ))
    }
}

/// `GET /executions/{id}/status`
pub async fn status(State(state): State<AppState>, Path(id): Path<ExecutionId>) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.runtime.status().report(id).await?))
}

/// `POST /calibration/hardcodes`
pub async fn detect_hardcodes(
    State(state): State<AppState>,
    Json(request): Json<DetectRequest>,
) -> ApiResult<Json<CalibrationReport>> {
    let report = state
        .calibration
        .detect(request.workflow_id, request.step_id.as_ref())
        .await?;
    Ok(Json(report))
}
