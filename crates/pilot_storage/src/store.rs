//! Execution store contract and the in-memory implementation.

use crate::record::{ExecutionRecord, StepExecutionRecord, WorkflowRecord};
use async_trait::async_trait;
use indexmap::IndexMap;
use pilot_core::{ExecutionId, PilotError, StepId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Storage result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// A record could not be encoded or decoded
    #[error("serialization error: {reason}")]
    Serialization {
        /// Underlying reason
        reason: String,
    },

    /// The backend failed
    #[error("storage backend error: {reason}")]
    Backend {
        /// Underlying reason
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<StoreError> for PilotError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => PilotError::not_found(kind, id),
            other => PilotError::Persistence {
                reason: other.to_string(),
            },
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file; `None` keeps everything in memory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Durable store at `path`
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Whether records survive the process
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.path.is_some()
    }
}

/// Persistence collaborator for workflow, execution and step records
///
/// Every save is an upsert keyed by the record's id (step executions by
/// execution id and step id).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace a workflow
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> StoreResult<()>;

    /// Load a workflow
    async fn load_workflow(&self, id: WorkflowId) -> StoreResult<WorkflowRecord>;

    /// Every workflow, oldest first
    async fn list_workflows(&self) -> StoreResult<Vec<WorkflowRecord>>;

    /// Insert or replace an execution
    async fn save_execution(&self, execution: &ExecutionRecord) -> StoreResult<()>;

    /// Load an execution
    async fn load_execution(&self, id: ExecutionId) -> StoreResult<ExecutionRecord>;

    /// Executions of one workflow, oldest first
    async fn list_executions(&self, workflow: WorkflowId) -> StoreResult<Vec<ExecutionRecord>>;

    /// Insert or replace a step execution
    async fn save_step_execution(&self, step: &StepExecutionRecord) -> StoreResult<()>;

    /// Load one step execution, if recorded
    async fn load_step_execution(
        &self,
        execution: ExecutionId,
        step: &StepId,
    ) -> StoreResult<Option<StepExecutionRecord>>;

    /// All step executions of an execution
    async fn list_step_executions(&self, execution: ExecutionId) -> StoreResult<Vec<StepExecutionRecord>>;
}

/// In-memory store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<WorkflowId, WorkflowRecord>>,
    executions: RwLock<IndexMap<ExecutionId, ExecutionRecord>>,
    steps: RwLock<HashMap<ExecutionId, IndexMap<StepId, StepExecutionRecord>>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> StoreResult<()> {
        self.workflows.write().await.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, id: WorkflowId) -> StoreResult<WorkflowRecord> {
        self.workflows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Workflow", id))
    }

    async fn list_workflows(&self) -> StoreResult<Vec<WorkflowRecord>> {
        let mut workflows: Vec<WorkflowRecord> = self.workflows.read().await.values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    async fn save_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        self.executions.write().await.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> StoreResult<ExecutionRecord> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Execution", id))
    }

    async fn list_executions(&self, workflow: WorkflowId) -> StoreResult<Vec<ExecutionRecord>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.workflow_id == workflow)
            .cloned()
            .collect())
    }

    async fn save_step_execution(&self, step: &StepExecutionRecord) -> StoreResult<()> {
        self.steps
            .write()
            .await
            .entry(step.execution_id)
            .or_default()
            .insert(step.step_id.clone(), step.clone());
        Ok(())
    }

    async fn load_step_execution(
        &self,
        execution: ExecutionId,
        step: &StepId,
    ) -> StoreResult<Option<StepExecutionRecord>> {
        Ok(self
            .steps
            .read()
            .await
            .get(&execution)
            .and_then(|steps| steps.get(step))
            .cloned())
    }

    async fn list_step_executions(&self, execution: ExecutionId) -> StoreResult<Vec<StepExecutionRecord>> {
        Ok(self
            .steps
            .read()
            .await
            .get(&execution)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecutionStatus, StepStatus};
    use pilot_plan::CompiledStep;
    use serde_json::Map;

    #[tokio::test]
    async fn test_memory_roundtrip_and_not_found() {
        let store = MemoryStore::new();
        let workflow = WorkflowRecord::new("digest", vec![CompiledStep::action("step1", "log", "write", Map::new())]);
        store.save_workflow(&workflow).await.unwrap();
        assert_eq!(store.load_workflow(workflow.id).await.unwrap(), workflow);
        let mut second = WorkflowRecord::new("report", Vec::new());
        second.created_at = workflow.created_at + chrono::TimeDelta::seconds(1);
        store.save_workflow(&second).await.unwrap();
        let names: Vec<String> = store.list_workflows().await.unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["digest", "report"]);

        let mut execution = ExecutionRecord::new(workflow.id, 1);
        store.save_execution(&execution).await.unwrap();
        execution.transition(ExecutionStatus::Running);
        store.save_execution(&execution).await.unwrap();
        let loaded = store.load_execution(execution.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(store.list_executions(workflow.id).await.unwrap().len(), 1);

        let missing = store.load_execution(ExecutionId::new()).await.unwrap_err();
        assert!(matches!(PilotError::from(missing), PilotError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_step_executions_upsert() {
        let store = MemoryStore::new();
        let execution = ExecutionId::new();
        let step = CompiledStep::action("step1", "log", "write", Map::new());
        let mut record = StepExecutionRecord::pending(execution, &step);
        store.save_step_execution(&record).await.unwrap();
        record.status = StepStatus::Completed;
        store.save_step_execution(&record).await.unwrap();

        let all = store.list_step_executions(execution).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, StepStatus::Completed);
        assert!(store
            .load_step_execution(execution, &StepId::new("step2"))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_persistence_error_mapping() {
        let err: PilotError = StoreError::Backend { reason: "disk".into() }.into();
        assert_eq!(err.kind(), "persistence_error");
    }
}
