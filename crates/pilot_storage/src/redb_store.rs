//! Durable store on an embedded redb database.
//!
//! Records are JSON values under string keys. Lock leases live in their own
//! table; acquisition reads and replaces the lease inside one write
//! transaction, which redb serializes, so callers sharing one `RedbStore`
//! cannot both win.
//!
//! redb holds an exclusive lock on the database file, so only one process
//! can open a store at a time. Leases therefore only arbitrate between
//! tasks of that process, and between a process and its successor after a
//! restart. Resuming from several live processes at once needs a shared
//! backend implementing [`LockManager`].

use crate::lock::{LockLease, LockManager};
use crate::record::{ExecutionRecord, StepExecutionRecord, WorkflowRecord};
use crate::store::{ExecutionStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use pilot_core::{ExecutionId, StepId, WorkflowId};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const WORKFLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");
const STEP_EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("step_executions");
const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

macro_rules! backend_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    Self::Backend { reason: err.to_string() }
                }
            }
        )*
    };
}

backend_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    std::io::Error,
);

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Step executions sort under `{execution}/`; `0` is the next byte after `/`
fn step_key(execution: ExecutionId, step: &str) -> String {
    format!("{}/{}", execution, step)
}

/// redb-backed [`ExecutionStore`] and [`LockManager`]
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStore {
    /// Open or create the database file, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or initialized
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

        let txn = db.begin_write()?;
        for table in [WORKFLOWS, EXECUTIONS, STEP_EXECUTIONS, LOCKS] {
            txn.open_table(table)?;
        }
        txn.commit()?;

        info!(path = %path.display(), "opened execution store");
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&WriteTransaction) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write()?;
            let out = f(&txn)?;
            txn.commit()?;
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Backend { reason: e.to_string() })?
    }

    async fn read<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTransaction) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read()?;
            f(&txn)
        })
        .await
        .map_err(|e| StoreError::Backend { reason: e.to_string() })?
    }

    async fn put(&self, table: TableDefinition<'static, &'static str, &'static [u8]>, key: String, bytes: Vec<u8>) -> StoreResult<()> {
        self.write(move |txn| {
            let mut table = txn.open_table(table)?;
            table.insert(key.as_str(), bytes.as_slice())?;
            Ok(())
        })
        .await
    }

    async fn get<T>(&self, table: TableDefinition<'static, &'static str, &'static [u8]>, key: String) -> StoreResult<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.read(move |txn| {
            let table = txn.open_table(table)?;
            let found = table.get(key.as_str())?;
            found.map(|guard| decode(guard.value())).transpose()
        })
        .await
    }
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").field("path", &self.path).finish()
    }
}

#[async_trait]
impl ExecutionStore for RedbStore {
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> StoreResult<()> {
        self.put(WORKFLOWS, workflow.id.to_string(), encode(workflow)?).await
    }

    async fn load_workflow(&self, id: WorkflowId) -> StoreResult<WorkflowRecord> {
        self.get(WORKFLOWS, id.to_string())
            .await?
            .ok_or_else(|| StoreError::not_found("Workflow", id))
    }

    async fn list_workflows(&self) -> StoreResult<Vec<WorkflowRecord>> {
        let mut workflows: Vec<WorkflowRecord> = self
            .read(|txn| {
                let table = txn.open_table(WORKFLOWS)?;
                let mut out: Vec<WorkflowRecord> = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    out.push(decode(value.value())?);
                }
                Ok(out)
            })
            .await?;
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    async fn save_execution(&self, execution: &ExecutionRecord) -> StoreResult<()> {
        self.put(EXECUTIONS, execution.id.to_string(), encode(execution)?).await
    }

    async fn load_execution(&self, id: ExecutionId) -> StoreResult<ExecutionRecord> {
        self.get(EXECUTIONS, id.to_string())
            .await?
            .ok_or_else(|| StoreError::not_found("Execution", id))
    }

    async fn list_executions(&self, workflow: WorkflowId) -> StoreResult<Vec<ExecutionRecord>> {
        let mut executions: Vec<ExecutionRecord> = self
            .read(move |txn| {
                let table = txn.open_table(EXECUTIONS)?;
                let mut out = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    let record: ExecutionRecord = decode(value.value())?;
                    if record.workflow_id == workflow {
                        out.push(record);
                    }
                }
                Ok(out)
            })
            .await?;
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn save_step_execution(&self, step: &StepExecutionRecord) -> StoreResult<()> {
        self.put(STEP_EXECUTIONS, step_key(step.execution_id, step.step_id.as_str()), encode(step)?)
            .await
    }

    async fn load_step_execution(
        &self,
        execution: ExecutionId,
        step: &StepId,
    ) -> StoreResult<Option<StepExecutionRecord>> {
        self.get(STEP_EXECUTIONS, step_key(execution, step.as_str())).await
    }

    async fn list_step_executions(&self, execution: ExecutionId) -> StoreResult<Vec<StepExecutionRecord>> {
        let start = format!("{}/", execution);
        let end = format!("{}0", execution);
        let mut steps: Vec<StepExecutionRecord> = self
            .read(move |txn| {
                let table = txn.open_table(STEP_EXECUTIONS)?;
                let mut out = Vec::new();
                for entry in table.range(start.as_str()..end.as_str())? {
                    let (_, value) = entry?;
                    out.push(decode(value.value())?);
                }
                Ok(out)
            })
            .await?;
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }
}

#[async_trait]
impl LockManager for RedbStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockLease>> {
        let key = key.to_string();
        self.write(move |txn| {
            let mut table = txn.open_table(LOCKS)?;
            let current: Option<LockLease> = table
                .get(key.as_str())?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            if current.is_some_and(|lease| !lease.is_expired_at(Utc::now())) {
                debug!(key = %key, "lock held elsewhere");
                return Ok(None);
            }
            let lease = LockLease::new(key.as_str(), ttl);
            table.insert(key.as_str(), encode(&lease)?.as_slice())?;
            Ok(Some(lease))
        })
        .await
    }

    async fn renew(&self, lease: &LockLease, ttl: Duration) -> StoreResult<Option<LockLease>> {
        let lease = lease.clone();
        self.write(move |txn| {
            let mut table = txn.open_table(LOCKS)?;
            let current: Option<LockLease> = table
                .get(lease.key.as_str())?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            if !current.is_some_and(|held| held.holder == lease.holder) {
                return Ok(None);
            }
            let renewed = lease.renewed(ttl);
            table.insert(renewed.key.as_str(), encode(&renewed)?.as_slice())?;
            Ok(Some(renewed))
        })
        .await
    }

    async fn release(&self, lease: &LockLease) -> StoreResult<bool> {
        let lease = lease.clone();
        self.write(move |txn| {
            let mut table = txn.open_table(LOCKS)?;
            let current: Option<LockLease> = table
                .get(lease.key.as_str())?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            if current.is_some_and(|held| held.holder == lease.holder) {
                table.remove(lease.key.as_str())?;
                return Ok(true);
            }
            Ok(false)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecutionStatus, OutputSummary, StepStatus};
    use pilot_plan::CompiledStep;
    use serde_json::{json, Map};

    fn open() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("nested").join("pilot.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let (dir, store) = open();
        let workflow = WorkflowRecord::new("digest", vec![CompiledStep::action("step1", "log", "write", Map::new())]);
        store.save_workflow(&workflow).await.unwrap();

        let mut execution = ExecutionRecord::new(workflow.id, 1);
        execution
            .execution_trace
            .mark_completed(&StepId::new("step1"), OutputSummary::of(&json!({"logged": {}})));
        execution.transition(ExecutionStatus::Completed);
        store.save_execution(&execution).await.unwrap();
        let path = store.path().to_path_buf();
        drop(store);

        let reopened = RedbStore::open(&path).unwrap();
        assert_eq!(reopened.load_workflow(workflow.id).await.unwrap().name, "digest");
        assert_eq!(reopened.list_workflows().await.unwrap(), vec![workflow.clone()]);
        let loaded = reopened.load_execution(execution.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert!(loaded.execution_trace.is_completed("step1"));
        assert_eq!(reopened.list_executions(workflow.id).await.unwrap().len(), 1);
        assert!(matches!(
            reopened.load_execution(ExecutionId::new()).await,
            Err(StoreError::NotFound { .. })
        ));
        drop(dir);
    }

    #[tokio::test]
    async fn test_step_executions_scoped_to_execution() {
        let (_dir, store) = open();
        let first = ExecutionId::new();
        let second = ExecutionId::new();
        let step = CompiledStep::action("step1", "log", "write", Map::new());

        let mut record = StepExecutionRecord::pending(first, &step);
        store.save_step_execution(&record).await.unwrap();
        record.status = StepStatus::Failed;
        store.save_step_execution(&record).await.unwrap();
        store
            .save_step_execution(&StepExecutionRecord::pending(second, &step))
            .await
            .unwrap();

        let listed = store.list_step_executions(first).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, StepStatus::Failed);
        assert!(store
            .load_step_execution(second, &StepId::new("step1"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lock_compare_and_set() {
        let (_dir, store) = open();
        let ttl = Duration::from_secs(60);
        let lease = store.try_acquire("execution:a:resume", ttl).await.unwrap().unwrap();

        let other_handle = store.clone();
        assert!(other_handle
            .try_acquire("execution:a:resume", ttl)
            .await
            .unwrap()
            .is_none());

        let renewed = store.renew(&lease, ttl).await.unwrap().unwrap();
        assert_eq!(renewed.holder, lease.holder);
        assert!(store.release(&lease).await.unwrap());
        assert!(store.renew(&lease, ttl).await.unwrap().is_none());
        let stale = store.try_acquire("k", Duration::ZERO).await.unwrap().unwrap();
        assert!(store.try_acquire("k", ttl).await.unwrap().is_some());
        assert!(!store.release(&stale).await.unwrap());
    }
}
