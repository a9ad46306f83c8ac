//! Resuming failed or paused executions.
//!
//! A resume may run in a different process than the original attempt, so
//! it is serialized by the distributed lock `execution:{id}:resume` rather
//! than an in-process mutex, and it rebuilds all scheduling state from the
//! persisted records. A heartbeat renews the lease every third of its TTL
//! while the resume runs, so long steps keep it. The lock is released on
//! every exit path; if the holder dies instead, the lease lapses after its
//! TTL.

use crate::engine::{ExecutionEngine, RunSummary};
use futures::FutureExt;
use pilot_core::{ExecutionId, PilotError, PilotResult};
use pilot_storage::{ExecutionStatus, ExecutionStore, LockLease, LockManager};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Resume configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    /// Lease length of the resume lock, in seconds
    pub lock_ttl_secs: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self { lock_ttl_secs: 60 }
    }
}

impl ResumeConfig {
    /// Set the lock lease length
    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_secs = ttl.as_secs();
        self
    }

    /// Lock lease length
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Counters of one resume attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeResult {
    /// Execution completed
    pub success: bool,
    /// Steps completed in this attempt
    #[serde(rename = "stepsCompleted")]
    pub steps_completed: usize,
    /// Steps failed in this attempt
    #[serde(rename = "stepsFailed")]
    pub steps_failed: usize,
    /// Tokens used in this attempt
    #[serde(rename = "totalTokensUsed")]
    pub total_tokens_used: u64,
    /// Step time in this attempt, in milliseconds
    #[serde(rename = "totalExecutionTime")]
    pub total_execution_time_ms: u64,
}

/// Response of [`ResumeService::resume`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeResponse {
    /// Execution completed
    pub success: bool,
    /// Resumed execution
    pub execution_id: ExecutionId,
    /// Status after the attempt
    pub status: ExecutionStatus,
    /// Attempt counters
    pub result: ResumeResult,
}

impl From<RunSummary> for ResumeResponse {
    fn from(summary: RunSummary) -> Self {
        let success = summary.success();
        Self {
            success,
            execution_id: summary.execution_id,
            status: summary.status,
            result: ResumeResult {
                success,
                steps_completed: summary.steps_completed,
                steps_failed: summary.steps_failed,
                total_tokens_used: summary.total_tokens_used,
                total_execution_time_ms: summary.total_execution_time_ms,
            },
        }
    }
}

impl ResumeResponse {
    fn already_completed(execution_id: ExecutionId) -> Self {
        Self {
            success: true,
            execution_id,
            status: ExecutionStatus::Completed,
            result: ResumeResult {
                success: true,
                ..ResumeResult::default()
            },
        }
    }
}

/// Resumes executions under the distributed lock
pub struct ResumeService {
    store: Arc<dyn ExecutionStore>,
    locks: Arc<dyn LockManager>,
    engine: Arc<ExecutionEngine>,
    config: ResumeConfig,
}

impl std::fmt::Debug for ResumeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeService").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ResumeService {
    /// Create a resume service
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>, locks: Arc<dyn LockManager>, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            store,
            locks,
            engine,
            config: ResumeConfig::default(),
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn with_config(mut self, config: ResumeConfig) -> Self {
        self.config = config;
        self
    }

    /// Resume an execution, optionally with corrected input values.
    ///
    /// Completed steps are kept and not re-run; failed steps and anything
    /// downstream of them run again.
    ///
    /// # Errors
    ///
    /// - `LockConflict` if another resume holds the lock; retry later
    /// - `InvalidState` if the execution is neither failed, paused nor running
    /// - `NotFound` or `Persistence` from the store
    #[instrument(skip(self, updated_inputs), fields(execution = %execution_id))]
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        updated_inputs: Option<Map<String, Value>>,
    ) -> PilotResult<ResumeResponse> {
        let key = execution_id.resume_lock_key();
        let Some(lease) = self.locks.try_acquire(&key, self.config.lock_ttl()).await? else {
            info!(key = %key, "resume already in progress");
            return Err(PilotError::LockConflict { key });
        };

        let heartbeat = self.spawn_heartbeat(execution_id, lease.clone());
        let outcome = AssertUnwindSafe(self.resume_locked(execution_id, updated_inputs))
            .catch_unwind()
            .await;
        heartbeat.abort();

        match self.locks.release(&lease).await {
            Ok(true) => debug!(key = %lease.key, "resume lock released"),
            Ok(false) => warn!(key = %lease.key, "resume lock lapsed before release"),
            Err(err) => warn!(key = %lease.key, error = %err, "could not release resume lock"),
        }

        outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(PilotError::Internal {
                message: format!("resume panicked: {}", message),
            })
        })
    }

    /// Keep the lease alive until aborted.
    ///
    /// Losing the lease to another holder pauses the execution so the two
    /// attempts stop racing at the next step boundary.
    fn spawn_heartbeat(&self, execution_id: ExecutionId, mut lease: LockLease) -> JoinHandle<()> {
        let locks = Arc::clone(&self.locks);
        let engine = Arc::clone(&self.engine);
        let ttl = self.config.lock_ttl();
        let interval = (ttl / 3).max(MIN_RENEW_INTERVAL);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match locks.renew(&lease, ttl).await {
                    Ok(Some(renewed)) => {
                        debug!(key = %renewed.key, expires_at = %renewed.expires_at, "resume lock renewed");
                        lease = renewed;
                    }
                    Ok(None) => {
                        warn!(key = %lease.key, "resume lock taken over; pausing execution");
                        engine.pause(execution_id).await;
                        break;
                    }
                    Err(err) => warn!(key = %lease.key, error = %err, "could not renew resume lock"),
                }
            }
        })
    }

    async fn resume_locked(
        &self,
        execution_id: ExecutionId,
        updated_inputs: Option<Map<String, Value>>,
    ) -> PilotResult<ResumeResponse> {
        let mut execution = self.store.load_execution(execution_id).await?;
        if execution.status == ExecutionStatus::Completed {
            info!("execution already completed; nothing to resume");
            return Ok(ResumeResponse::already_completed(execution_id));
        }
        if !execution.status.is_resumable() {
            return Err(PilotError::InvalidState {
                reason: format!(
                    "execution {} is {}; only failed, paused or running executions can be resumed",
                    execution_id, execution.status
                ),
            });
        }

        let mut workflow = self.store.load_workflow(execution.workflow_id).await?;
        if let Some(updates) = updated_inputs.filter(|u| !u.is_empty()) {
            let changed = workflow.merge_inputs(&updates);
            if !changed.is_empty() {
                info!(?changed, "workflow inputs updated");
                self.store.save_workflow(&workflow).await?;
            }
        }

        let retrying = execution.execution_trace.failed_steps.len();
        execution.reset_failures();
        execution.resume_count = execution.resume_count.saturating_add(1);
        self.store.save_execution(&execution).await?;
        info!(
            resume = execution.resume_count,
            retrying,
            kept = execution.execution_trace.completed_steps.len(),
            "resuming execution"
        );

        let summary = self.engine.drive(execution, &workflow).await?;
        Ok(summary.into())
    }
}
