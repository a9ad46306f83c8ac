//! Interval triggers for stored workflows.
//!
//! Each scheduled workflow gets one ticker task. The first run happens one
//! interval after scheduling, and a tick that arrives while the previous
//! run is still going is skipped rather than queued. Rescheduling a
//! workflow replaces its task.

use crate::engine::ExecutionEngine;
use pilot_core::{PilotError, PilotResult, WorkflowId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Runs stored workflows on a timer
pub struct WorkflowTrigger {
    engine: Arc<ExecutionEngine>,
    jobs: Mutex<HashMap<WorkflowId, JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkflowTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowTrigger").finish_non_exhaustive()
    }
}

impl WorkflowTrigger {
    /// Create a trigger with no jobs
    #[must_use]
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule every enabled workflow that has an interval.
    ///
    /// Returns how many workflows are scheduled afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the workflows cannot be listed
    #[instrument(skip(self))]
    pub async fn load_jobs(&self) -> PilotResult<usize> {
        let workflows = self.engine.store().list_workflows().await?;
        for workflow in &workflows {
            match workflow.interval() {
                Some(every) => self.schedule(workflow.id, every).await,
                None => {
                    self.unschedule(workflow.id).await;
                }
            }
        }
        let scheduled = self.jobs.lock().await.len();
        info!(scheduled, "workflow triggers loaded");
        Ok(scheduled)
    }

    /// Run `workflow` every `every`, replacing any existing job for it
    pub async fn schedule(&self, workflow: WorkflowId, every: Duration) {
        let engine = Arc::clone(&self.engine);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval yields immediately once
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.run_workflow(workflow).await {
                    Ok(summary) => debug!(
                        workflow = %workflow,
                        execution = %summary.execution_id,
                        status = %summary.status,
                        "scheduled run finished"
                    ),
                    Err(PilotError::NotFound { .. }) => {
                        warn!(workflow = %workflow, "scheduled workflow no longer exists; stopping its trigger");
                        break;
                    }
                    Err(err) => warn!(workflow = %workflow, error = %err, "scheduled run failed"),
                }
            }
        });

        if let Some(previous) = self.jobs.lock().await.insert(workflow, handle) {
            previous.abort();
        }
        info!(workflow = %workflow, every_secs = every.as_secs(), "workflow scheduled");
    }

    /// Stop the job of `workflow`; false if none was scheduled
    pub async fn unschedule(&self, workflow: WorkflowId) -> bool {
        match self.jobs.lock().await.remove(&workflow) {
            Some(handle) => {
                handle.abort();
                debug!(workflow = %workflow, "workflow unscheduled");
                true
            }
            None => false,
        }
    }

    /// Workflows with a live job
    pub async fn scheduled(&self) -> Vec<WorkflowId> {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, handle| !handle.is_finished());
        jobs.keys().copied().collect()
    }

    /// Stop every job
    pub async fn shutdown(&self) {
        for (_, handle) in self.jobs.lock().await.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginRegistry;
    use pilot_log::EventEmitter;
    use pilot_plan::CompiledStep;
    use pilot_storage::{ExecutionStore, MemoryStore, WorkflowRecord};
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(calls: &Arc<AtomicUsize>) -> (Arc<ExecutionEngine>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut registry = PluginRegistry::with_builtins(Vec::new());
        let counter = Arc::clone(calls);
        registry.register_fn("source", "read", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!([]))
        });
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(EventEmitter::new()),
        ));
        (engine, store)
    }

    fn workflow() -> WorkflowRecord {
        WorkflowRecord::new("tick", vec![CompiledStep::action("step1", "source", "read", Map::new())])
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_once_per_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine(&calls);
        let workflow = workflow().with_schedule(60);
        store.save_workflow(&workflow).await.unwrap();

        let trigger = WorkflowTrigger::new(engine);
        assert_eq!(trigger.load_jobs().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.list_executions(workflow.id).await.unwrap().len(), 2);

        assert!(trigger.unschedule(workflow.id).await);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_and_unscheduled_workflows_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine(&calls);
        let mut disabled = workflow().with_schedule(10);
        disabled.enabled = false;
        store.save_workflow(&disabled).await.unwrap();
        store.save_workflow(&workflow()).await.unwrap();

        let trigger = WorkflowTrigger::new(engine);
        assert_eq!(trigger.load_jobs().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_workflow_stops_its_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (engine, _store) = engine(&calls);
        let trigger = WorkflowTrigger::new(engine);
        let ghost = WorkflowId::new();
        trigger.schedule(ghost, Duration::from_secs(5)).await;
        assert_eq!(trigger.scheduled().await, vec![ghost]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(trigger.scheduled().await.is_empty());
        trigger.shutdown().await;
    }
}
