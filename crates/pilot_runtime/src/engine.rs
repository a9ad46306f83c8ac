//! Execution engine.
//!
//! Drives one execution attempt: builds the scheduler from the persisted
//! trace, dispatches ready steps as tokio tasks up to `parallelism`, and
//! persists every step transition before moving on. A persistence failure
//! on a state transition aborts the attempt; event delivery never does.
//!
//! Full step outputs live only in this process's payload cache. Persisted
//! records carry [`OutputSummary`] snapshots. The cache holds a bounded
//! number of executions and forgets those idle longer than its TTL.

use crate::classify::{classify, parameter_details};
use crate::executor::{NestedRun, StepExecutor, StepRun};
use crate::plugin::PluginExecutor;
use crate::resolver::VariablePool;
use crate::scheduler::{ScheduleDecision, Scheduler, StepState};
use chrono::Utc;
use indexmap::IndexMap;
use pilot_core::{ExecutionId, PilotError, PilotResult, StepId, WorkflowId};
use pilot_log::{EventEmitter, EventKind, ExecutionEvent};
use pilot_plan::step::DEFAULT_MAX_DEPTH;
use pilot_plan::{CompiledStep, StepGraph};
use pilot_storage::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, FailureCategory, OutputSummary, StepExecutionRecord, StepStatus,
    WorkflowRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Execution engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Steps (and scatter items) running at once
    pub parallelism: usize,
    /// Item cap when a loop or scatter sets none
    pub default_max_iterations: usize,
    /// Deepest allowed loop/scatter nesting
    pub max_nesting_depth: usize,
    /// Unfinished executions whose step outputs stay cached for resume
    pub payload_cache_capacity: usize,
    /// Seconds an idle execution's outputs stay cached
    pub payload_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            default_max_iterations: 100,
            max_nesting_depth: DEFAULT_MAX_DEPTH,
            payload_cache_capacity: 256,
            payload_cache_ttl_secs: 3600,
        }
    }
}

impl EngineConfig {
    /// Set parallelism (at least 1)
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the default item cap
    #[must_use]
    pub fn with_default_max_iterations(mut self, max: usize) -> Self {
        self.default_max_iterations = max;
        self
    }

    /// Set the nesting limit
    #[must_use]
    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// Bound the payload cache
    #[must_use]
    pub fn with_payload_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.payload_cache_capacity = capacity;
        self.payload_cache_ttl_secs = ttl.as_secs();
        self
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Execution id
    pub execution_id: ExecutionId,
    /// Status after the attempt
    pub status: ExecutionStatus,
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

impl RunSummary {
    /// Whether the execution completed
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Pause requests for running executions
#[derive(Debug, Clone, Default)]
pub struct PauseRegistry {
    flags: Arc<Mutex<HashMap<ExecutionId, Arc<AtomicBool>>>>,
}

impl PauseRegistry {
    /// Track an execution; returns its pause flag
    pub async fn register(&self, id: ExecutionId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.lock().await.insert(id, Arc::clone(&flag));
        flag
    }

    /// Request a pause; false if the execution is not running here
    pub async fn request_pause(&self, id: ExecutionId) -> bool {
        match self.flags.lock().await.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Stop tracking an execution
    pub async fn unregister(&self, id: ExecutionId) {
        self.flags.lock().await.remove(&id);
    }
}

/// Step outputs of unfinished executions, kept for same-process resumes.
///
/// Least recently touched executions are dropped first once `capacity` is
/// exceeded; entries idle for `ttl` are dropped on the next access.
#[derive(Debug, Clone)]
struct PayloadCache {
    inner: Arc<RwLock<IndexMap<ExecutionId, CachedOutputs>>>,
    capacity: usize,
    ttl: Duration,
}

#[derive(Debug)]
struct CachedOutputs {
    touched: Instant,
    outputs: HashMap<StepId, Value>,
}

impl PayloadCache {
    fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Arc::default(),
            capacity: config.payload_cache_capacity,
            ttl: Duration::from_secs(config.payload_cache_ttl_secs),
        }
    }

    async fn snapshot(&self, id: ExecutionId) -> HashMap<StepId, Value> {
        let mut inner = self.inner.write().await;
        self.expire(&mut inner);
        inner.get(&id).map(|cached| cached.outputs.clone()).unwrap_or_default()
    }

    async fn insert(&self, id: ExecutionId, step: StepId, value: Value) {
        let mut inner = self.inner.write().await;
        self.expire(&mut inner);
        let mut cached = inner.shift_remove(&id).unwrap_or_else(|| CachedOutputs {
            touched: Instant::now(),
            outputs: HashMap::new(),
        });
        cached.touched = Instant::now();
        cached.outputs.insert(step, value);
        inner.insert(id, cached);
        while inner.len() > self.capacity {
            if let Some((dropped, _)) = inner.shift_remove_index(0) {
                debug!(execution = %dropped, "payload cache full; dropping oldest execution");
            }
        }
    }

    async fn evict(&self, id: ExecutionId) {
        self.inner.write().await.shift_remove(&id);
    }

    fn expire(&self, inner: &mut IndexMap<ExecutionId, CachedOutputs>) {
        let now = Instant::now();
        inner.retain(|_, cached| now.duration_since(cached.touched) < self.ttl);
    }
}

/// Per-attempt bookkeeping
#[derive(Default)]
struct Attempt {
    running: HashMap<StepId, StepExecutionRecord>,
    failures: Vec<(StepId, FailureCategory, String)>,
    completed: usize,
    tokens_used: u64,
    execution_time_ms: u64,
}

/// Runs workflows and persists their progress
pub struct ExecutionEngine {
    store: Arc<dyn ExecutionStore>,
    executor: StepExecutor,
    plugins: Arc<dyn PluginExecutor>,
    events: Arc<EventEmitter>,
    config: EngineConfig,
    pauses: PauseRegistry,
    payloads: PayloadCache,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Create an engine with the default configuration
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>, plugins: Arc<dyn PluginExecutor>, events: Arc<EventEmitter>) -> Self {
        let config = EngineConfig::default();
        Self {
            store,
            executor: StepExecutor::new(Arc::clone(&plugins), config),
            plugins,
            events,
            config,
            pauses: PauseRegistry::default(),
            payloads: PayloadCache::new(&config),
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.executor = StepExecutor::new(Arc::clone(&self.plugins), config);
        self.payloads = PayloadCache::new(&config);
        self.config = config;
        self
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Event emitter
    #[must_use]
    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Create an execution for a stored workflow and run it
    ///
    /// # Errors
    ///
    /// Returns error if the workflow is missing, its graph is broken, or a
    /// state transition cannot be persisted
    pub async fn run_workflow(&self, workflow_id: WorkflowId) -> PilotResult<RunSummary> {
        let workflow = self.store.load_workflow(workflow_id).await?;
        self.start(&workflow).await
    }

    /// Create an execution for `workflow` and run it
    ///
    /// # Errors
    ///
    /// Returns error if the graph is broken or a state transition cannot be
    /// persisted
    pub async fn start(&self, workflow: &WorkflowRecord) -> PilotResult<RunSummary> {
        let graph = StepGraph::from_steps(workflow.steps.clone())?;
        graph.validate()?;
        let execution = ExecutionRecord::new(workflow.id, graph.len());
        self.store.save_execution(&execution).await?;
        info!(execution = %execution.id, workflow = %workflow.id, steps = graph.len(), "execution created");
        self.drive(execution, workflow).await
    }

    /// Ask a running execution to stop dispatching new steps
    ///
    /// In-flight steps finish; the execution ends `paused` and can be
    /// resumed. Returns false if the execution is not running here.
    pub async fn pause(&self, id: ExecutionId) -> bool {
        let requested = self.pauses.request_pause(id).await;
        if requested {
            info!(execution = %id, "pause requested");
        }
        requested
    }

    /// Run the remaining steps of an execution.
    ///
    /// Completed and skipped steps in the trace are not run again.
    ///
    /// # Errors
    ///
    /// Returns error if the graph is broken or a state transition cannot be
    /// persisted; the execution is then marked failed on a best-effort basis
    #[instrument(skip_all, fields(execution = %execution.id))]
    pub async fn drive(&self, mut execution: ExecutionRecord, workflow: &WorkflowRecord) -> PilotResult<RunSummary> {
        let flag = self.pauses.register(execution.id).await;
        let result = self.drive_attempt(&mut execution, workflow, &flag).await;
        self.pauses.unregister(execution.id).await;

        match result {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!(error = %err, "execution aborted");
                execution.error = Some(err.to_string());
                execution.transition(ExecutionStatus::Failed);
                if let Err(save_err) = self.store.save_execution(&execution).await {
                    error!(error = %save_err, "could not record aborted execution");
                }
                self.events.emit(
                    &ExecutionEvent::new(execution.id, EventKind::ExecutionError)
                        .with_payload(json!({ "error": err.to_string() })),
                );
                Err(err)
            }
        }
    }

    async fn drive_attempt(
        &self,
        execution: &mut ExecutionRecord,
        workflow: &WorkflowRecord,
        pause: &AtomicBool,
    ) -> PilotResult<RunSummary> {
        let graph = StepGraph::from_steps(workflow.steps.clone())?;
        execution.total_steps = graph.len();
        execution.transition(ExecutionStatus::Running);
        self.store.save_execution(execution).await?;

        let mut pool = Arc::new(self.seed_pool(execution, workflow, &graph).await);
        let mut scheduler = Scheduler::new(&graph, &execution.execution_trace);
        let mut attempt = Attempt::default();
        let mut tasks: JoinSet<(StepId, StepRun)> = JoinSet::new();

        loop {
            for id in scheduler.take_skippable() {
                self.record_skip(execution, &graph, &id).await?;
            }

            let decision = scheduler.decide();
            if let (ScheduleDecision::Run(ready), false) = (decision, pause.load(Ordering::SeqCst)) {
                for id in ready {
                    if tasks.len() >= self.config.parallelism.max(1) {
                        break;
                    }
                    let Some(step) = graph.get(id.as_str()).cloned() else {
                        continue;
                    };
                    self.record_start(execution, &step, &mut attempt).await?;
                    scheduler.mark_running(&id);

                    let executor = self.executor.clone();
                    let scope = Arc::clone(&pool);
                    tasks.spawn(async move {
                        let run = executor.run(&step, scope).await;
                        (step.id, run)
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, run) = joined.map_err(|e| PilotError::Internal {
                message: format!("step task did not finish: {}", e),
            })?;
            let Some(step) = graph.get(id.as_str()) else {
                continue;
            };
            self.record_finish(execution, &graph, step, run, &mut scheduler, &mut pool, &mut attempt)
                .await?;
            for id in scheduler.take_skippable() {
                self.record_skip(execution, &graph, &id).await?;
            }
        }

        let decision = scheduler.decide();
        let pending = scheduler.in_state(StepState::Pending);
        let hard_failure = attempt
            .failures
            .iter()
            .find(|(_, category, _)| !category.awaits_user_input());
        let status = if let Some((step, category, message)) = hard_failure {
            execution.error = Some(format!("step {} failed ({}): {}", step, category, message));
            ExecutionStatus::Failed
        } else if !attempt.failures.is_empty() {
            ExecutionStatus::Paused
        } else if decision == ScheduleDecision::Complete {
            ExecutionStatus::Completed
        } else if pause.load(Ordering::SeqCst) {
            ExecutionStatus::Paused
        } else {
            let names: Vec<&str> = pending.iter().map(StepId::as_str).collect();
            execution.error = Some(format!("steps could not be scheduled: {}", names.join(", ")));
            ExecutionStatus::Failed
        };

        execution.transition(status);
        self.store.save_execution(execution).await?;

        let summary = RunSummary {
            execution_id: execution.id,
            status,
            steps_completed: attempt.completed,
            steps_failed: attempt.failures.len(),
            total_tokens_used: attempt.tokens_used,
            total_execution_time_ms: attempt.execution_time_ms,
        };
        let payload = json!({
            "status": status.as_str(),
            "stepsCompleted": summary.steps_completed,
            "stepsFailed": summary.steps_failed,
            "pendingSteps": pending,
        });

        match status {
            ExecutionStatus::Failed => {
                warn!(status = %status, error = ?execution.error, "execution failed");
                let mut payload = payload;
                payload["error"] = json!(execution.error);
                self.events
                    .emit(&ExecutionEvent::new(execution.id, EventKind::ExecutionError).with_payload(payload));
            }
            _ => {
                info!(
                    status = %status,
                    completed = summary.steps_completed,
                    skipped = scheduler.count(StepState::Skipped),
                    "execution attempt finished"
                );
                self.events
                    .emit(&ExecutionEvent::new(execution.id, EventKind::ExecutionComplete).with_payload(payload));
            }
        }
        if matches!(status, ExecutionStatus::Completed | ExecutionStatus::RolledBack) {
            self.payloads.evict(execution.id).await;
        }
        Ok(summary)
    }

    /// Pool with inputs and the outputs of already-completed steps
    async fn seed_pool(&self, execution: &ExecutionRecord, workflow: &WorkflowRecord, graph: &StepGraph) -> VariablePool {
        let mut pool = VariablePool::new(workflow.input_values.clone());
        let cached = self.payloads.snapshot(execution.id).await;
        for id in &execution.execution_trace.completed_steps {
            let Some(step) = graph.get(id.as_str()) else {
                continue;
            };
            let value = match cached.get(id) {
                Some(value) => value.clone(),
                None => {
                    warn!(step = %id, "output of completed step not cached in this process; resolving to null");
                    Value::Null
                }
            };
            pool.set_output(id.as_str(), step.exposed_variable(), value);
        }
        pool
    }

    async fn record_start(
        &self,
        execution: &ExecutionRecord,
        step: &CompiledStep,
        attempt: &mut Attempt,
    ) -> PilotResult<()> {
        let previous = self.store.load_step_execution(execution.id, &step.id).await?;
        let mut record = StepExecutionRecord::pending(execution.id, step);
        record.attempt = previous.map_or(1, |p| p.attempt.saturating_add(1));
        record.status = StepStatus::Running;
        record.started_at = Some(Utc::now());
        self.store.save_step_execution(&record).await?;

        debug!(step = %step.id, attempt = record.attempt, "step started");
        self.events.emit(
            &ExecutionEvent::for_step(execution.id, EventKind::StepStarted, step.id.clone())
                .with_payload(json!({ "step_type": step.type_name(), "attempt": record.attempt })),
        );
        attempt.running.insert(step.id.clone(), record);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_finish(
        &self,
        execution: &mut ExecutionRecord,
        graph: &StepGraph,
        step: &CompiledStep,
        run: StepRun,
        scheduler: &mut Scheduler,
        pool: &mut Arc<VariablePool>,
        attempt: &mut Attempt,
    ) -> PilotResult<()> {
        let mut record = attempt
            .running
            .remove(&step.id)
            .unwrap_or_else(|| StepExecutionRecord::pending(execution.id, step));
        record.completed_at = Some(Utc::now());
        record.tokens_used = run.tokens_used;
        record.execution_time_ms = run.execution_time_ms;
        record.execution_metadata.auto_repaired = run.auto_repaired;
        if run.auto_repaired {
            warn!(step = %step.id, "input repaired before use");
        }

        for nested in &run.nested {
            self.store
                .save_step_execution(&nested_record(execution.id, record.attempt, nested))
                .await?;
        }

        attempt.tokens_used = attempt.tokens_used.saturating_add(run.tokens_used);
        attempt.execution_time_ms = attempt.execution_time_ms.saturating_add(run.execution_time_ms);
        execution.total_tokens_used = execution.total_tokens_used.saturating_add(run.tokens_used);
        execution.total_execution_time_ms = execution.total_execution_time_ms.saturating_add(run.execution_time_ms);

        match run.result {
            Ok(value) => {
                let summary = OutputSummary::of(&value);
                record.status = StepStatus::Completed;
                record.execution_metadata.item_count = Some(summary.item_count);
                record.execution_metadata.field_names = summary.field_names.clone();
                self.store.save_step_execution(&record).await?;

                execution.execution_trace.mark_completed(&step.id, summary.clone());
                scheduler.mark_completed(&step.id);
                Arc::make_mut(pool).set_output(step.id.as_str(), step.exposed_variable(), value.clone());
                self.payloads.insert(execution.id, step.id.clone(), value).await;
                attempt.completed += 1;

                for member in scheduler.skip_branch(&run.untaken_branch) {
                    execution.execution_trace.mark_skipped(&member);
                    self.save_skip_record(execution.id, graph.get(member.as_str()), &member).await?;
                }
                self.store.save_execution(execution).await?;

                debug!(step = %step.id, items = summary.item_count, "step completed");
                self.events.emit(
                    &ExecutionEvent::for_step(execution.id, EventKind::StepCompleted, step.id.clone()).with_payload(
                        json!({
                            "output_summary": summary,
                            "tokens_used": run.tokens_used,
                            "execution_time_ms": run.execution_time_ms,
                        }),
                    ),
                );
            }
            Err(err) => {
                let category = classify(&err);
                let message = err.to_string();
                record.status = StepStatus::Failed;
                record.execution_metadata.failure_category = Some(category);
                record.execution_metadata.parameter_error_details = parameter_details(&err);
                record.execution_metadata.error_message = Some(message.clone());
                self.store.save_step_execution(&record).await?;

                execution.record_failure(&step.id);
                scheduler.mark_failed(&step.id);
                self.store.save_execution(execution).await?;

                warn!(step = %step.id, category = %category, error = %message, "step failed");
                self.events.emit(
                    &ExecutionEvent::for_step(execution.id, EventKind::StepFailed, step.id.clone()).with_payload(json!({
                        "failure_category": category,
                        "error": message,
                        "awaits_user_input": category.awaits_user_input(),
                    })),
                );
                attempt.failures.push((step.id.clone(), category, message));
            }
        }
        Ok(())
    }

    async fn record_skip(&self, execution: &mut ExecutionRecord, graph: &StepGraph, id: &StepId) -> PilotResult<()> {
        execution.execution_trace.mark_skipped(id);
        self.save_skip_record(execution.id, graph.get(id.as_str()), id).await?;
        self.store.save_execution(execution).await?;
        debug!(step = %id, "step skipped");
        Ok(())
    }

    async fn save_skip_record(&self, execution: ExecutionId, step: Option<&CompiledStep>, id: &StepId) -> PilotResult<()> {
        let Some(step) = step else {
            return Ok(());
        };
        let mut record = StepExecutionRecord::pending(execution, step);
        record.step_id = id.clone();
        record.status = StepStatus::Skipped;
        record.completed_at = Some(Utc::now());
        self.store.save_step_execution(&record).await?;
        Ok(())
    }
}

fn nested_record(execution: ExecutionId, attempt: u32, nested: &NestedRun) -> StepExecutionRecord {
    let mut record = StepExecutionRecord {
        execution_id: execution,
        step_id: nested.step_id.clone(),
        step_name: nested.step_name.clone(),
        step_type: nested.step_type.to_string(),
        status: StepStatus::Completed,
        execution_metadata: Default::default(),
        started_at: Some(nested.started_at),
        completed_at: Some(nested.completed_at),
        tokens_used: nested.tokens_used,
        execution_time_ms: nested.execution_time_ms,
        attempt,
    };
    match &nested.result {
        Ok(value) => {
            let summary = OutputSummary::of(value);
            record.execution_metadata.item_count = Some(summary.item_count);
            record.execution_metadata.field_names = summary.field_names;
        }
        Err(err) => {
            record.status = StepStatus::Failed;
            record.execution_metadata.failure_category = Some(classify(err));
            record.execution_metadata.parameter_error_details = parameter_details(err);
            record.execution_metadata.error_message = Some(err.to_string());
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, ttl: Duration) -> PayloadCache {
        PayloadCache::new(&EngineConfig::default().with_payload_cache(capacity, ttl))
    }

    #[tokio::test]
    async fn test_payload_cache_drops_least_recently_touched() {
        let cache = cache(2, Duration::from_secs(60));
        let (a, b, c) = (ExecutionId::new(), ExecutionId::new(), ExecutionId::new());
        cache.insert(a, StepId::new("s"), json!(1)).await;
        cache.insert(b, StepId::new("s"), json!(2)).await;
        cache.insert(a, StepId::new("t"), json!(3)).await;
        cache.insert(c, StepId::new("s"), json!(4)).await;

        assert!(cache.snapshot(b).await.is_empty());
        assert_eq!(cache.snapshot(a).await.len(), 2);
        assert_eq!(cache.snapshot(c).await[&StepId::new("s")], json!(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_cache_forgets_idle_executions() {
        let cache = cache(8, Duration::from_secs(60));
        let (idle, busy) = (ExecutionId::new(), ExecutionId::new());
        cache.insert(idle, StepId::new("s"), json!(1)).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        cache.insert(busy, StepId::new("s"), json!(2)).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(cache.snapshot(idle).await.is_empty());
        assert_eq!(cache.snapshot(busy).await.len(), 1);
        assert_eq!(cache.inner.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_payload_cache_evict() {
        let cache = cache(8, Duration::from_secs(60));
        let id = ExecutionId::new();
        cache.insert(id, StepId::new("s"), json!(1)).await;
        cache.evict(id).await;
        assert!(cache.snapshot(id).await.is_empty());
    }
}
