//! End-to-end execution and resume scenarios against the in-memory store.

use async_trait::async_trait;
use pilot_core::{PilotError, StepId};
use pilot_log::{EventEmitter, EventKind};
use pilot_plan::step::{Gather, Scatter};
use pilot_plan::{CompiledStep, GatherOp, StepKind};
use pilot_runtime::{
    ActionHandler, EngineConfig, ExecutionEngine, PluginError, PluginOutput, PluginRegistry, ResumeConfig, ResumeService,
    StatusReporter,
};
use pilot_storage::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, FailureCategory, MemoryLockManager, MemoryStore, StepStatus,
    WorkflowRecord,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<MemoryStore>,
    engine: Arc<ExecutionEngine>,
    resume: ResumeService,
    status: StatusReporter,
}

fn harness(registry: PluginRegistry) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(EventEmitter::new()),
    ));
    Harness {
        resume: ResumeService::new(store.clone(), Arc::new(MemoryLockManager::new()), Arc::clone(&engine)),
        status: StatusReporter::new(store.clone()),
        store,
        engine,
    }
}

fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Registry whose `source.read` counts its calls
fn counting_registry(reads: &Arc<AtomicUsize>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins(Vec::new());
    let counter = Arc::clone(reads);
    registry.register_fn("source", "read", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!([{"subject": "Invoice 7"}, {"subject": "Lunch"}]))
    });
    registry
}

#[tokio::test]
async fn test_resume_after_missing_parameter_skips_completed_step() {
    let reads = Arc::new(AtomicUsize::new(0));
    let h = harness(counting_registry(&reads));

    let workflow = WorkflowRecord::new(
        "forward",
        vec![
            CompiledStep::action("a", "source", "read", Map::new()),
            CompiledStep::action(
                "b",
                "email",
                "send",
                params(json!({"to": "{{input.recipient}}", "subject": "New mail", "body": "{{a}}"})),
            )
            .depends_on("a"),
        ],
    );
    h.store.save_workflow(&workflow).await.unwrap();

    let first = h.engine.start(&workflow).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Paused);
    assert_eq!(first.steps_completed, 1);
    assert_eq!(first.steps_failed, 1);

    let paused = h.store.load_execution(first.execution_id).await.unwrap();
    assert_eq!(paused.execution_trace.completed_steps, vec![StepId::from("a")]);
    assert_eq!(paused.execution_trace.failed_steps, vec![StepId::from("b")]);
    let b = h
        .store
        .load_step_execution(first.execution_id, &"b".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.status, StepStatus::Failed);
    assert_eq!(b.execution_metadata.failure_category, Some(FailureCategory::ParameterError));

    let report = h.status.report(first.execution_id).await.unwrap();
    assert_eq!(report.pending_decisions.len(), 1);
    assert_eq!(report.pending_decisions[0].step_id, StepId::from("b"));

    let mut inputs = Map::new();
    inputs.insert("recipient".into(), json!("ops@example.com"));
    let resumed = h.resume.resume(first.execution_id, Some(inputs)).await.unwrap();
    assert!(resumed.success);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(resumed.result.steps_completed, 1);
    assert_eq!(resumed.result.steps_failed, 0);

    assert_eq!(reads.load(Ordering::SeqCst), 1);
    let done = h.store.load_execution(first.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.resume_count, 1);
    assert_eq!(done.failed_steps_count, 0);
    assert!(done.execution_trace.failed_steps.is_empty());
    assert_eq!(
        done.execution_trace.completed_steps,
        vec![StepId::from("a"), StepId::from("b")]
    );

    let b = h
        .store
        .load_step_execution(first.execution_id, &"b".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.status, StepStatus::Completed);
    assert_eq!(b.attempt, 2);

    let stored = h.store.load_workflow(workflow.id).await.unwrap();
    assert_eq!(stored.input_values["recipient"], "ops@example.com");
}

#[tokio::test]
async fn test_scatter_records_every_item() {
    let mut registry = PluginRegistry::with_builtins(Vec::new());
    registry.register_fn("source", "read", |_| Ok(json!([1, 2, 3, 4, 5])));
    let h = harness(registry);

    let send = CompiledStep::action(
        "send",
        "email",
        "send",
        params(json!({"to": "team@example.com", "body": "{{item}}"})),
    );
    let fan = CompiledStep::new(
        "fan",
        "Send each",
        StepKind::ScatterGather {
            scatter: Scatter {
                input: "{{source}}".into(),
                steps: vec![send],
                item_variable: None,
                max_iterations: Some(100),
            },
            gather: Gather {
                operation: GatherOp::Collect,
            },
        },
    )
    .depends_on("source");
    let workflow = WorkflowRecord::new(
        "fan out",
        vec![CompiledStep::action("source", "source", "read", Map::new()), fan],
    );

    let summary = h.engine.start(&workflow).await.unwrap();
    assert!(summary.success());

    let records = h.store.list_step_executions(summary.execution_id).await.unwrap();
    let nested: Vec<_> = records.iter().filter(|r| r.step_id.as_str().starts_with("send[")).collect();
    assert_eq!(nested.len(), 5);
    assert!(nested.iter().all(|r| r.status == StepStatus::Completed));

    let fan = records.iter().find(|r| r.step_id.as_str() == "fan").unwrap();
    assert_eq!(fan.execution_metadata.item_count, Some(5));
}

/// Sleeps before answering so a resume holds its lock for a while
struct SlowRead;

#[async_trait]
impl ActionHandler for SlowRead {
    async fn run(&self, _params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(PluginOutput::new(json!(["done"])))
    }
}

#[tokio::test]
async fn test_concurrent_resumes_one_conflicts() {
    let mut registry = PluginRegistry::new();
    registry.register("slow", "read", Arc::new(SlowRead));
    let h = harness(registry);

    let workflow = WorkflowRecord::new("slow", vec![CompiledStep::action("s", "slow", "read", Map::new())]);
    h.store.save_workflow(&workflow).await.unwrap();
    let mut execution = ExecutionRecord::new(workflow.id, 1);
    execution.transition(ExecutionStatus::Failed);
    h.store.save_execution(&execution).await.unwrap();

    let (first, second) = tokio::join!(
        h.resume.resume(execution.id, None),
        h.resume.resume(execution.id, None)
    );
    let outcomes = [first, second];
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(PilotError::LockConflict { .. })))
        .count();
    let completed = outcomes
        .iter()
        .filter(|r| r.as_ref().is_ok_and(|resp| resp.status == ExecutionStatus::Completed))
        .count();
    assert_eq!(conflicts, 1);
    assert_eq!(completed, 1);

    // The lock is free again.
    let again = h.resume.resume(execution.id, None).await.unwrap();
    assert!(again.success);
    assert_eq!(again.result.steps_completed, 0);
}

/// Counts calls and outlives a one second lease
struct LongRead(Arc<AtomicUsize>);

#[async_trait]
impl ActionHandler for LongRead {
    async fn run(&self, _params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Ok(PluginOutput::new(json!(["done"])))
    }
}

#[tokio::test]
async fn test_lease_renewed_while_step_outlives_ttl() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = PluginRegistry::new();
    registry.register("slow", "read", Arc::new(LongRead(Arc::clone(&calls))));
    let h = harness(registry);
    let resume = Arc::new(
        ResumeService::new(h.store.clone(), Arc::new(MemoryLockManager::new()), Arc::clone(&h.engine))
            .with_config(ResumeConfig::default().with_lock_ttl(Duration::from_secs(1))),
    );

    let workflow = WorkflowRecord::new("long", vec![CompiledStep::action("s", "slow", "read", Map::new())]);
    h.store.save_workflow(&workflow).await.unwrap();
    let mut execution = ExecutionRecord::new(workflow.id, 1);
    execution.transition(ExecutionStatus::Failed);
    h.store.save_execution(&execution).await.unwrap();

    let first = tokio::spawn({
        let resume = Arc::clone(&resume);
        let id = execution.id;
        async move { resume.resume(id, None).await }
    });
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let second = resume.resume(execution.id, None).await;
    assert!(matches!(second, Err(PilotError::LockConflict { .. })));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resume_completed_execution_is_noop() {
    let reads = Arc::new(AtomicUsize::new(0));
    let h = harness(counting_registry(&reads));
    let workflow = WorkflowRecord::new("read", vec![CompiledStep::action("a", "source", "read", Map::new())]);
    h.store.save_workflow(&workflow).await.unwrap();

    let summary = h.engine.start(&workflow).await.unwrap();
    assert!(summary.success());
    let before = h.store.load_execution(summary.execution_id).await.unwrap();

    let response = h.resume.resume(summary.execution_id, None).await.unwrap();
    assert!(response.success);
    assert_eq!(response.result.steps_completed, 0);
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    let after = h.store.load_execution(summary.execution_id).await.unwrap();
    assert_eq!(after.resume_count, before.resume_count);
    assert_eq!(after.execution_trace, before.execution_trace);
}

#[tokio::test]
async fn test_hard_failure_fails_execution_and_blocks_dependents() {
    let mut registry = PluginRegistry::with_builtins(Vec::new());
    registry.register_fn("source", "read", |_| Err(PluginError::Failed("upstream timed out".into())));
    let h = harness(registry);
    let events = h.engine.events();
    let (_subscription, mut rx) = events.subscribe_channel(None);

    let workflow = WorkflowRecord::new(
        "broken",
        vec![
            CompiledStep::action("a", "source", "read", Map::new()),
            CompiledStep::action("b", "log", "write", params(json!({"message": "{{a}}"}))).depends_on("a"),
        ],
    );
    let summary = h.engine.start(&workflow).await.unwrap();
    assert_eq!(summary.status, ExecutionStatus::Failed);

    let execution = h.store.load_execution(summary.execution_id).await.unwrap();
    assert!(execution.error.as_deref().is_some_and(|e| e.contains("upstream timed out")));
    assert!(h
        .store
        .load_step_execution(summary.execution_id, &"b".into())
        .await
        .unwrap()
        .is_none());

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![EventKind::StepStarted, EventKind::StepFailed, EventKind::ExecutionError]
    );
}

#[tokio::test]
async fn test_single_slot_engine_drains_ready_steps_in_order() {
    let store = Arc::new(MemoryStore::new());
    let engine = ExecutionEngine::new(
        store.clone(),
        Arc::new(PluginRegistry::with_builtins(Vec::new())),
        Arc::new(EventEmitter::new()),
    )
    .with_config(EngineConfig::default().with_parallelism(1));
    let (_subscription, mut rx) = engine.events().subscribe_channel(None);

    let workflow = WorkflowRecord::new(
        "fan-in",
        vec![
            CompiledStep::action("a", "log", "write", params(json!({"message": "a"}))),
            CompiledStep::action("b", "log", "write", params(json!({"message": "b"}))),
            CompiledStep::action("c", "log", "write", params(json!({"message": "{{a}} {{b}}"})))
                .depends_on("a")
                .depends_on("b"),
        ],
    );
    let summary = engine.start(&workflow).await.unwrap();
    assert_eq!(summary.status, ExecutionStatus::Completed);
    assert_eq!(summary.steps_completed, 3);

    let mut started = Vec::new();
    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        match event.kind {
            EventKind::StepStarted => started.extend(event.step_id.map(|id| id.as_str().to_string())),
            EventKind::ExecutionComplete => finished = Some(event.payload),
            _ => {}
        }
    }
    assert_eq!(started, vec!["a", "b", "c"]);
    assert_eq!(finished.unwrap()["pendingSteps"], json!([]));
}
