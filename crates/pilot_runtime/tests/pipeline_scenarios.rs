//! Compile-then-run scenarios through [`PilotRuntime`].

use pilot_core::StepId;
use pilot_plan::StepKind;
use pilot_runtime::{PilotRuntime, Settings};
use pilot_storage::{ExecutionStatus, FailureCategory};
use serde_json::{json, Map};

#[tokio::test]
async fn test_summarize_and_email_compiles_to_three_steps() {
    let runtime = PilotRuntime::in_memory();
    let ir = json!({
        "goal": "summarize inbox and email manager",
        "data_sources": ["gmail-inbox"],
        "delivery_rules": [{"to": "manager"}]
    });
    let output = runtime.compiler().compile(&ir, None).await.unwrap();

    assert_eq!(output.workflow.len(), 3);
    let edges: usize = output.workflow.iter().map(|s| s.dependencies.len()).sum();
    assert_eq!(edges, 2);
    assert!(matches!(output.workflow[1].kind, StepKind::AiProcessing { .. }));
    assert!(output.workflow[2].dependencies.contains("step2"));
}

#[tokio::test]
async fn test_unconfigured_plugin_pauses_for_user() {
    let runtime = PilotRuntime::in_memory();
    let ir = json!({
        "goal": "summarize inbox and email manager",
        "data_sources": ["gmail-inbox"],
        "delivery_rules": [{"to": "manager"}]
    });
    let (workflow, _) = runtime.create_workflow("digest", &ir, None).await.unwrap();
    let summary = runtime.engine().run_workflow(workflow.id).await.unwrap();
    assert_eq!(summary.status, ExecutionStatus::Paused);
    assert_eq!(summary.steps_completed, 0);

    let report = runtime.status().report(summary.execution_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Paused);
    assert_eq!(report.pending_decisions.len(), 1);
    assert_eq!(report.pending_decisions[0].category, FailureCategory::ConfigurationError);
}

#[tokio::test]
async fn test_mock_inbox_fans_out_per_item() {
    let settings = Settings {
        mock_messages: vec![
            json!({"subject": "Invoice 1"}),
            json!({"subject": "Invoice 2"}),
            json!({"subject": "Invoice 3"}),
        ],
        ..Settings::default()
    };
    let runtime = PilotRuntime::from_settings(settings).unwrap();
    let ir = json!({
        "goal": "forward invoices",
        "data_sources": ["mock_email"],
        "delivery_rules": [{"to": "ops@example.com", "channel": "email.send", "per_item": true}]
    });
    let (workflow, _) = runtime.create_workflow("invoices", &ir, None).await.unwrap();
    let summary = runtime.engine().run_workflow(workflow.id).await.unwrap();
    assert!(summary.success());

    let records = runtime
        .store()
        .list_step_executions(summary.execution_id)
        .await
        .unwrap();
    let nested: Vec<&str> = records
        .iter()
        .map(|r| r.step_id.as_str())
        .filter(|id| id.ends_with(']'))
        .collect();
    assert_eq!(nested, vec!["step2_send[0]", "step2_send[1]", "step2_send[2]"]);
}

#[tokio::test]
async fn test_resume_from_durable_store_in_new_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        store_path: Some(dir.path().join("pilot.redb")),
        ..Settings::default()
    };
    let ir = json!({
        "goal": "forward mail",
        "data_sources": ["mock_email"],
        "delivery_rules": [{"to": "{{input.recipient}}", "channel": "email.send"}]
    });

    let (execution_id, workflow_id) = {
        let runtime = PilotRuntime::from_settings(settings.clone()).unwrap();
        let (workflow, _) = runtime.create_workflow("forward", &ir, None).await.unwrap();
        let summary = runtime.engine().run_workflow(workflow.id).await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Paused);
        (summary.execution_id, workflow.id)
    };

    let runtime = PilotRuntime::from_settings(settings).unwrap();
    let mut inputs = Map::new();
    inputs.insert("recipient".into(), json!("ops@example.com"));
    let response = runtime.resume().resume(execution_id, Some(inputs)).await.unwrap();
    assert!(response.success);
    assert_eq!(response.result.steps_completed, 1);

    let execution = runtime.store().load_execution(execution_id).await.unwrap();
    assert_eq!(execution.workflow_id, workflow_id);
    assert_eq!(execution.resume_count, 1);
    assert_eq!(
        execution.execution_trace.completed_steps,
        vec![StepId::from("step1"), StepId::from("step2")]
    );
}
