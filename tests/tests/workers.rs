//! Per-instance workers of the runtime

use serde_json::json;
use tideflow_core::{ActivityDefinition, ProcessDefinition, ProcessId, ScopeDefinition, SequenceFlow, WorkflowStage};
use tideflow_tests::{completed_count, vars, Harness};

fn single_task() -> ProcessDefinition {
    ProcessDefinition::new(
        "single-task",
        "Single task",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::task("work"))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "work"))
            .with_flow(SequenceFlow::new("f2", "work", "end")),
    )
}

#[tokio::test]
async fn test_worker_retires_when_its_instance_finishes() -> anyhow::Result<()> {
    let harness = Harness::new(vec![single_task()]).await?;
    let finishing = harness
        .runtime
        .start_workflow(&ProcessId::from("single-task"), vars(json!({})))
        .await?;
    let waiting = harness
        .runtime
        .start_workflow(&ProcessId::from("single-task"), vars(json!({})))
        .await?;
    assert_eq!(harness.runtime.active_workers(), 2);

    harness
        .runtime
        .complete_activity(&finishing, &"work".into(), vars(json!({})))
        .await?;
    harness.wait_for_workers(1).await?;
    assert_eq!(harness.instance(&waiting).await?.stage, WorkflowStage::Running);

    // a late trigger gets a fresh worker that retires again
    let late = harness
        .runtime
        .complete_activity(&finishing, &"work".into(), vars(json!({})))
        .await?;
    assert!(!late.applied);
    assert_eq!(late.stage, WorkflowStage::Completed);
    harness.wait_for_workers(1).await?;

    harness
        .runtime
        .complete_activity(&waiting, &"work".into(), vars(json!({})))
        .await?;
    let instance = harness.wait_for_stage(&waiting, WorkflowStage::Completed).await?;
    assert_eq!(completed_count(&instance, "end"), 1);
    harness.wait_for_workers(0).await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_start_does_not_keep_a_worker() -> anyhow::Result<()> {
    let harness = Harness::new(vec![single_task()]).await?;
    let missing = harness
        .runtime
        .start_workflow(&ProcessId::from("not-deployed"), vars(json!({})))
        .await;
    assert!(missing.is_err());
    harness.wait_for_workers(0).await?;
    Ok(())
}
