//! Boundary events, sub-process scopes and error propagation

use std::time::Duration;

use serde_json::json;
use tideflow_core::{
    ActivityDefinition, ActivityError, BoundaryTrigger, ProcessDefinition, ProcessId, ScopeDefinition, SequenceFlow,
    TimerDefinition, WorkflowStage,
};
use tideflow_tests::{completed_count, executing, root_variable, vars, was_cancelled, was_reached, Harness};

fn review(interrupting: bool) -> ProcessDefinition {
    let late = ActivityDefinition::boundary(
        "late",
        "review",
        BoundaryTrigger::Timer(TimerDefinition::Duration(Duration::from_millis(50))),
    );
    let late = if interrupting { late } else { late.non_interrupting() };
    ProcessDefinition::new(
        "review",
        "Review with deadline",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::task("review"))
            .with_activity(late)
            .with_activity(ActivityDefinition::task("escalate"))
            .with_activity(ActivityDefinition::end_event("reviewed"))
            .with_activity(ActivityDefinition::end_event("escalated"))
            .with_flow(SequenceFlow::new("f1", "start", "review"))
            .with_flow(SequenceFlow::new("f2", "review", "reviewed"))
            .with_flow(SequenceFlow::new("f3", "late", "escalate"))
            .with_flow(SequenceFlow::new("f4", "escalate", "escalated")),
    )
}

fn claim_handling() -> ProcessDefinition {
    let handling = ScopeDefinition::new()
        .with_activity(ActivityDefinition::start_event("handle_start"))
        .with_activity(ActivityDefinition::parallel_gateway("handle_fork"))
        .with_activity(ActivityDefinition::task("assess"))
        .with_activity(ActivityDefinition::task("notify"))
        .with_activity(ActivityDefinition::parallel_gateway("handle_join"))
        .with_activity(ActivityDefinition::end_event("handle_end"))
        .with_flow(SequenceFlow::new("h1", "handle_start", "handle_fork"))
        .with_flow(SequenceFlow::new("h2", "handle_fork", "assess"))
        .with_flow(SequenceFlow::new("h3", "handle_fork", "notify"))
        .with_flow(SequenceFlow::new("h4", "assess", "handle_join"))
        .with_flow(SequenceFlow::new("h5", "notify", "handle_join"))
        .with_flow(SequenceFlow::new("h6", "handle_join", "handle_end"));

    ProcessDefinition::new(
        "claim",
        "Claim handling",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::sub_process("handling", handling))
            .with_activity(ActivityDefinition::boundary(
                "rejected",
                "handling",
                BoundaryTrigger::Error(Some("Rejected".to_string())),
            ))
            .with_activity(ActivityDefinition::task("appeal"))
            .with_activity(ActivityDefinition::end_event("settled"))
            .with_activity(ActivityDefinition::end_event("appealed"))
            .with_flow(SequenceFlow::new("f1", "start", "handling"))
            .with_flow(SequenceFlow::new("f2", "handling", "settled"))
            .with_flow(SequenceFlow::new("f3", "rejected", "appeal"))
            .with_flow(SequenceFlow::new("f4", "appeal", "appealed")),
    )
}

fn inspection() -> ProcessDefinition {
    let inspecting = ScopeDefinition::new()
        .with_activity(ActivityDefinition::start_event("inspect_start"))
        .with_activity(ActivityDefinition::task("inspect"))
        .with_activity(ActivityDefinition::end_event("inspect_end"))
        .with_flow(SequenceFlow::new("i1", "inspect_start", "inspect"))
        .with_flow(SequenceFlow::new("i2", "inspect", "inspect_end"));

    ProcessDefinition::new(
        "inspection",
        "Inspection",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::sub_process("inspecting", inspecting))
            .with_activity(ActivityDefinition::boundary(
                "rejected",
                "inspecting",
                BoundaryTrigger::Error(Some("Rejected".to_string())),
            ))
            .with_activity(ActivityDefinition::end_event("passed"))
            .with_activity(ActivityDefinition::end_event("failed"))
            .with_flow(SequenceFlow::new("f1", "start", "inspecting"))
            .with_flow(SequenceFlow::new("f2", "inspecting", "passed"))
            .with_flow(SequenceFlow::new("f3", "rejected", "failed")),
    )
}

fn early_exit() -> ProcessDefinition {
    let inner = ScopeDefinition::new()
        .with_activity(ActivityDefinition::start_event("inner_start"))
        .with_activity(ActivityDefinition::parallel_gateway("inner_fork"))
        .with_activity(ActivityDefinition::task("wait"))
        .with_activity(ActivityDefinition::terminate_end_event("stop"))
        .with_flow(SequenceFlow::new("i1", "inner_start", "inner_fork"))
        .with_flow(SequenceFlow::new("i2", "inner_fork", "wait"))
        .with_flow(SequenceFlow::new("i3", "inner_fork", "stop"));

    ProcessDefinition::new(
        "early-exit",
        "Early exit",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::sub_process("inner", inner))
            .with_activity(ActivityDefinition::task("after"))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "inner"))
            .with_flow(SequenceFlow::new("f2", "inner", "after"))
            .with_flow(SequenceFlow::new("f3", "after", "end")),
    )
}

#[tokio::test]
async fn test_interrupting_timer_boundary_cancels_host() -> anyhow::Result<()> {
    let harness = Harness::new(vec![review(true)]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("review"), vars(json!({})))
        .await?;

    harness.wait_for_executing(&id, "escalate").await?;
    let instance = harness.instance(&id).await?;
    assert!(was_cancelled(&instance, "review"));
    assert!(instance.subscriptions.is_empty());
    assert!(harness.provider.timers().active_timers().is_empty());

    let late = harness
        .runtime
        .complete_activity(&id, &"review".into(), vars(json!({})))
        .await;
    assert!(late.is_err());

    harness
        .runtime
        .complete_activity(&id, &"escalate".into(), vars(json!({})))
        .await?;
    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;
    assert_eq!(completed_count(&instance, "escalated"), 1);
    assert!(!was_reached(&instance, "reviewed"));
    Ok(())
}

#[tokio::test]
async fn test_non_interrupting_timer_boundary_keeps_host() -> anyhow::Result<()> {
    let harness = Harness::new(vec![review(false)]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("review"), vars(json!({})))
        .await?;

    harness.wait_for_executing(&id, "escalate").await?;
    let instance = harness.instance(&id).await?;
    assert_eq!(executing(&instance, "review").len(), 1);

    harness
        .runtime
        .complete_activity(&id, &"escalate".into(), vars(json!({})))
        .await?;
    assert_eq!(harness.instance(&id).await?.stage, WorkflowStage::Running);

    harness
        .runtime
        .complete_activity(&id, &"review".into(), vars(json!({})))
        .await?;
    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;
    assert_eq!(completed_count(&instance, "reviewed"), 1);
    assert_eq!(completed_count(&instance, "escalated"), 1);
    Ok(())
}

#[tokio::test]
async fn test_error_boundary_on_sub_process_catches_inner_failure() -> anyhow::Result<()> {
    let harness = Harness::new(vec![claim_handling()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("claim"), vars(json!({"claim": "c-7"})))
        .await?;

    harness
        .runtime
        .fail_activity(&id, &"assess".into(), ActivityError::new("Rejected", "policy expired"))
        .await?;

    let instance = harness.instance(&id).await?;
    assert_eq!(executing(&instance, "appeal").len(), 1);
    assert!(was_cancelled(&instance, "notify"));
    assert_eq!(root_variable(&instance, "errorCode"), Some(json!("Rejected")));
    assert_eq!(root_variable(&instance, "errorMessage"), Some(json!("policy expired")));

    harness
        .runtime
        .complete_activity(&id, &"appeal".into(), vars(json!({})))
        .await?;
    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;
    assert!(instance.failure.is_none());
    assert!(!was_reached(&instance, "settled"));
    Ok(())
}

#[tokio::test]
async fn test_unmatched_error_fails_sub_process_and_instance() -> anyhow::Result<()> {
    let harness = Harness::new(vec![inspection()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("inspection"), vars(json!({})))
        .await?;

    harness
        .runtime
        .fail_activity(&id, &"inspect".into(), ActivityError::new("ScannerOffline", "no scanner"))
        .await?;

    let instance = harness.wait_for_stage(&id, WorkflowStage::Failed).await?;
    let failure = instance.failure.clone().expect("failure recorded");
    assert_eq!(failure.code, "ScannerOffline");
    let inspecting = instance
        .entries
        .iter()
        .find(|e| e.activity_id.0 == "inspecting")
        .expect("sub-process entry");
    assert_eq!(inspecting.unhandled_error().map(|e| e.code.as_str()), Some("ScannerOffline"));
    assert!(!was_reached(&instance, "failed"));
    assert!(!was_reached(&instance, "passed"));
    assert!(!instance.has_active_entries());
    assert_eq!(harness.events.counts().failed, 1);
    Ok(())
}

#[tokio::test]
async fn test_terminate_end_event_closes_its_sub_process() -> anyhow::Result<()> {
    let harness = Harness::new(vec![early_exit()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("early-exit"), vars(json!({})))
        .await?;

    let instance = harness.instance(&id).await?;
    assert!(was_cancelled(&instance, "wait"));
    assert_eq!(completed_count(&instance, "inner"), 1);
    assert_eq!(executing(&instance, "after").len(), 1);

    harness
        .runtime
        .complete_activity(&id, &"after".into(), vars(json!({})))
        .await?;
    harness.wait_for_stage(&id, WorkflowStage::Completed).await?;
    Ok(())
}
