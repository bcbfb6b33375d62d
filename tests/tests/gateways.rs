//! Exclusive, parallel and event-based gateway scenarios

use serde_json::json;
use tideflow_core::{
    ActivityDefinition, CoreError, OutboundEffect, ProcessDefinition, ProcessId, ScopeDefinition, SequenceFlow,
    StartWorkflowRequest, TimerDefinition, WorkflowInstanceId, WorkflowStage,
};
use tideflow_state_inmemory::InMemoryStateStoreProvider;
use tideflow_tests::{completed_count, executing, service, vars, was_cancelled, was_reached, Harness};

fn approval(with_default: bool) -> ProcessDefinition {
    let low = SequenceFlow::new("to_low", "decide", "low");
    let low = if with_default {
        low.as_default()
    } else {
        low.with_condition("x < `0`")
    };
    ProcessDefinition::new(
        "approval",
        "Approval",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::exclusive_gateway("decide"))
            .with_activity(ActivityDefinition::end_event("high"))
            .with_activity(ActivityDefinition::end_event("low"))
            .with_flow(SequenceFlow::new("f1", "start", "decide"))
            .with_flow(SequenceFlow::new("to_high", "decide", "high").with_condition("x > y"))
            .with_flow(low),
    )
}

fn review_then_route() -> ProcessDefinition {
    ProcessDefinition::new(
        "routing",
        "Review then route",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::task("task"))
            .with_activity(ActivityDefinition::exclusive_gateway("route"))
            .with_activity(ActivityDefinition::end_event("end1"))
            .with_activity(ActivityDefinition::end_event("end2"))
            .with_flow(SequenceFlow::new("f1", "start", "task"))
            .with_flow(SequenceFlow::new("f2", "task", "route"))
            .with_flow(SequenceFlow::new("f3", "route", "end1").with_condition("x > y"))
            .with_flow(SequenceFlow::new("f4", "route", "end2").as_default()),
    )
}

fn fork_join() -> ProcessDefinition {
    ProcessDefinition::new(
        "fork-join",
        "Fork and join",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::parallel_gateway("fork"))
            .with_activity(ActivityDefinition::task("pack"))
            .with_activity(ActivityDefinition::task("bill"))
            .with_activity(ActivityDefinition::parallel_gateway("join"))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "fork"))
            .with_flow(SequenceFlow::new("f2", "fork", "pack"))
            .with_flow(SequenceFlow::new("f3", "fork", "bill"))
            .with_flow(SequenceFlow::new("f4", "pack", "join"))
            .with_flow(SequenceFlow::new("f5", "bill", "join"))
            .with_flow(SequenceFlow::new("f6", "join", "end")),
    )
}

fn payment_race() -> ProcessDefinition {
    ProcessDefinition::new(
        "payment-race",
        "Payment or timeout",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::event_based_gateway("race"))
            .with_activity(ActivityDefinition::message_catch("paid", "paymentReceived"))
            .with_activity(ActivityDefinition::timer_catch(
                "expired",
                TimerDefinition::parse("PT1H").expect("valid duration"),
            ))
            .with_activity(ActivityDefinition::end_event("done"))
            .with_activity(ActivityDefinition::end_event("cancelled"))
            .with_flow(SequenceFlow::new("f1", "start", "race"))
            .with_flow(SequenceFlow::new("f2", "race", "paid"))
            .with_flow(SequenceFlow::new("f3", "race", "expired"))
            .with_flow(SequenceFlow::new("f4", "paid", "done"))
            .with_flow(SequenceFlow::new("f5", "expired", "cancelled")),
    )
}

#[tokio::test]
async fn test_exclusive_gateway_falls_back_to_default_flow() -> anyhow::Result<()> {
    let harness = Harness::new(vec![approval(true)]).await?;

    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("approval"), vars(json!({"x": 5, "y": 6})))
        .await?;
    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;

    assert_eq!(completed_count(&instance, "low"), 1);
    assert!(!was_reached(&instance, "high"));
    assert_eq!(harness.events.counts().started, 1);
    Ok(())
}

#[tokio::test]
async fn test_task_then_gateway_reaches_single_end() -> anyhow::Result<()> {
    let harness = Harness::new(vec![review_then_route()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("routing"), vars(json!({"x": 5, "y": 6})))
        .await?;
    harness.wait_for_executing(&id, "task").await?;

    harness
        .runtime
        .complete_activity(&id, &"task".into(), vars(json!({})))
        .await?;
    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;

    assert_eq!(completed_count(&instance, "end2"), 1);
    assert!(!was_reached(&instance, "end1"));
    assert!(!instance.has_active_entries());
    Ok(())
}

#[tokio::test]
async fn test_exclusive_gateway_takes_matching_condition() -> anyhow::Result<()> {
    let harness = Harness::new(vec![approval(true)]).await?;

    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("approval"), vars(json!({"x": 7, "y": 6})))
        .await?;
    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;

    assert_eq!(completed_count(&instance, "high"), 1);
    assert!(!was_reached(&instance, "low"));
    Ok(())
}

#[tokio::test]
async fn test_exclusive_gateway_without_match_or_default_is_rejected() -> anyhow::Result<()> {
    let provider = InMemoryStateStoreProvider::new();
    provider.deploy(approval(false)).await?;
    let service = service(&provider);
    let id = WorkflowInstanceId::from("wf-1");

    let outcome = service
        .start_workflow(StartWorkflowRequest {
            instance_id: id.clone(),
            process_id: ProcessId::from("approval"),
            variables: vars(json!({"x": 5, "y": 6})),
            parent: None,
        })
        .await?;
    let requests: Vec<_> = outcome
        .effects
        .into_iter()
        .filter_map(|effect| match effect {
            OutboundEffect::EvaluateCondition(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 2);

    let first = service
        .set_condition_result(&id, &requests[0].gateway_instance_id, &requests[0].flow_id, false)
        .await?;
    assert!(first.applied);
    assert_eq!(first.stage, WorkflowStage::Running);

    let second = service
        .set_condition_result(&id, &requests[1].gateway_instance_id, &requests[1].flow_id, false)
        .await;
    assert!(matches!(second, Err(CoreError::ConfigurationError(_))));

    // the rejected trigger left the stored snapshot untouched
    let stored = service.get_instance(&id).await?.expect("stored");
    assert_eq!(executing(&stored, "decide").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_parallel_join_waits_for_every_branch() -> anyhow::Result<()> {
    let harness = Harness::new(vec![fork_join()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("fork-join"), vars(json!({})))
        .await?;

    let instance = harness.instance(&id).await?;
    assert_eq!(executing(&instance, "pack").len(), 1);
    assert_eq!(executing(&instance, "bill").len(), 1);

    harness
        .runtime
        .complete_activity(&id, &"pack".into(), vars(json!({"parcel": "p-1"})))
        .await?;
    let instance = harness.instance(&id).await?;
    assert_eq!(instance.stage, WorkflowStage::Running);
    assert_eq!(completed_count(&instance, "join"), 0);

    harness
        .runtime
        .complete_activity(&id, &"bill".into(), vars(json!({"invoice": "i-1"})))
        .await?;
    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;

    assert_eq!(completed_count(&instance, "join"), 1);
    assert_eq!(completed_count(&instance, "end"), 1);
    Ok(())
}

#[tokio::test]
async fn test_parallel_branches_write_isolated_scopes() -> anyhow::Result<()> {
    let harness = Harness::new(vec![fork_join()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("fork-join"), vars(json!({"status": "new"})))
        .await?;

    harness
        .runtime
        .complete_activity(&id, &"pack".into(), vars(json!({"status": "packed"})))
        .await?;

    let instance = harness.instance(&id).await?;
    let bill = executing(&instance, "bill");
    let bill_entry = instance.entry(&bill[0]).expect("bill entry");
    assert_eq!(
        instance.variable(&bill_entry.activity.variable_scope_id, "status"),
        Some(&json!("new"))
    );
    Ok(())
}

#[tokio::test]
async fn test_event_gateway_message_beats_timer() -> anyhow::Result<()> {
    let harness = Harness::new(vec![payment_race()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("payment-race"), vars(json!({})))
        .await?;

    let instance = harness.instance(&id).await?;
    assert_eq!(executing(&instance, "paid").len(), 1);
    assert_eq!(executing(&instance, "expired").len(), 1);
    assert_eq!(harness.provider.timers().active_timers().len(), 1);

    // without a declared correlation key the instance id correlates
    let consumed = harness
        .runtime
        .deliver_message("paymentReceived", &id.0, vars(json!({"amount": 40})))
        .await?;
    assert!(consumed);

    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;
    assert_eq!(completed_count(&instance, "done"), 1);
    assert!(was_cancelled(&instance, "expired"));
    assert!(!was_reached(&instance, "cancelled"));
    assert!(harness.provider.timers().active_timers().is_empty());
    Ok(())
}
