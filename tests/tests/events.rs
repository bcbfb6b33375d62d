//! Timers, messages, signals and snapshot portability

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tideflow_core::{
    domain::process_definition::MessageDefinition, ActivityDefinition, Collaborators, CoreError, EngineConfig,
    LoggingEventHandler, MessageCorrelationRegistry, ProcessDefinition, ProcessId, ScopeDefinition, SequenceFlow,
    StartWorkflowRequest, TimerDefinition, VersionedInstance, WorkflowExecutionService, WorkflowInstance,
    WorkflowInstanceId, WorkflowStage, WorkflowStateStore,
};
use tideflow_state_inmemory::{InMemoryStateStoreProvider, InMemoryWorkflowStateStore};
use tideflow_tests::{completed_count, executing, root_variable, service, vars, Harness};

fn wait_for_alarm() -> ProcessDefinition {
    ProcessDefinition::new(
        "sleeper",
        "Sleeper",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::signal_catch("alarm", "wake-up"))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "alarm"))
            .with_flow(SequenceFlow::new("f2", "alarm", "end")),
    )
    .with_signal("wake-up")
}

fn raise_alarm() -> ProcessDefinition {
    ProcessDefinition::new(
        "alarm-clock",
        "Alarm clock",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::signal_throw("ring", "wake-up"))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "ring"))
            .with_flow(SequenceFlow::new("f2", "ring", "end")),
    )
    .with_signal("wake-up")
}

fn order_payment() -> ProcessDefinition {
    ProcessDefinition::new(
        "order",
        "Order",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::message_catch("paid", "payment"))
            .with_activity(ActivityDefinition::task("ship"))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "paid"))
            .with_flow(SequenceFlow::new("f2", "paid", "ship"))
            .with_flow(SequenceFlow::new("f3", "ship", "end")),
    )
    .with_message(MessageDefinition {
        name: "payment".to_string(),
        correlation_key: Some("order.id".to_string()),
    })
}

fn prepared_order() -> ProcessDefinition {
    ProcessDefinition::new(
        "prepared-order",
        "Prepared order",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::task("prepare"))
            .with_activity(ActivityDefinition::message_catch("paid", "payment"))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "prepare"))
            .with_flow(SequenceFlow::new("f2", "prepare", "paid"))
            .with_flow(SequenceFlow::new("f3", "paid", "end")),
    )
    .with_message(MessageDefinition {
        name: "payment".to_string(),
        correlation_key: Some("order.id".to_string()),
    })
}

fn reminded_payment() -> ProcessDefinition {
    ProcessDefinition::new(
        "reminded-payment",
        "Payment with reminder",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::parallel_gateway("fork"))
            .with_activity(ActivityDefinition::timer_catch(
                "remind",
                TimerDefinition::Duration(Duration::from_secs(3600)),
            ))
            .with_activity(ActivityDefinition::message_catch("paid", "payment"))
            .with_activity(ActivityDefinition::end_event("reminded"))
            .with_activity(ActivityDefinition::end_event("settled"))
            .with_flow(SequenceFlow::new("f1", "start", "fork"))
            .with_flow(SequenceFlow::new("f2", "fork", "remind"))
            .with_flow(SequenceFlow::new("f3", "fork", "paid"))
            .with_flow(SequenceFlow::new("f4", "remind", "reminded"))
            .with_flow(SequenceFlow::new("f5", "paid", "settled")),
    )
    .with_message(MessageDefinition {
        name: "payment".to_string(),
        correlation_key: Some("order.id".to_string()),
    })
}

/// Store whose first versioned write loses a race against another writer
struct RacedStore {
    inner: InMemoryWorkflowStateStore,
    raced: AtomicBool,
}

#[async_trait]
impl WorkflowStateStore for RacedStore {
    async fn read(&self, id: &WorkflowInstanceId) -> Result<Option<VersionedInstance>, CoreError> {
        self.inner.read(id).await
    }

    async fn write(&self, instance: &WorkflowInstance, expected_version: Option<u64>) -> Result<u64, CoreError> {
        if expected_version.is_some() && !self.raced.swap(true, Ordering::SeqCst) {
            if let Some(current) = self.inner.read(&instance.id).await? {
                self.inner.write(&current.instance, Some(current.version)).await?;
            }
        }
        self.inner.write(instance, expected_version).await
    }
}

fn delay(duration: Duration) -> ProcessDefinition {
    ProcessDefinition::new(
        "delay",
        "Delay",
        ScopeDefinition::new()
            .with_activity(ActivityDefinition::start_event("start"))
            .with_activity(ActivityDefinition::timer_catch("wait", TimerDefinition::Duration(duration)))
            .with_activity(ActivityDefinition::end_event("end"))
            .with_flow(SequenceFlow::new("f1", "start", "wait"))
            .with_flow(SequenceFlow::new("f2", "wait", "end")),
    )
}

#[tokio::test]
async fn test_signal_broadcast_wakes_every_subscriber() -> anyhow::Result<()> {
    let harness = Harness::new(vec![wait_for_alarm()]).await?;
    let first = harness
        .runtime
        .start_workflow(&ProcessId::from("sleeper"), vars(json!({})))
        .await?;
    let second = harness
        .runtime
        .start_workflow(&ProcessId::from("sleeper"), vars(json!({})))
        .await?;
    assert_eq!(harness.provider.signals().subscriber_count("wake-up"), 2);

    let woken = harness
        .runtime
        .broadcast_signal("wake-up", vars(json!({"at": "07:00"})))
        .await?;
    assert_eq!(woken, 2);

    for id in [&first, &second] {
        let instance = harness.wait_for_stage(id, WorkflowStage::Completed).await?;
        assert_eq!(root_variable(&instance, "at"), Some(json!("07:00")));
    }
    assert_eq!(harness.runtime.broadcast_signal("wake-up", vars(json!({}))).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_signal_throw_reaches_other_instances() -> anyhow::Result<()> {
    let harness = Harness::new(vec![wait_for_alarm(), raise_alarm()]).await?;
    let sleeper = harness
        .runtime
        .start_workflow(&ProcessId::from("sleeper"), vars(json!({})))
        .await?;

    let clock = harness
        .runtime
        .start_workflow(&ProcessId::from("alarm-clock"), vars(json!({"volume": 11})))
        .await?;
    harness.wait_for_stage(&clock, WorkflowStage::Completed).await?;

    let instance = harness.wait_for_stage(&sleeper, WorkflowStage::Completed).await?;
    assert_eq!(root_variable(&instance, "volume"), Some(json!(11)));
    Ok(())
}

#[tokio::test]
async fn test_message_correlates_by_variable_key() -> anyhow::Result<()> {
    let harness = Harness::new(vec![order_payment()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("order"), vars(json!({"order": {"id": "o-42"}})))
        .await?;

    assert!(!harness.runtime.deliver_message("payment", "o-41", vars(json!({}))).await?);
    assert!(
        harness
            .runtime
            .deliver_message("payment", "o-42", vars(json!({"paidAmount": 12})))
            .await?
    );
    // the subscription was consumed
    assert!(!harness.runtime.deliver_message("payment", "o-42", vars(json!({}))).await?);

    let instance = harness.instance(&id).await?;
    assert_eq!(executing(&instance, "ship").len(), 1);
    assert_eq!(root_variable(&instance, "paidAmount"), Some(json!(12)));
    Ok(())
}

#[tokio::test]
async fn test_missing_correlation_key_rejects_start() -> anyhow::Result<()> {
    let provider = InMemoryStateStoreProvider::new();
    provider.deploy(order_payment()).await?;
    let service = service(&provider);
    let id = WorkflowInstanceId::from("wf-1");

    let result = service
        .start_workflow(StartWorkflowRequest {
            instance_id: id.clone(),
            process_id: ProcessId::from("order"),
            variables: vars(json!({})),
            parent: None,
        })
        .await;
    assert!(matches!(result, Err(CoreError::CorrelationError(_))));
    assert!(service.get_instance(&id).await?.is_none());
    assert!(provider.messages().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_timer_catch_fires_through_scheduler() -> anyhow::Result<()> {
    let harness = Harness::new(vec![delay(Duration::from_millis(30))]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("delay"), vars(json!({})))
        .await?;

    let instance = harness.wait_for_stage(&id, WorkflowStage::Completed).await?;
    assert_eq!(completed_count(&instance, "end"), 1);
    assert!(harness.provider.timers().active_timers().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_repeated_timer_fire_is_idempotent() -> anyhow::Result<()> {
    let provider = InMemoryStateStoreProvider::new();
    provider.deploy(delay(Duration::from_secs(3600))).await?;
    let service = service(&provider);
    let id = WorkflowInstanceId::from("wf-1");
    service
        .start_workflow(StartWorkflowRequest {
            instance_id: id.clone(),
            process_id: ProcessId::from("delay"),
            variables: vars(json!({})),
            parent: None,
        })
        .await?;

    let instance = service.get_instance(&id).await?.expect("stored");
    let key = instance.subscriptions[0].key.clone();
    assert_eq!(key, format!("{}/{}/catch", id, executing(&instance, "wait")[0]));

    let first = service.fire_timer(&id, &key).await?;
    assert!(first.applied);
    assert_eq!(first.stage, WorkflowStage::Completed);

    let again = service.fire_timer(&id, &key).await?;
    assert!(!again.applied);
    let unknown = service.fire_timer(&id, "wf-1/nothing-9/catch").await?;
    assert!(!unknown.applied);
    Ok(())
}

#[tokio::test]
async fn test_start_is_idempotent_per_instance_id() -> anyhow::Result<()> {
    let provider = InMemoryStateStoreProvider::new();
    provider.deploy(delay(Duration::from_secs(3600))).await?;
    let service = service(&provider);
    let request = StartWorkflowRequest {
        instance_id: WorkflowInstanceId::from("wf-1"),
        process_id: ProcessId::from("delay"),
        variables: vars(json!({})),
        parent: None,
    };

    assert!(service.start_workflow(request.clone()).await?.applied);
    let repeated = service.start_workflow(request).await?;
    assert!(!repeated.applied);
    assert_eq!(provider.timers().active_timers().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_exported_snapshots_resume_elsewhere() -> anyhow::Result<()> {
    let harness = Harness::new(vec![order_payment()]).await?;
    let id = harness
        .runtime
        .start_workflow(&ProcessId::from("order"), vars(json!({"order": {"id": "o-7"}})))
        .await?;
    harness
        .runtime
        .deliver_message("payment", "o-7", vars(json!({})))
        .await?;
    let exported = harness.provider.store().export().await?;

    let restored = Harness::new(vec![order_payment()]).await?;
    restored.provider.store().import(&exported).await?;
    let instance = restored.instance(&id).await?;
    assert_eq!(executing(&instance, "ship").len(), 1);

    restored
        .runtime
        .complete_activity(&id, &"ship".into(), vars(json!({"tracking": "t-1"})))
        .await?;
    let instance = restored.wait_for_stage(&id, WorkflowStage::Completed).await?;
    assert_eq!(root_variable(&instance, "tracking"), Some(json!("t-1")));

    // the original store is untouched
    assert_eq!(harness.instance(&id).await?.stage, WorkflowStage::Running);
    Ok(())
}

#[tokio::test]
async fn test_message_registry_is_shared_with_the_runtime() -> anyhow::Result<()> {
    let harness = Harness::new(vec![order_payment()]).await?;
    harness
        .runtime
        .start_workflow(&ProcessId::from("order"), vars(json!({"order": {"id": "o-1"}})))
        .await?;

    let waiting = harness.provider.messages().take("payment", "o-1").await?;
    assert!(waiting.is_some());
    assert!(!harness.runtime.deliver_message("payment", "o-1", vars(json!({}))).await?);
    Ok(())
}

#[tokio::test]
async fn test_conflicting_write_releases_new_registrations() -> anyhow::Result<()> {
    let provider = InMemoryStateStoreProvider::new();
    provider.deploy(prepared_order()).await?;
    let store = Arc::new(RacedStore {
        inner: provider.store(),
        raced: AtomicBool::new(false),
    });
    let service = WorkflowExecutionService::new(
        Collaborators {
            store,
            ..provider.collaborators()
        },
        EngineConfig::default(),
        Arc::new(LoggingEventHandler),
    );
    let id = WorkflowInstanceId::from("wf-1");
    service
        .start_workflow(StartWorkflowRequest {
            instance_id: id.clone(),
            process_id: ProcessId::from("prepared-order"),
            variables: vars(json!({"order": {"id": "o-9"}})),
            parent: None,
        })
        .await?;

    let raced = service.complete_activity(&id, &"prepare".into(), vars(json!({}))).await;
    assert!(matches!(raced, Err(CoreError::VersionConflict { .. })));
    assert!(provider.messages().is_empty());

    // the retry registers the same correlation key again
    let retried = service.complete_activity(&id, &"prepare".into(), vars(json!({}))).await?;
    assert!(retried.applied);
    assert_eq!(provider.messages().len(), 1);

    let subscription = provider
        .messages()
        .take("payment", "o-9")
        .await?
        .expect("payment subscription");
    let paid = service.deliver_message(subscription, vars(json!({}))).await?;
    assert_eq!(paid.stage, WorkflowStage::Completed);
    Ok(())
}

#[tokio::test]
async fn test_failed_start_releases_earlier_registrations() -> anyhow::Result<()> {
    let provider = InMemoryStateStoreProvider::new();
    provider.deploy(reminded_payment()).await?;
    let service = service(&provider);
    let id = WorkflowInstanceId::from("wf-1");

    let result = service
        .start_workflow(StartWorkflowRequest {
            instance_id: id.clone(),
            process_id: ProcessId::from("reminded-payment"),
            variables: vars(json!({})),
            parent: None,
        })
        .await;
    assert!(matches!(result, Err(CoreError::CorrelationError(_))));
    assert!(provider.timers().active_timers().is_empty());
    assert!(provider.messages().is_empty());
    assert!(service.get_instance(&id).await?.is_none());
    Ok(())
}
