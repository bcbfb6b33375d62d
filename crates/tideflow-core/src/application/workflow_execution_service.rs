use crate::{
    application::boundary_coordinator::release_registrations,
    application::execution_loop::{ActivityRef, ExecutionContext, OutboundEffect, StartWorkflowRequest},
    domain::events::DomainEvent,
    domain::process_definition::{ActivityId, SequenceFlowId},
    domain::repository::{Collaborators, MessageSubscription, SignalSubscription, VersionedInstance},
    domain::workflow_instance::{ActivityInstanceId, Subscription, WorkflowInstance, WorkflowInstanceId, WorkflowStage},
    types::Variables,
    ActivityError, CoreError, EngineConfig,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An external event addressed to one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trigger {
    /// A waiting task finished
    CompleteActivity {
        /// Task to complete
        activity: ActivityRef,
        /// Variables written into the task's scope
        variables: Variables,
    },
    /// An executing activity failed
    FailActivity {
        /// Activity to fail
        activity: ActivityRef,
        /// Domain error
        error: ActivityError,
    },
    /// A timer came due
    FireTimer {
        /// Timer key
        key: String,
    },
    /// A correlated message arrived
    DeliverMessage {
        /// Subscription taken from the message registry
        subscription: MessageSubscription,
        /// Message payload
        variables: Variables,
    },
    /// A broadcast signal reached this subscriber
    DeliverSignal {
        /// Subscription taken from the signal registry
        subscription: SignalSubscription,
        /// Signal payload
        variables: Variables,
    },
    /// One gateway condition was evaluated
    ConditionResult {
        /// Gateway activity instance
        gateway_instance_id: ActivityInstanceId,
        /// Evaluated flow
        flow_id: SequenceFlowId,
        /// Outcome
        result: bool,
    },
    /// A child workflow completed
    ChildCompleted {
        /// Waiting call activity
        activity_instance_id: ActivityInstanceId,
        /// The child
        child_id: WorkflowInstanceId,
        /// Child root scope variables
        variables: Variables,
    },
    /// A child workflow failed
    ChildFailed {
        /// Waiting call activity
        activity_instance_id: ActivityInstanceId,
        /// The child
        child_id: WorkflowInstanceId,
        /// Unhandled child failure
        error: ActivityError,
    },
}

impl Trigger {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::CompleteActivity { .. } => "complete_activity",
            Trigger::FailActivity { .. } => "fail_activity",
            Trigger::FireTimer { .. } => "fire_timer",
            Trigger::DeliverMessage { .. } => "deliver_message",
            Trigger::DeliverSignal { .. } => "deliver_signal",
            Trigger::ConditionResult { .. } => "condition_result",
            Trigger::ChildCompleted { .. } => "child_completed",
            Trigger::ChildFailed { .. } => "child_failed",
        }
    }
}

/// What processing one trigger did
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOutcome {
    /// The instance
    pub instance_id: WorkflowInstanceId,
    /// Stage after processing
    pub stage: WorkflowStage,
    /// False when the trigger was stale or a duplicate and changed nothing
    pub applied: bool,
    /// Work for other instances
    pub effects: Vec<OutboundEffect>,
}

impl TriggerOutcome {
    fn ignored(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            stage: instance.stage,
            applied: false,
            effects: Vec::new(),
        }
    }
}

/// Handler for domain events
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Event handler that only traces events
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventHandler;

#[async_trait]
impl DomainEventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        debug!(
            event_type = event.event_type(),
            instance_id = %event.workflow_instance_id(),
            "Domain event"
        );
        Ok(())
    }
}

/// Applies triggers to workflow instances.
///
/// Every operation loads the snapshot, runs the execution loop to a fixed
/// point and writes the snapshot back with an optimistic version check.
/// Calls for one instance must be serialized by the caller; the
/// [`RuntimeInterface`](super::runtime_interface::RuntimeInterface) does so
/// with one mailbox per instance.
#[derive(Clone)]
pub struct WorkflowExecutionService {
    collaborators: Collaborators,
    config: EngineConfig,
    event_handler: Arc<dyn DomainEventHandler>,
}

impl WorkflowExecutionService {
    /// Create a new workflow execution service
    pub fn new(
        collaborators: Collaborators,
        config: EngineConfig,
        event_handler: Arc<dyn DomainEventHandler>,
    ) -> Self {
        Self {
            collaborators,
            config,
            event_handler,
        }
    }

    /// The collaborators the service runs against
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create and run a new instance until it waits or finishes.
    ///
    /// Starting an id that already exists is a no-op.
    pub async fn start_workflow(&self, request: StartWorkflowRequest) -> Result<TriggerOutcome, CoreError> {
        if let Some(existing) = self.collaborators.store.read(&request.instance_id).await? {
            debug!(instance_id = %request.instance_id, "Workflow instance already exists");
            return Ok(TriggerOutcome::ignored(&existing.instance));
        }

        let definition = self
            .collaborators
            .definitions
            .get_definition(&request.process_id)
            .await?;
        let start = definition.scope.start_event().ok_or_else(|| {
            CoreError::ConfigurationError(format!("Process {} has no start event", definition.id))
        })?;

        let mut instance = WorkflowInstance::new(
            request.instance_id,
            request.process_id,
            request.parent,
            request.variables,
        );
        instance.start()?;
        let root = instance.root_scope_id.clone();
        instance.add_entry(start.id.clone(), None, root);
        info!(instance_id = %instance.id, process_id = %instance.process_id, "Starting workflow");

        let (result, registered) = {
            let mut ctx = ExecutionContext::new(&mut instance, &definition, &self.collaborators, &self.config);
            let result = ctx.run().await;
            let (effects, registered) = ctx.into_parts();
            (result.map(|()| effects), registered)
        };
        let effects = match result {
            Ok(effects) => effects,
            Err(e) => return Err(self.discard(&instance.id, &registered, e).await),
        };

        if let Err(e) = self.persist(&mut instance, None).await {
            return Err(self.discard(&instance.id, &registered, e).await);
        }
        Ok(TriggerOutcome {
            instance_id: instance.id.clone(),
            stage: instance.stage,
            applied: true,
            effects,
        })
    }

    /// Apply one trigger to an instance.
    ///
    /// Stale triggers are acknowledged with `applied == false` and leave the
    /// stored snapshot untouched. On error nothing is written and the
    /// registrations the trigger made are released.
    pub async fn handle(&self, instance_id: &WorkflowInstanceId, trigger: Trigger) -> Result<TriggerOutcome, CoreError> {
        let VersionedInstance {
            mut instance,
            version,
        } = self
            .collaborators
            .store
            .read(instance_id)
            .await?
            .ok_or_else(|| CoreError::WorkflowInstanceNotFound(instance_id.0.clone()))?;

        if instance.stage.is_finished() {
            debug!(instance_id = %instance_id, trigger = trigger.name(), "Ignoring trigger for finished workflow");
            return Ok(TriggerOutcome::ignored(&instance));
        }

        let definition = self
            .collaborators
            .definitions
            .get_definition(&instance.process_id)
            .await?;
        let name = trigger.name();

        let (result, registered) = {
            let mut ctx = ExecutionContext::new(&mut instance, &definition, &self.collaborators, &self.config);
            let result = apply_trigger(&mut ctx, trigger).await;
            let (effects, registered) = ctx.into_parts();
            (result.map(|applied| (applied, effects)), registered)
        };
        let (applied, effects) = match result {
            Ok(processed) => processed,
            Err(e) => return Err(self.discard(instance_id, &registered, e).await),
        };

        if applied {
            if let Err(e) = self.persist(&mut instance, Some(version)).await {
                return Err(self.discard(instance_id, &registered, e).await);
            }
        }
        debug!(
            instance_id = %instance_id,
            trigger = name,
            applied,
            stage = ?instance.stage,
            effects = effects.len(),
            "Trigger processed"
        );
        Ok(TriggerOutcome {
            instance_id: instance.id.clone(),
            stage: instance.stage,
            applied,
            effects,
        })
    }

    /// Complete the executing task `activity_id`
    pub async fn complete_activity(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_id: &ActivityId,
        variables: Variables,
    ) -> Result<TriggerOutcome, CoreError> {
        self.handle(
            instance_id,
            Trigger::CompleteActivity {
                activity: ActivityRef::Definition(activity_id.clone()),
                variables,
            },
        )
        .await
    }

    /// Complete one specific task instance, e.g. one multi-instance iteration
    pub async fn complete_activity_instance(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_instance_id: &ActivityInstanceId,
        variables: Variables,
    ) -> Result<TriggerOutcome, CoreError> {
        self.handle(
            instance_id,
            Trigger::CompleteActivity {
                activity: ActivityRef::Instance(activity_instance_id.clone()),
                variables,
            },
        )
        .await
    }

    /// Fail the executing activity `activity_id`
    pub async fn fail_activity(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_id: &ActivityId,
        error: ActivityError,
    ) -> Result<TriggerOutcome, CoreError> {
        self.handle(
            instance_id,
            Trigger::FailActivity {
                activity: ActivityRef::Definition(activity_id.clone()),
                error,
            },
        )
        .await
    }

    /// Deliver a timer fire
    pub async fn fire_timer(&self, instance_id: &WorkflowInstanceId, key: &str) -> Result<TriggerOutcome, CoreError> {
        self.handle(instance_id, Trigger::FireTimer { key: key.to_string() })
            .await
    }

    /// Deliver a message to the subscription it correlated with
    pub async fn deliver_message(
        &self,
        subscription: MessageSubscription,
        variables: Variables,
    ) -> Result<TriggerOutcome, CoreError> {
        let instance_id = subscription.instance_id.clone();
        self.handle(
            &instance_id,
            Trigger::DeliverMessage {
                subscription,
                variables,
            },
        )
        .await
    }

    /// Deliver a signal to one subscriber
    pub async fn deliver_signal(
        &self,
        subscription: SignalSubscription,
        variables: Variables,
    ) -> Result<TriggerOutcome, CoreError> {
        let instance_id = subscription.instance_id.clone();
        self.handle(
            &instance_id,
            Trigger::DeliverSignal {
                subscription,
                variables,
            },
        )
        .await
    }

    /// Record the result of an exclusive gateway condition
    pub async fn set_condition_result(
        &self,
        instance_id: &WorkflowInstanceId,
        gateway_instance_id: &ActivityInstanceId,
        flow_id: &SequenceFlowId,
        result: bool,
    ) -> Result<TriggerOutcome, CoreError> {
        self.handle(
            instance_id,
            Trigger::ConditionResult {
                gateway_instance_id: gateway_instance_id.clone(),
                flow_id: flow_id.clone(),
                result,
            },
        )
        .await
    }

    /// Resume a call activity whose child completed
    pub async fn on_child_workflow_completed(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_instance_id: &ActivityInstanceId,
        child_id: &WorkflowInstanceId,
        variables: Variables,
    ) -> Result<TriggerOutcome, CoreError> {
        self.handle(
            instance_id,
            Trigger::ChildCompleted {
                activity_instance_id: activity_instance_id.clone(),
                child_id: child_id.clone(),
                variables,
            },
        )
        .await
    }

    /// Fail a call activity whose child failed
    pub async fn on_child_workflow_failed(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_instance_id: &ActivityInstanceId,
        child_id: &WorkflowInstanceId,
        error: ActivityError,
    ) -> Result<TriggerOutcome, CoreError> {
        self.handle(
            instance_id,
            Trigger::ChildFailed {
                activity_instance_id: activity_instance_id.clone(),
                child_id: child_id.clone(),
                error,
            },
        )
        .await
    }

    /// Load an instance snapshot
    pub async fn get_instance(&self, instance_id: &WorkflowInstanceId) -> Result<Option<WorkflowInstance>, CoreError> {
        Ok(self
            .collaborators
            .store
            .read(instance_id)
            .await?
            .map(|versioned| versioned.instance))
    }

    /// Release what a failed trigger registered and hand back its error
    async fn discard(&self, instance_id: &WorkflowInstanceId, registered: &[Subscription], error: CoreError) -> CoreError {
        if !registered.is_empty() {
            warn!(
                instance_id = %instance_id,
                registrations = registered.len(),
                error = %error,
                "Releasing registrations of a discarded trigger"
            );
            release_registrations(&self.collaborators, instance_id, registered).await;
        }
        error
    }

    async fn persist(&self, instance: &mut WorkflowInstance, expected_version: Option<u64>) -> Result<u64, CoreError> {
        let version = self.collaborators.store.write(instance, expected_version).await?;
        self.handle_events(instance).await;
        Ok(version)
    }

    async fn handle_events(&self, instance: &mut WorkflowInstance) {
        for event in instance.take_events() {
            let event_type = event.event_type();
            if let Err(e) = self.event_handler.handle_event(event).await {
                warn!(instance_id = %instance.id, event_type, error = %e, "Event handler failed");
            }
        }
    }
}

async fn apply_trigger(ctx: &mut ExecutionContext<'_>, trigger: Trigger) -> Result<bool, CoreError> {
    let applied = match trigger {
        Trigger::CompleteActivity { activity, variables } => {
            ctx.complete_external(&activity, variables).await?;
            true
        }
        Trigger::FailActivity { activity, error } => {
            ctx.fail_external(&activity, error).await?;
            true
        }
        Trigger::FireTimer { key } => ctx.fire_timer(&key).await?,
        Trigger::DeliverMessage {
            subscription,
            variables,
        } => ctx.deliver_message(&subscription, variables).await?,
        Trigger::DeliverSignal {
            subscription,
            variables,
        } => ctx.deliver_signal(&subscription, variables).await?,
        Trigger::ConditionResult {
            gateway_instance_id,
            flow_id,
            result,
        } => ctx.apply_condition_result(&gateway_instance_id, &flow_id, result)?,
        Trigger::ChildCompleted {
            activity_instance_id,
            child_id,
            variables,
        } => ctx.complete_from_child(&activity_instance_id, &child_id, variables)?,
        Trigger::ChildFailed {
            activity_instance_id,
            child_id,
            error,
        } => ctx.fail_from_child(&activity_instance_id, &child_id, error).await?,
    };
    if applied {
        ctx.run().await?;
    }
    Ok(applied)
}
