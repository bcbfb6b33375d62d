use crate::{
    application::execution_loop::{ActivityRef, OutboundEffect, StartWorkflowRequest},
    application::workflow_execution_service::{Trigger, TriggerOutcome, WorkflowExecutionService},
    domain::process_definition::{ActivityId, ProcessId, SequenceFlowId},
    domain::repository::{ConditionEvaluator, TimerFired},
    domain::workflow_instance::{ActivityInstanceId, WorkflowInstance, WorkflowInstanceId},
    types::Variables,
    ActivityError, CoreError,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error code a call activity fails with when its child cannot be started
pub const CHILD_START_FAILED: &str = "ChildWorkflowStartFailed";

const ENQUEUE_ATTEMPTS: usize = 3;

enum InstanceCommand {
    Start(StartWorkflowRequest),
    Trigger(Trigger),
}

struct Envelope {
    command: InstanceCommand,
    reply: Option<oneshot::Sender<Result<TriggerOutcome, CoreError>>>,
}

struct RuntimeInner {
    service: WorkflowExecutionService,
    evaluator: Arc<dyn ConditionEvaluator>,
    mailboxes: DashMap<WorkflowInstanceId, mpsc::Sender<Envelope>>,
    capacity: usize,
}

/// The main API provided by Tideflow to external systems.
///
/// Every workflow instance gets a mailbox drained by a dedicated worker
/// task, so triggers for one instance are processed strictly one at a
/// time while different instances run concurrently. Effects that address
/// other instances (child starts, parent notifications, condition results,
/// signal broadcasts) are queued onto the target's mailbox from detached
/// tasks; a worker never waits on another instance. Once an instance has
/// finished its worker retires and the mailbox is dropped; a later trigger
/// for it starts a fresh worker.
#[derive(Clone)]
pub struct RuntimeInterface {
    inner: Arc<RuntimeInner>,
}

impl RuntimeInterface {
    /// Create a new runtime interface
    pub fn new(service: WorkflowExecutionService, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        let capacity = service.config().mailbox_capacity;
        Self {
            inner: Arc::new(RuntimeInner {
                service,
                evaluator,
                mailboxes: DashMap::new(),
                capacity,
            }),
        }
    }

    /// The underlying execution service
    pub fn service(&self) -> &WorkflowExecutionService {
        &self.inner.service
    }

    /// Start a new instance of a process
    pub async fn start_workflow(&self, process_id: &ProcessId, variables: Variables) -> Result<WorkflowInstanceId, CoreError> {
        let instance_id = WorkflowInstanceId::generate();
        self.dispatch(
            &instance_id,
            InstanceCommand::Start(StartWorkflowRequest {
                instance_id: instance_id.clone(),
                process_id: process_id.clone(),
                variables,
                parent: None,
            }),
        )
        .await?;
        Ok(instance_id)
    }

    /// Complete the executing task `activity_id`
    pub async fn complete_activity(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_id: &ActivityId,
        variables: Variables,
    ) -> Result<TriggerOutcome, CoreError> {
        self.trigger(
            instance_id,
            Trigger::CompleteActivity {
                activity: ActivityRef::Definition(activity_id.clone()),
                variables,
            },
        )
        .await
    }

    /// Complete one specific task instance
    pub async fn complete_activity_instance(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_instance_id: &ActivityInstanceId,
        variables: Variables,
    ) -> Result<TriggerOutcome, CoreError> {
        self.trigger(
            instance_id,
            Trigger::CompleteActivity {
                activity: ActivityRef::Instance(activity_instance_id.clone()),
                variables,
            },
        )
        .await
    }

    /// Fail the executing activity `activity_id` with a domain error
    pub async fn fail_activity(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_id: &ActivityId,
        error: ActivityError,
    ) -> Result<TriggerOutcome, CoreError> {
        self.trigger(
            instance_id,
            Trigger::FailActivity {
                activity: ActivityRef::Definition(activity_id.clone()),
                error,
            },
        )
        .await
    }

    /// Deliver a timer fire
    pub async fn fire_timer(&self, fired: TimerFired) -> Result<TriggerOutcome, CoreError> {
        self.trigger(&fired.instance_id, Trigger::FireTimer { key: fired.key })
            .await
    }

    /// Record an externally evaluated gateway condition
    pub async fn set_condition_result(
        &self,
        instance_id: &WorkflowInstanceId,
        gateway_instance_id: &ActivityInstanceId,
        flow_id: &SequenceFlowId,
        result: bool,
    ) -> Result<TriggerOutcome, CoreError> {
        self.trigger(
            instance_id,
            Trigger::ConditionResult {
                gateway_instance_id: gateway_instance_id.clone(),
                flow_id: flow_id.clone(),
                result,
            },
        )
        .await
    }

    /// Correlate a message; returns whether a waiting activity consumed it
    pub async fn deliver_message(
        &self,
        message_name: &str,
        correlation_key: &str,
        variables: Variables,
    ) -> Result<bool, CoreError> {
        let subscription = self
            .inner
            .service
            .collaborators()
            .messages
            .take(message_name, correlation_key)
            .await?;
        let Some(subscription) = subscription else {
            debug!(message = message_name, correlation_key, "No subscription for message");
            return Ok(false);
        };

        let instance_id = subscription.instance_id.clone();
        let outcome = self
            .trigger(
                &instance_id,
                Trigger::DeliverMessage {
                    subscription,
                    variables,
                },
            )
            .await?;
        Ok(outcome.applied)
    }

    /// Deliver a signal to every current subscriber; returns how many
    /// subscribers it resumed
    pub async fn broadcast_signal(&self, signal_name: &str, variables: Variables) -> Result<usize, CoreError> {
        let subscribers = self
            .inner
            .service
            .collaborators()
            .signals
            .take_all(signal_name)
            .await?;
        info!(signal = signal_name, subscribers = subscribers.len(), "Broadcasting signal");

        let deliveries = subscribers.into_iter().map(|subscription| {
            let runtime = self.clone();
            let variables = variables.clone();
            async move {
                let instance_id = subscription.instance_id.clone();
                let result = runtime
                    .trigger(
                        &instance_id,
                        Trigger::DeliverSignal {
                            subscription,
                            variables,
                        },
                    )
                    .await;
                (instance_id, result)
            }
        });

        let mut delivered = 0;
        for (instance_id, result) in futures::future::join_all(deliveries).await {
            match result {
                Ok(outcome) if outcome.applied => delivered += 1,
                Ok(_) => debug!(instance_id = %instance_id, signal = signal_name, "Signal subscriber no longer waiting"),
                Err(e) => warn!(instance_id = %instance_id, signal = signal_name, error = %e, "Signal delivery failed"),
            }
        }
        Ok(delivered)
    }

    /// Number of instances that currently have a worker
    pub fn active_workers(&self) -> usize {
        self.inner.mailboxes.len()
    }

    /// Load an instance snapshot
    pub async fn get_instance(&self, instance_id: &WorkflowInstanceId) -> Result<Option<WorkflowInstance>, CoreError> {
        self.inner.service.get_instance(instance_id).await
    }

    /// Feed timer fires from a scheduler into the instances
    pub fn start_timer_processor(&self, mut receiver: mpsc::Receiver<TimerFired>) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            info!("Timer processor started");
            while let Some(fired) = receiver.recv().await {
                let key = fired.key.clone();
                if let Err(e) = runtime.fire_timer(fired).await {
                    warn!(key = %key, error = %e, "Timer fire failed");
                }
            }
            info!("Timer processor stopped");
        })
    }

    async fn trigger(&self, instance_id: &WorkflowInstanceId, trigger: Trigger) -> Result<TriggerOutcome, CoreError> {
        self.dispatch(instance_id, InstanceCommand::Trigger(trigger)).await
    }

    async fn dispatch(&self, instance_id: &WorkflowInstanceId, command: InstanceCommand) -> Result<TriggerOutcome, CoreError> {
        let (reply, response) = oneshot::channel();
        self.enqueue(
            instance_id,
            Envelope {
                command,
                reply: Some(reply),
            },
        )
        .await?;
        response
            .await
            .map_err(|_| CoreError::Other(format!("Worker for {} stopped before replying", instance_id)))?
    }

    async fn enqueue(&self, instance_id: &WorkflowInstanceId, mut envelope: Envelope) -> Result<(), CoreError> {
        for _ in 0..ENQUEUE_ATTEMPTS {
            match self.mailbox(instance_id).send(envelope).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    // the worker retired; replace its mailbox
                    self.inner
                        .mailboxes
                        .remove_if(instance_id, |_, sender| sender.is_closed());
                    envelope = returned;
                }
            }
        }
        Err(CoreError::Other(format!("Mailbox of {} is closed", instance_id)))
    }

    fn mailbox(&self, instance_id: &WorkflowInstanceId) -> mpsc::Sender<Envelope> {
        if let Some(sender) = self.inner.mailboxes.get(instance_id) {
            return sender.clone();
        }
        self.inner
            .mailboxes
            .entry(instance_id.clone())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(self.inner.capacity);
                tokio::spawn(run_worker(self.clone(), instance_id.clone(), receiver));
                sender
            })
            .clone()
    }

    fn route_effects(&self, effects: Vec<OutboundEffect>) {
        for effect in effects {
            let runtime = self.clone();
            tokio::spawn(async move {
                if let Err(e) = runtime.route_effect(effect).await {
                    warn!(error = %e, "Failed to route effect");
                }
            });
        }
    }

    async fn route_effect(&self, effect: OutboundEffect) -> Result<(), CoreError> {
        match effect {
            OutboundEffect::StartChildWorkflow(request) => {
                let child_id = request.instance_id.clone();
                let parent = request.parent.clone();
                let error = match self.dispatch(&child_id, InstanceCommand::Start(request)).await {
                    Ok(_) => return Ok(()),
                    Err(e) => e,
                };
                warn!(child_id = %child_id, error = %error, "Child workflow failed to start");
                let Some(parent) = parent else {
                    return Err(error);
                };
                self.enqueue(
                    &parent.instance_id,
                    Envelope {
                        command: InstanceCommand::Trigger(Trigger::ChildFailed {
                            activity_instance_id: parent.activity_instance_id,
                            child_id,
                            error: ActivityError::new(CHILD_START_FAILED, error.to_string()),
                        }),
                        reply: None,
                    },
                )
                .await
            }
            OutboundEffect::NotifyParentCompleted {
                parent,
                child_id,
                variables,
            } => {
                self.enqueue(
                    &parent.instance_id,
                    Envelope {
                        command: InstanceCommand::Trigger(Trigger::ChildCompleted {
                            activity_instance_id: parent.activity_instance_id,
                            child_id,
                            variables,
                        }),
                        reply: None,
                    },
                )
                .await
            }
            OutboundEffect::NotifyParentFailed {
                parent,
                child_id,
                error,
            } => {
                self.enqueue(
                    &parent.instance_id,
                    Envelope {
                        command: InstanceCommand::Trigger(Trigger::ChildFailed {
                            activity_instance_id: parent.activity_instance_id,
                            child_id,
                            error,
                        }),
                        reply: None,
                    },
                )
                .await
            }
            OutboundEffect::EvaluateCondition(request) => {
                let trigger = match self
                    .inner
                    .evaluator
                    .evaluate(&request.expression, &request.variables)
                    .await
                {
                    Ok(result) => Trigger::ConditionResult {
                        gateway_instance_id: request.gateway_instance_id,
                        flow_id: request.flow_id,
                        result,
                    },
                    Err(e) => {
                        warn!(
                            instance_id = %request.instance_id,
                            expression = %request.expression,
                            error = %e,
                            "Condition evaluation failed"
                        );
                        Trigger::FailActivity {
                            activity: ActivityRef::Instance(request.gateway_instance_id),
                            error: ActivityError::new("ConditionEvaluationError", e.to_string()),
                        }
                    }
                };
                self.enqueue(
                    &request.instance_id,
                    Envelope {
                        command: InstanceCommand::Trigger(trigger),
                        reply: None,
                    },
                )
                .await
            }
            OutboundEffect::BroadcastSignal { signal, variables } => {
                self.broadcast_signal(&signal, variables).await.map(|_| ())
            }
        }
    }
}

async fn run_worker(runtime: RuntimeInterface, instance_id: WorkflowInstanceId, mut receiver: mpsc::Receiver<Envelope>) {
    debug!(instance_id = %instance_id, "Instance worker started");
    let mut retiring = false;
    while let Some(envelope) = receiver.recv().await {
        let starting = matches!(envelope.command, InstanceCommand::Start(_));
        let result = match envelope.command {
            InstanceCommand::Start(request) => runtime.inner.service.start_workflow(request).await,
            InstanceCommand::Trigger(trigger) => runtime.inner.service.handle(&instance_id, trigger).await,
        };
        // nothing further can change a finished or never stored instance
        let done = match &result {
            Ok(outcome) => outcome.stage.is_finished(),
            Err(_) => starting,
        };
        if let Ok(outcome) = &result {
            runtime.route_effects(outcome.effects.clone());
        }
        match envelope.reply {
            Some(reply) => {
                // the caller may have given up waiting
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    error!(instance_id = %instance_id, error = %e, "Queued work failed");
                }
            }
        }

        if done && !retiring {
            // drain what was queued before the close, then exit
            receiver.close();
            runtime
                .inner
                .mailboxes
                .remove_if(&instance_id, |_, sender| sender.is_closed());
            retiring = true;
        }
    }
    debug!(instance_id = %instance_id, "Instance worker stopped");
}
