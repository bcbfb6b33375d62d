//! External registrations and the events that fire them.
//!
//! Timers, message and signal subscriptions are registered with the
//! collaborators and mirrored on the instance as [`Subscription`]s so that
//! they can be torn down when their host finishes. Registrations made by a
//! trigger that is not persisted are released again by
//! `release_registrations`. Error boundaries need no
//! registration: [`ExecutionContext::fail_activity`] matches them when an
//! activity fails.

use super::execution_loop::ExecutionContext;
use crate::domain::command::EventBinding;
use crate::domain::process_definition::{ActivityId, TimerDefinition};
use crate::domain::repository::{Collaborators, MessageSubscription, SignalSubscription, TimerRegistration};
use crate::domain::workflow_instance::{ActivityInstanceId, Subscription, SubscriptionKind, WorkflowInstanceId};
use crate::types::{search_variables, value_as_key, Variables};
use crate::{ActivityError, CoreError};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

impl<'a> ExecutionContext<'a> {
    fn subscription_key(&self, host: &ActivityInstanceId, binding: &EventBinding) -> String {
        let target = binding
            .boundary
            .as_ref()
            .map(|b| b.0.as_str())
            .unwrap_or("catch");
        format!("{}/{}/{}", self.instance.id, host, target)
    }

    fn subscribed_activity(&self, host: &ActivityInstanceId, binding: &EventBinding) -> Result<ActivityId, CoreError> {
        match &binding.boundary {
            Some(boundary) => Ok(boundary.clone()),
            None => Ok(self.entry(host)?.activity_id.clone()),
        }
    }

    pub(crate) async fn register_timer(
        &mut self,
        host: &ActivityInstanceId,
        timer: &TimerDefinition,
        binding: EventBinding,
    ) -> Result<(), CoreError> {
        let key = self.subscription_key(host, &binding);
        let due_at = timer.due_at(Utc::now())?;
        self.collaborators
            .timers
            .activate(TimerRegistration {
                key: key.clone(),
                instance_id: self.instance.id.clone(),
                due_at,
                period: self.config.timer_guard_period(),
            })
            .await?;

        debug!(instance_id = %self.instance.id, key = %key, due_at = %due_at, "Timer registered");
        self.hold(Subscription {
            key,
            host: host.clone(),
            boundary: binding.boundary,
            cancel_activity: binding.cancel_activity,
            kind: SubscriptionKind::Timer,
        });
        Ok(())
    }

    pub(crate) async fn register_message(
        &mut self,
        host: &ActivityInstanceId,
        message: &str,
        binding: EventBinding,
    ) -> Result<(), CoreError> {
        let correlation_key = match self
            .definition
            .message(message)
            .and_then(|m| m.correlation_key.as_deref())
        {
            Some(expression) => {
                let variables = self.visible_variables(host)?;
                let value = search_variables(expression, &variables)?;
                if value.is_null() {
                    return Err(CoreError::CorrelationError(format!(
                        "Correlation key '{}' of message '{}' resolved to null",
                        expression, message
                    )));
                }
                value_as_key(&value)
            }
            None => self.instance.id.0.clone(),
        };

        self.collaborators
            .messages
            .subscribe(MessageSubscription {
                message_name: message.to_string(),
                correlation_key: correlation_key.clone(),
                instance_id: self.instance.id.clone(),
                activity_id: self.subscribed_activity(host, &binding)?,
                activity_instance_id: host.clone(),
            })
            .await?;

        debug!(
            instance_id = %self.instance.id,
            message,
            correlation_key = %correlation_key,
            "Message subscription registered"
        );
        let key = self.subscription_key(host, &binding);
        self.hold(Subscription {
            key,
            host: host.clone(),
            boundary: binding.boundary,
            cancel_activity: binding.cancel_activity,
            kind: SubscriptionKind::Message {
                name: message.to_string(),
                correlation_key,
            },
        });
        Ok(())
    }

    pub(crate) async fn register_signal(
        &mut self,
        host: &ActivityInstanceId,
        signal: &str,
        binding: EventBinding,
    ) -> Result<(), CoreError> {
        self.collaborators
            .signals
            .subscribe(SignalSubscription {
                signal_name: signal.to_string(),
                instance_id: self.instance.id.clone(),
                activity_id: self.subscribed_activity(host, &binding)?,
                activity_instance_id: host.clone(),
            })
            .await?;

        debug!(instance_id = %self.instance.id, signal, "Signal subscription registered");
        let key = self.subscription_key(host, &binding);
        self.hold(Subscription {
            key,
            host: host.clone(),
            boundary: binding.boundary,
            cancel_activity: binding.cancel_activity,
            kind: SubscriptionKind::Signal {
                name: signal.to_string(),
            },
        });
        Ok(())
    }

    fn hold(&mut self, subscription: Subscription) {
        self.registered.push(subscription.clone());
        self.instance.add_subscription(subscription);
    }

    /// Release every registration held for `host`
    pub(crate) async fn teardown_subscriptions(&mut self, host: &ActivityInstanceId) {
        for subscription in self.instance.take_subscriptions_of(host) {
            self.unregister(&subscription).await;
        }
    }

    async fn unregister(&self, subscription: &Subscription) {
        release_registration(self.collaborators, &self.instance.id, subscription).await;
    }

    /// Timer fire; unknown keys are stale and ignored
    pub(crate) async fn fire_timer(&mut self, key: &str) -> Result<bool, CoreError> {
        let subscription = self
            .instance
            .take_subscription(|s| s.key == key && s.kind == SubscriptionKind::Timer);
        match subscription {
            Some(subscription) => self.fire_subscription(subscription, Variables::new()).await,
            None => {
                debug!(instance_id = %self.instance.id, key, "Ignoring stale timer");
                if let Err(e) = self.collaborators.timers.cancel(key).await {
                    warn!(instance_id = %self.instance.id, key, error = %e, "Failed to cancel stale timer");
                }
                Ok(false)
            }
        }
    }

    /// Message delivery to the subscription taken from the registry
    pub(crate) async fn deliver_message(
        &mut self,
        delivered: &MessageSubscription,
        variables: Variables,
    ) -> Result<bool, CoreError> {
        let subscription = self.instance.take_subscription(|s| {
            s.host == delivered.activity_instance_id
                && s.boundary.as_ref().map_or(true, |b| b == &delivered.activity_id)
                && matches!(
                    &s.kind,
                    SubscriptionKind::Message { name, correlation_key }
                        if name == &delivered.message_name && correlation_key == &delivered.correlation_key
                )
        });
        match subscription {
            Some(subscription) => self.fire_subscription(subscription, variables).await,
            None => {
                debug!(instance_id = %self.instance.id, message = %delivered.message_name, "Ignoring stale message");
                Ok(false)
            }
        }
    }

    /// Signal delivery to one subscriber
    pub(crate) async fn deliver_signal(
        &mut self,
        delivered: &SignalSubscription,
        variables: Variables,
    ) -> Result<bool, CoreError> {
        let subscription = self.instance.take_subscription(|s| {
            s.host == delivered.activity_instance_id
                && s.boundary.as_ref().map_or(true, |b| b == &delivered.activity_id)
                && matches!(&s.kind, SubscriptionKind::Signal { name } if name == &delivered.signal_name)
        });
        match subscription {
            Some(subscription) => self.fire_subscription(subscription, variables).await,
            None => {
                debug!(instance_id = %self.instance.id, signal = %delivered.signal_name, "Ignoring stale signal");
                Ok(false)
            }
        }
    }

    async fn fire_subscription(&mut self, subscription: Subscription, variables: Variables) -> Result<bool, CoreError> {
        if subscription.kind == SubscriptionKind::Timer {
            self.unregister(&subscription).await;
        }

        let host = subscription.host.clone();
        let waiting = self
            .instance
            .entry(&host)
            .map(|e| e.is_active() && e.activity.is_executing())
            .unwrap_or(false);
        if !waiting {
            debug!(instance_id = %self.instance.id, host = %host, "Ignoring trigger for finished activity");
            return Ok(false);
        }

        match subscription.boundary {
            None => {
                let scope = self.variable_scope_of(&host)?;
                self.instance.merge_variables(&scope, variables)?;
                self.cancel_event_gateway_siblings(&host).await?;
                self.instance.entry_mut(&host)?.activity.complete()?;
                debug!(instance_id = %self.instance.id, activity_instance_id = %host, "Catch event fired");
            }
            Some(boundary) => {
                if subscription.cancel_activity {
                    self.cancel_entry(&host, &format!("interrupted by {}", boundary)).await?;
                }
                self.spawn_boundary_entry(&host, &boundary, variables)?;
            }
        }
        Ok(true)
    }

    fn spawn_boundary_entry(
        &mut self,
        host: &ActivityInstanceId,
        boundary: &ActivityId,
        variables: Variables,
    ) -> Result<ActivityInstanceId, CoreError> {
        let (scope_id, variable_scope) = {
            let entry = self.entry(host)?;
            (entry.scope_id.clone(), entry.activity.variable_scope_id.clone())
        };
        self.instance.merge_variables(&variable_scope, variables)?;
        let id = self.instance.add_entry(boundary.clone(), scope_id, variable_scope);
        debug!(instance_id = %self.instance.id, host = %host, boundary = %boundary, "Boundary event fired");
        Ok(id)
    }

    /// Fail an activity and route the error to the nearest matching error
    /// boundary on it or on an enclosing scope. Without a match the failure
    /// is recorded as unhandled.
    pub(crate) async fn fail_activity(&mut self, id: &ActivityInstanceId, error: ActivityError) -> Result<(), CoreError> {
        self.instance.entry_mut(id)?.activity.fail(error.clone());
        self.record_failure_event(id, &error)?;
        debug!(instance_id = %self.instance.id, activity_instance_id = %id, error = %error, "Activity failed");

        let children: Vec<ActivityInstanceId> = self
            .instance
            .children_of(id)
            .filter(|e| e.is_active())
            .map(|e| e.id.clone())
            .collect();
        for child in children {
            self.cancel_entry(&child, "enclosing activity failed").await?;
        }
        self.teardown_subscriptions(id).await;

        let mut candidate = Some(id.clone());
        while let Some(current) = candidate {
            let located = self.locate(&current)?;
            let (activity_id, owner) = {
                let entry = self.entry(&current)?;
                (entry.activity_id.clone(), entry.scope_id.clone())
            };

            if let Some(boundary) = located.scope.error_boundary_for(&activity_id, &error.code) {
                if &current != id {
                    self.cancel_entry(&current, &format!("error {} caught by {}", error.code, boundary.id))
                        .await?;
                }
                self.instance.entry_mut(id)?.error_caught = true;

                let mut variables = Variables::new();
                variables.insert("errorCode".to_string(), json!(error.code));
                variables.insert("errorMessage".to_string(), json!(error.message));
                self.spawn_boundary_entry(&current, &boundary.id, variables)?;
                return Ok(());
            }
            candidate = owner;
        }

        warn!(instance_id = %self.instance.id, activity_instance_id = %id, error = %error, "Unhandled activity failure");
        self.instance.record_failure(error);
        Ok(())
    }
}

/// Release registrations of a trigger whose changes were discarded
pub(crate) async fn release_registrations(
    collaborators: &Collaborators,
    instance_id: &WorkflowInstanceId,
    subscriptions: &[Subscription],
) {
    for subscription in subscriptions {
        release_registration(collaborators, instance_id, subscription).await;
    }
}

async fn release_registration(collaborators: &Collaborators, instance_id: &WorkflowInstanceId, subscription: &Subscription) {
    let result = match &subscription.kind {
        SubscriptionKind::Timer => collaborators.timers.cancel(&subscription.key).await,
        SubscriptionKind::Message {
            name,
            correlation_key,
        } => collaborators.messages.unsubscribe(name, correlation_key).await,
        SubscriptionKind::Signal { name } => {
            collaborators
                .signals
                .unsubscribe(name, instance_id, &subscription.host)
                .await
        }
    };
    if let Err(e) = result {
        warn!(
            instance_id = %instance_id,
            key = %subscription.key,
            error = %e,
            "Failed to release registration"
        );
    }
}
