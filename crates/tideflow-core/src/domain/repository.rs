//! Contracts of the engine's external collaborators.
//!
//! In-memory implementations live in the `tideflow-state-inmemory` crate.

use crate::domain::process_definition::{ActivityId, ProcessDefinition, ProcessId};
use crate::domain::workflow_instance::{ActivityInstanceId, WorkflowInstance, WorkflowInstanceId};
use crate::types::Variables;
use crate::{ActivityError, CoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A stored instance snapshot and the version it was read at
#[derive(Debug, Clone)]
pub struct VersionedInstance {
    /// The snapshot
    pub instance: WorkflowInstance,
    /// Version for optimistic writes
    pub version: u64,
}

/// Versioned durable storage for workflow instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowStateStore: Send + Sync {
    /// Read the latest snapshot
    async fn read(&self, id: &WorkflowInstanceId) -> Result<Option<VersionedInstance>, CoreError>;

    /// Write a snapshot if the stored version still equals `expected_version`
    /// (`None` meaning "not stored yet"); returns the new version or
    /// [`CoreError::VersionConflict`]
    async fn write(&self, instance: &WorkflowInstance, expected_version: Option<u64>) -> Result<u64, CoreError>;
}

/// Lookup of deployed process definitions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessDefinitionRegistry: Send + Sync {
    /// Fetch a definition; fails with [`CoreError::ProcessDefinitionNotFound`]
    async fn get_definition(&self, id: &ProcessId) -> Result<Arc<ProcessDefinition>, CoreError>;
}

/// A waiting message catch or message boundary event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSubscription {
    /// Message name
    pub message_name: String,
    /// Correlation key
    pub correlation_key: String,
    /// Subscribing workflow instance
    pub instance_id: WorkflowInstanceId,
    /// Catch or boundary event definition
    pub activity_id: ActivityId,
    /// Activity instance hosting the subscription
    pub activity_instance_id: ActivityInstanceId,
}

/// Message correlation, keyed by message name and correlation key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageCorrelationRegistry: Send + Sync {
    /// Register a subscription; fails if the key is already taken
    async fn subscribe(&self, subscription: MessageSubscription) -> Result<(), CoreError>;

    /// Remove a subscription if present
    async fn unsubscribe(&self, message_name: &str, correlation_key: &str) -> Result<(), CoreError>;

    /// Remove and return the subscription a message should be delivered to
    async fn take(
        &self,
        message_name: &str,
        correlation_key: &str,
    ) -> Result<Option<MessageSubscription>, CoreError>;
}

/// A waiting signal catch or signal boundary event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSubscription {
    /// Signal name
    pub signal_name: String,
    /// Subscribing workflow instance
    pub instance_id: WorkflowInstanceId,
    /// Catch or boundary event definition
    pub activity_id: ActivityId,
    /// Activity instance hosting the subscription
    pub activity_instance_id: ActivityInstanceId,
}

/// Signal correlation, keyed by signal name
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalCorrelationRegistry: Send + Sync {
    /// Register a subscription
    async fn subscribe(&self, subscription: SignalSubscription) -> Result<(), CoreError>;

    /// Remove the subscription of one activity instance
    async fn unsubscribe(
        &self,
        signal_name: &str,
        instance_id: &WorkflowInstanceId,
        activity_instance_id: &ActivityInstanceId,
    ) -> Result<(), CoreError>;

    /// Remove and return every current subscriber of a signal
    async fn take_all(&self, signal_name: &str) -> Result<Vec<SignalSubscription>, CoreError>;
}

/// A timer to fire for an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRegistration {
    /// Unique timer key
    pub key: String,
    /// Instance the fire is delivered to
    pub instance_id: WorkflowInstanceId,
    /// First fire
    pub due_at: DateTime<Utc>,
    /// Re-fire period until the timer is cancelled
    pub period: Duration,
}

/// A timer fire delivered back to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerFired {
    /// Timer key
    pub key: String,
    /// Target instance
    pub instance_id: WorkflowInstanceId,
}

/// Reminder-style timer infrastructure
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimerScheduler: Send + Sync {
    /// Schedule or replace a timer
    async fn activate(&self, registration: TimerRegistration) -> Result<(), CoreError>;

    /// Cancel a timer; unknown keys are ignored
    async fn cancel(&self, key: &str) -> Result<(), CoreError>;
}

/// Evaluates gateway conditions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate a boolean expression against variables
    async fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool, CoreError>;
}

/// Runs script tasks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run a script; returns the variables to write back
    async fn execute(
        &self,
        script: &str,
        variables: &Variables,
        format: &str,
    ) -> Result<Variables, ActivityError>;
}

/// The collaborators the execution loop calls while processing a trigger
#[derive(Clone)]
pub struct Collaborators {
    /// Instance snapshots
    pub store: Arc<dyn WorkflowStateStore>,
    /// Process definitions
    pub definitions: Arc<dyn ProcessDefinitionRegistry>,
    /// Message subscriptions
    pub messages: Arc<dyn MessageCorrelationRegistry>,
    /// Signal subscriptions
    pub signals: Arc<dyn SignalCorrelationRegistry>,
    /// Timers
    pub timers: Arc<dyn TimerScheduler>,
    /// Script tasks
    pub scripts: Arc<dyn ScriptExecutor>,
}
