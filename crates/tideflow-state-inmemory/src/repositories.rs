use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tideflow_core::{
    CoreError,
    domain::process_definition::{ProcessDefinition, ProcessId},
    domain::repository::{
        MessageCorrelationRegistry, MessageSubscription, ProcessDefinitionRegistry,
        SignalCorrelationRegistry, SignalSubscription, TimerFired, TimerRegistration,
        TimerScheduler, VersionedInstance, WorkflowStateStore,
    },
    domain::workflow_instance::{ActivityInstanceId, WorkflowInstance, WorkflowInstanceId},
};

/// A serialized instance snapshot and its version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// Incremented on every write
    pub version: u64,
    /// JSON text of the instance
    pub snapshot: String,
}

/// In-memory implementation of the WorkflowStateStore.
///
/// Instances are kept as JSON text so that every read goes through the same
/// serialization a durable store would use.
pub struct InMemoryWorkflowStateStore {
    snapshots: Arc<RwLock<HashMap<String, StoredSnapshot>>>,
}

impl InMemoryWorkflowStateStore {
    /// Create a new in-memory state store
    pub fn new(snapshots: Arc<RwLock<HashMap<String, StoredSnapshot>>>) -> Self {
        Self { snapshots }
    }

    /// Serialize every stored snapshot
    pub async fn export(&self) -> Result<String, CoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(serde_json::to_string(&*snapshots)?)
    }

    /// Replace the stored snapshots with an export
    pub async fn import(&self, data: &str) -> Result<(), CoreError> {
        let imported: HashMap<String, StoredSnapshot> = serde_json::from_str(data)?;
        let mut snapshots = self.snapshots.write().await;
        info!(instances = imported.len(), "Importing workflow snapshots");
        *snapshots = imported;
        Ok(())
    }

    /// Ids of every stored instance
    pub async fn instance_ids(&self) -> Vec<WorkflowInstanceId> {
        let snapshots = self.snapshots.read().await;
        snapshots.keys().map(|id| WorkflowInstanceId(id.clone())).collect()
    }
}

#[async_trait]
impl WorkflowStateStore for InMemoryWorkflowStateStore {
    async fn read(&self, id: &WorkflowInstanceId) -> Result<Option<VersionedInstance>, CoreError> {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(&id.0) {
            Some(stored) => {
                let instance: WorkflowInstance = serde_json::from_str(&stored.snapshot)?;
                Ok(Some(VersionedInstance {
                    instance,
                    version: stored.version,
                }))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, instance: &WorkflowInstance, expected_version: Option<u64>) -> Result<u64, CoreError> {
        let snapshot = serde_json::to_string(instance)?;
        let mut snapshots = self.snapshots.write().await;

        let current = snapshots.get(&instance.id.0).map(|s| s.version);
        if current != expected_version {
            warn!(
                instance_id = %instance.id,
                expected = ?expected_version,
                actual = ?current,
                "Rejected stale snapshot write"
            );
            return Err(CoreError::VersionConflict {
                instance_id: instance.id.0.clone(),
                expected: expected_version,
                actual: current,
            });
        }

        let version = current.map_or(1, |v| v + 1);
        snapshots.insert(instance.id.0.clone(), StoredSnapshot { version, snapshot });
        debug!(instance_id = %instance.id, version, "Snapshot written");
        Ok(version)
    }
}

/// In-memory implementation of the ProcessDefinitionRegistry
pub struct InMemoryProcessDefinitionRegistry {
    definitions: Arc<RwLock<HashMap<String, Arc<ProcessDefinition>>>>,
}

impl InMemoryProcessDefinitionRegistry {
    /// Create a new in-memory definition registry
    pub fn new(definitions: Arc<RwLock<HashMap<String, Arc<ProcessDefinition>>>>) -> Self {
        Self { definitions }
    }

    /// Validate and deploy a definition, replacing any previous version
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
        definition.validate()?;
        let mut definitions = self.definitions.write().await;
        info!(process_id = %definition.id, version = %definition.version, "Deploying process definition");
        definitions.insert(definition.id.0.clone(), Arc::new(definition));
        Ok(())
    }

    /// Remove a definition
    pub async fn undeploy(&self, id: &ProcessId) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        definitions
            .remove(&id.0)
            .map(|_| ())
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(id.0.clone()))
    }

    /// Ids of every deployed definition
    pub async fn list_definitions(&self) -> Vec<ProcessId> {
        let definitions = self.definitions.read().await;
        definitions.keys().map(|key| ProcessId(key.clone())).collect()
    }
}

#[async_trait]
impl ProcessDefinitionRegistry for InMemoryProcessDefinitionRegistry {
    async fn get_definition(&self, id: &ProcessId) -> Result<Arc<ProcessDefinition>, CoreError> {
        let definitions = self.definitions.read().await;
        definitions
            .get(&id.0)
            .cloned()
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(id.0.clone()))
    }
}

/// In-memory implementation of the MessageCorrelationRegistry
#[derive(Default)]
pub struct InMemoryMessageCorrelationRegistry {
    subscriptions: DashMap<(String, String), MessageSubscription>,
}

impl InMemoryMessageCorrelationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of waiting subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no subscription is waiting
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[async_trait]
impl MessageCorrelationRegistry for InMemoryMessageCorrelationRegistry {
    async fn subscribe(&self, subscription: MessageSubscription) -> Result<(), CoreError> {
        let key = (subscription.message_name.clone(), subscription.correlation_key.clone());
        match self.subscriptions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(CoreError::CorrelationError(format!(
                "Message '{}' with key '{}' is already awaited by {}",
                subscription.message_name,
                subscription.correlation_key,
                existing.get().instance_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(subscription);
                Ok(())
            }
        }
    }

    async fn unsubscribe(&self, message_name: &str, correlation_key: &str) -> Result<(), CoreError> {
        self.subscriptions
            .remove(&(message_name.to_string(), correlation_key.to_string()));
        Ok(())
    }

    async fn take(
        &self,
        message_name: &str,
        correlation_key: &str,
    ) -> Result<Option<MessageSubscription>, CoreError> {
        Ok(self
            .subscriptions
            .remove(&(message_name.to_string(), correlation_key.to_string()))
            .map(|(_, subscription)| subscription))
    }
}

/// In-memory implementation of the SignalCorrelationRegistry
#[derive(Default)]
pub struct InMemorySignalCorrelationRegistry {
    subscriptions: DashMap<String, Vec<SignalSubscription>>,
}

impl InMemorySignalCorrelationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscribers of a signal
    pub fn subscriber_count(&self, signal_name: &str) -> usize {
        self.subscriptions
            .get(signal_name)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalCorrelationRegistry for InMemorySignalCorrelationRegistry {
    async fn subscribe(&self, subscription: SignalSubscription) -> Result<(), CoreError> {
        self.subscriptions
            .entry(subscription.signal_name.clone())
            .or_default()
            .push(subscription);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        signal_name: &str,
        instance_id: &WorkflowInstanceId,
        activity_instance_id: &ActivityInstanceId,
    ) -> Result<(), CoreError> {
        if let Some(mut subscribers) = self.subscriptions.get_mut(signal_name) {
            subscribers.retain(|s| !(&s.instance_id == instance_id && &s.activity_instance_id == activity_instance_id));
        }
        Ok(())
    }

    async fn take_all(&self, signal_name: &str) -> Result<Vec<SignalSubscription>, CoreError> {
        Ok(self
            .subscriptions
            .remove(signal_name)
            .map(|(_, subscribers)| subscribers)
            .unwrap_or_default())
    }
}

/// In-memory implementation of the TimerScheduler.
///
/// Every timer is a tokio task that sends a [`TimerFired`] when due and then
/// again every period until it is cancelled, so a fire lost before it was
/// processed is repeated.
pub struct InMemoryTimerScheduler {
    timer_tx: Sender<TimerFired>,
    timers: Arc<DashMap<String, JoinHandle<()>>>,
}

impl InMemoryTimerScheduler {
    /// Create a new in-memory timer scheduler sending fires into `timer_tx`
    pub fn new(timer_tx: Sender<TimerFired>) -> Self {
        Self {
            timer_tx,
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Keys of the timers still scheduled
    pub fn active_timers(&self) -> Vec<String> {
        self.timers.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl TimerScheduler for InMemoryTimerScheduler {
    async fn activate(&self, registration: TimerRegistration) -> Result<(), CoreError> {
        let delay = (registration.due_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let period = registration.period;
        let timer_tx = self.timer_tx.clone();
        let fired = TimerFired {
            key: registration.key.clone(),
            instance_id: registration.instance_id.clone(),
        };

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                if let Err(e) = timer_tx.send(fired.clone()).await {
                    warn!(key = %fired.key, error = %e, "Failed to send timer fire");
                    break;
                }
                tokio::time::sleep(period).await;
            }
        });

        debug!(key = %registration.key, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        if let Some(previous) = self.timers.insert(registration.key, handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn cancel(&self, key: &str) -> Result<(), CoreError> {
        if let Some((_, handle)) = self.timers.remove(key) {
            handle.abort();
            debug!(key, "Timer cancelled");
        }
        Ok(())
    }
}
