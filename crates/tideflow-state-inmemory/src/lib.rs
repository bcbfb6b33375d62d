//! In-memory collaborators for the Tideflow engine
//!
//! This crate provides in-memory implementations of the collaborator
//! interfaces defined in the tideflow-core crate. It is primarily useful for
//! development, testing, and simple deployments where persistence is not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::info;

pub mod repositories;
pub use repositories::{
    InMemoryMessageCorrelationRegistry,
    InMemoryProcessDefinitionRegistry,
    InMemorySignalCorrelationRegistry,
    InMemoryTimerScheduler,
    InMemoryWorkflowStateStore,
    StoredSnapshot,
};

pub mod evaluators;
pub use evaluators::{JmespathConditionEvaluator, JmespathScriptExecutor, JMESPATH_FORMAT};

use tideflow_core::{
    domain::process_definition::ProcessDefinition,
    domain::repository::{Collaborators, TimerFired},
    CoreError, DomainEventHandler, EngineConfig, RuntimeInterface, WorkflowExecutionService,
};

/// Provider wiring every in-memory collaborator together
pub struct InMemoryStateStoreProvider {
    // Shared storage for instance snapshots
    snapshots: Arc<RwLock<HashMap<String, StoredSnapshot>>>,

    // Shared storage for deployed definitions
    definitions: Arc<RwLock<HashMap<String, Arc<ProcessDefinition>>>>,

    messages: Arc<InMemoryMessageCorrelationRegistry>,
    signals: Arc<InMemorySignalCorrelationRegistry>,
    timers: Arc<InMemoryTimerScheduler>,

    // Timer fires, taken by whoever drives the timer processor
    timer_rx: Option<mpsc::Receiver<TimerFired>>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory provider
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);

        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            definitions: Arc::new(RwLock::new(HashMap::new())),
            messages: Arc::new(InMemoryMessageCorrelationRegistry::new()),
            signals: Arc::new(InMemorySignalCorrelationRegistry::new()),
            timers: Arc::new(InMemoryTimerScheduler::new(tx)),
            timer_rx: Some(rx),
        }
    }

    /// The snapshot store
    pub fn store(&self) -> InMemoryWorkflowStateStore {
        InMemoryWorkflowStateStore::new(self.snapshots.clone())
    }

    /// The definition registry
    pub fn definitions(&self) -> InMemoryProcessDefinitionRegistry {
        InMemoryProcessDefinitionRegistry::new(self.definitions.clone())
    }

    /// The message correlation registry
    pub fn messages(&self) -> Arc<InMemoryMessageCorrelationRegistry> {
        self.messages.clone()
    }

    /// The signal correlation registry
    pub fn signals(&self) -> Arc<InMemorySignalCorrelationRegistry> {
        self.signals.clone()
    }

    /// The timer scheduler
    pub fn timers(&self) -> Arc<InMemoryTimerScheduler> {
        self.timers.clone()
    }

    /// Validate and deploy a definition
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
        self.definitions().deploy(definition).await
    }

    /// Collaborators for a [`WorkflowExecutionService`]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: Arc::new(self.store()),
            definitions: Arc::new(self.definitions()),
            messages: self.messages.clone(),
            signals: self.signals.clone(),
            timers: self.timers.clone(),
            scripts: Arc::new(JmespathScriptExecutor::new()),
        }
    }

    /// Take the receiving end of the timer channel
    pub fn take_timer_receiver(&mut self) -> Option<mpsc::Receiver<TimerFired>> {
        self.timer_rx.take()
    }

    /// Build a runtime over these collaborators and start feeding it timer fires
    pub fn create_runtime(
        &mut self,
        config: EngineConfig,
        event_handler: Arc<dyn DomainEventHandler>,
    ) -> Result<RuntimeInterface, CoreError> {
        let receiver = self.take_timer_receiver().ok_or_else(|| {
            CoreError::StateStoreError("Timer processor already started".to_string())
        })?;

        let service = WorkflowExecutionService::new(self.collaborators(), config, event_handler);
        let runtime = RuntimeInterface::new(service, Arc::new(JmespathConditionEvaluator::new()));
        runtime.start_timer_processor(receiver);
        info!("In-memory runtime created");
        Ok(runtime)
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}
