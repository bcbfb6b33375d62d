//! Shared fixtures for the Tideflow end-to-end scenarios.
//!
//! Scenarios either drive a [`RuntimeInterface`] (conditions, timers and
//! child workflows are routed asynchronously, so assertions poll the stored
//! snapshot) or call a [`WorkflowExecutionService`] directly when a test needs
//! to observe a single trigger and its effects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio::time::Instant;

use tideflow_core::{
    domain::activity_instance::ActivityState,
    types::variables_from_json,
    ActivityInstanceId, EngineConfig, LoggingEventHandler, ProcessDefinition, RuntimeInterface, Variables,
    WorkflowExecutionService, WorkflowInstance, WorkflowInstanceId, WorkflowStage,
};
use tideflow_monitoring::{logging::init_test_tracing, TracingEventHandler};
use tideflow_state_inmemory::InMemoryStateStoreProvider;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A runtime over in-memory collaborators
pub struct Harness {
    /// Collaborators backing the runtime
    pub provider: InMemoryStateStoreProvider,
    /// The runtime under test
    pub runtime: RuntimeInterface,
    /// Event handler counting lifecycle events
    pub events: Arc<TracingEventHandler>,
}

impl Harness {
    /// Deploy `definitions` and start a runtime with the default config
    pub async fn new(definitions: Vec<ProcessDefinition>) -> Result<Self> {
        Self::with_config(definitions, EngineConfig::default()).await
    }

    /// Deploy `definitions` and start a runtime with `config`
    pub async fn with_config(definitions: Vec<ProcessDefinition>, config: EngineConfig) -> Result<Self> {
        init_test_tracing();
        let mut provider = InMemoryStateStoreProvider::new();
        for definition in definitions {
            provider.deploy(definition).await?;
        }
        let events = Arc::new(TracingEventHandler::new());
        let runtime = provider.create_runtime(config, events.clone())?;
        Ok(Self {
            provider,
            runtime,
            events,
        })
    }

    /// Load a stored instance
    pub async fn instance(&self, id: &WorkflowInstanceId) -> Result<WorkflowInstance> {
        self.runtime
            .get_instance(id)
            .await?
            .ok_or_else(|| anyhow!("instance {} is not stored", id))
    }

    /// Poll the stored snapshot until `predicate` holds
    pub async fn wait_until<F>(&self, id: &WorkflowInstanceId, what: &str, predicate: F) -> Result<WorkflowInstance>
    where
        F: Fn(&WorkflowInstance) -> bool,
    {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(instance) = self.runtime.get_instance(id).await? {
                if predicate(&instance) {
                    return Ok(instance);
                }
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for {} on {}", what, id);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the instance reaches `stage`
    pub async fn wait_for_stage(&self, id: &WorkflowInstanceId, stage: WorkflowStage) -> Result<WorkflowInstance> {
        self.wait_until(id, &format!("stage {:?}", stage), |instance| instance.stage == stage)
            .await
    }

    /// Wait until exactly `count` instances hold a worker
    pub async fn wait_for_workers(&self, count: usize) -> Result<()> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while self.runtime.active_workers() != count {
            if Instant::now() >= deadline {
                bail!(
                    "timed out waiting for {} workers, {} are running",
                    count,
                    self.runtime.active_workers()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Wait until some instance of `activity` is executing and return its id
    pub async fn wait_for_executing(&self, id: &WorkflowInstanceId, activity: &str) -> Result<ActivityInstanceId> {
        let instance = self
            .wait_until(id, activity, |instance| !executing(instance, activity).is_empty())
            .await?;
        executing(&instance, activity)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} stopped executing", activity))
    }
}

/// A bare execution service over `provider`, for single-trigger scenarios
pub fn service(provider: &InMemoryStateStoreProvider) -> WorkflowExecutionService {
    init_test_tracing();
    WorkflowExecutionService::new(
        provider.collaborators(),
        EngineConfig::default(),
        Arc::new(LoggingEventHandler),
    )
}

/// Variables from a JSON object literal
pub fn vars(value: Value) -> Variables {
    variables_from_json(value)
}

/// Value of a root scope variable
pub fn root_variable(instance: &WorkflowInstance, name: &str) -> Option<Value> {
    instance.variable(&instance.root_scope_id, name).cloned()
}

/// Ids of the executing instances of `activity`, oldest first
pub fn executing(instance: &WorkflowInstance, activity: &str) -> Vec<ActivityInstanceId> {
    instance
        .active_entries()
        .filter(|e| e.activity_id.0 == activity && e.activity.is_executing())
        .map(|e| e.id.clone())
        .collect()
}

/// How many instances of `activity` completed normally
pub fn completed_count(instance: &WorkflowInstance, activity: &str) -> usize {
    instance
        .entries
        .iter()
        .filter(|e| e.activity_id.0 == activity && e.activity.is_completed())
        .count()
}

/// Whether some instance of `activity` was cancelled
pub fn was_cancelled(instance: &WorkflowInstance, activity: &str) -> bool {
    instance
        .entries
        .iter()
        .any(|e| e.activity_id.0 == activity && matches!(e.activity.state, ActivityState::Cancelled(_)))
}

/// Whether any instance of `activity` was ever created
pub fn was_reached(instance: &WorkflowInstance, activity: &str) -> bool {
    instance.entries.iter().any(|e| e.activity_id.0 == activity)
}
