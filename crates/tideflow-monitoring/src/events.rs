//! Domain event handler that turns engine events into logs and metrics.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use tideflow_core::{domain::events::DomainEvent, CoreError, DomainEventHandler};

use crate::metrics::EngineMetrics;

/// Counts of workflow lifecycle events seen by a [`TracingEventHandler`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowCounts {
    /// Started instances
    pub started: u64,
    /// Completed instances
    pub completed: u64,
    /// Failed instances
    pub failed: u64,
}

/// Logs every domain event and reports lifecycle metrics
#[derive(Debug, Default)]
pub struct TracingEventHandler {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl TracingEventHandler {
    /// Create a new handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifecycle counts so far
    pub fn counts(&self) -> WorkflowCounts {
        WorkflowCounts {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DomainEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        let instance_id = event.workflow_instance_id();
        match event.event_type() {
            "workflow.started" => {
                self.started.fetch_add(1, Ordering::Relaxed);
                EngineMetrics::record_workflow_started(&instance_id.0);
            }
            "workflow.completed" => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                EngineMetrics::record_workflow_finished(&instance_id.0, true);
            }
            "workflow.failed" => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(instance_id = %instance_id, "Workflow failed");
                EngineMetrics::record_workflow_finished(&instance_id.0, false);
            }
            "activity.completed" | "activity.failed" | "activity.cancelled" => {
                let outcome = event.event_type().trim_start_matches("activity.");
                if let Some(activity_instance_id) = event.activity_instance_id() {
                    EngineMetrics::record_activity_finished(&activity_instance_id.0, outcome);
                }
            }
            event_type => {
                debug!(
                    instance_id = %instance_id,
                    activity_instance_id = ?event.activity_instance_id().map(|id| id.0.as_str()),
                    event_type,
                    timestamp = %event.timestamp(),
                    "Domain event"
                );
            }
        }
        Ok(())
    }
}
