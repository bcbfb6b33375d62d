//! Engine metrics reported through tracing.
//!
//! Each record is an `info` event on the `tideflow::metrics` target so that
//! any subscriber (or log pipeline) can aggregate them.

use tracing::info;

/// Workflow engine metrics
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record a started workflow instance
    pub fn record_workflow_started(instance_id: &str) {
        info!(target: "tideflow::metrics", instance_id, "workflow_started");
    }

    /// Record a finished workflow instance
    pub fn record_workflow_finished(instance_id: &str, success: bool) {
        info!(target: "tideflow::metrics", instance_id, success, "workflow_finished");
    }

    /// Record a finished activity instance
    pub fn record_activity_finished(activity_instance_id: &str, outcome: &str) {
        info!(target: "tideflow::metrics", activity_instance_id, outcome, "activity_finished");
    }
}
