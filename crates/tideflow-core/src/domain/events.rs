use crate::domain::process_definition::{ActivityId, ProcessId};
use crate::domain::workflow_instance::{ActivityInstanceId, WorkflowInstanceId};
use crate::ActivityError;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the workflow instance ID this event is associated with
    fn workflow_instance_id(&self) -> &WorkflowInstanceId;

    /// Returns the activity instance ID, for activity-level events
    fn activity_instance_id(&self) -> Option<&ActivityInstanceId> {
        None
    }

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Event: Workflow instance started
#[derive(Debug)]
pub struct WorkflowStarted {
    /// The workflow instance
    pub workflow_instance_id: WorkflowInstanceId,

    /// The process being executed
    pub process_id: ProcessId,

    /// When the instance started
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for WorkflowStarted {
    fn event_type(&self) -> &'static str {
        "workflow.started"
    }

    fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Activity instance started executing
#[derive(Debug)]
pub struct ActivityStarted {
    /// The workflow instance
    pub workflow_instance_id: WorkflowInstanceId,

    /// The activity definition
    pub activity_id: ActivityId,

    /// The activity instance
    pub activity_instance_id: ActivityInstanceId,

    /// When execution started
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ActivityStarted {
    fn event_type(&self) -> &'static str {
        "activity.started"
    }

    fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    fn activity_instance_id(&self) -> Option<&ActivityInstanceId> {
        Some(&self.activity_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Activity instance completed and transitioned
#[derive(Debug)]
pub struct ActivityCompleted {
    /// The workflow instance
    pub workflow_instance_id: WorkflowInstanceId,

    /// The activity definition
    pub activity_id: ActivityId,

    /// The activity instance
    pub activity_instance_id: ActivityInstanceId,

    /// When the activity completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ActivityCompleted {
    fn event_type(&self) -> &'static str {
        "activity.completed"
    }

    fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    fn activity_instance_id(&self) -> Option<&ActivityInstanceId> {
        Some(&self.activity_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Activity instance failed
#[derive(Debug)]
pub struct ActivityFailed {
    /// The workflow instance
    pub workflow_instance_id: WorkflowInstanceId,

    /// The activity definition
    pub activity_id: ActivityId,

    /// The activity instance
    pub activity_instance_id: ActivityInstanceId,

    /// The failure
    pub error: ActivityError,

    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ActivityFailed {
    fn event_type(&self) -> &'static str {
        "activity.failed"
    }

    fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    fn activity_instance_id(&self) -> Option<&ActivityInstanceId> {
        Some(&self.activity_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Activity instance cancelled
#[derive(Debug)]
pub struct ActivityCancelled {
    /// The workflow instance
    pub workflow_instance_id: WorkflowInstanceId,

    /// The activity definition
    pub activity_id: ActivityId,

    /// The activity instance
    pub activity_instance_id: ActivityInstanceId,

    /// Why the activity was cancelled
    pub reason: String,

    /// When the activity was cancelled
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ActivityCancelled {
    fn event_type(&self) -> &'static str {
        "activity.cancelled"
    }

    fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    fn activity_instance_id(&self) -> Option<&ActivityInstanceId> {
        Some(&self.activity_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Workflow instance completed
#[derive(Debug)]
pub struct WorkflowCompleted {
    /// The workflow instance
    pub workflow_instance_id: WorkflowInstanceId,

    /// When the instance completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for WorkflowCompleted {
    fn event_type(&self) -> &'static str {
        "workflow.completed"
    }

    fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Workflow instance ended with an unhandled failure
#[derive(Debug)]
pub struct WorkflowFailed {
    /// The workflow instance
    pub workflow_instance_id: WorkflowInstanceId,

    /// The unhandled failure
    pub error: ActivityError,

    /// When the instance failed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for WorkflowFailed {
    fn event_type(&self) -> &'static str {
        "workflow.failed"
    }

    fn workflow_instance_id(&self) -> &WorkflowInstanceId {
        &self.workflow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
