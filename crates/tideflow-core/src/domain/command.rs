use crate::domain::process_definition::{ActivityId, ProcessId, SequenceFlowId, TimerDefinition, VariableMapping};
use crate::ActivityError;
use serde_json::Value;

/// Boundary event an external registration fires, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBinding {
    /// Boundary event to follow; `None` when the activity itself is the catch event
    pub boundary: Option<ActivityId>,
    /// Whether firing cancels the host activity
    pub cancel_activity: bool,
}

impl EventBinding {
    /// Binding for an intermediate catch event
    pub fn catch_event() -> Self {
        Self {
            boundary: None,
            cancel_activity: false,
        }
    }

    /// Binding for a boundary event
    pub fn boundary(id: ActivityId, cancel_activity: bool) -> Self {
        Self {
            boundary: Some(id),
            cancel_activity,
        }
    }
}

/// Intent emitted by activity decision logic and applied by the execution loop.
///
/// Commands always target the activity instance whose decision produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionCommand {
    /// Complete the activity
    CompleteActivity,
    /// Fail the activity with a domain error
    FailActivity(ActivityError),
    /// Cancel every other active entry in the activity's scope tree
    CompleteWorkflow,
    /// Open the sub-process scope and seed its start event
    OpenScope,
    /// Spawn multi-instance iterations over `elements`
    SpawnIterations {
        /// One element per iteration
        elements: Vec<Value>,
        /// Spawn one iteration at a time
        sequential: bool,
    },
    /// Register a timer
    RegisterTimer {
        /// When the timer fires
        timer: TimerDefinition,
        /// What firing resumes
        binding: EventBinding,
    },
    /// Subscribe to a message
    RegisterMessage {
        /// Message name
        message: String,
        /// What delivery resumes
        binding: EventBinding,
    },
    /// Subscribe to a signal
    RegisterSignal {
        /// Signal name
        signal: String,
        /// What delivery resumes
        binding: EventBinding,
    },
    /// Start a child workflow
    StartChildWorkflow {
        /// Process to start
        process_id: ProcessId,
        /// Parent to child variable mapping
        inputs: Vec<VariableMapping>,
        /// Copy every visible variable
        propagate_all: bool,
    },
    /// Register pending condition rows
    AddConditions {
        /// Conditional outgoing flows in definition order
        flows: Vec<SequenceFlowId>,
    },
    /// Request asynchronous evaluation of one condition row
    EvaluateCondition {
        /// Flow whose condition is evaluated
        flow_id: SequenceFlowId,
        /// Condition expression
        expression: String,
    },
    /// Run a script and merge its variables
    ExecuteScript {
        /// Script source
        script: String,
        /// Script format
        format: String,
    },
    /// Broadcast a signal
    ThrowSignal {
        /// Signal name
        signal: String,
    },
}
