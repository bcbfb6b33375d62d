use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Unique identifier for a process definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub String);

/// Identifier of an activity node within a process definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub String);

/// Identifier of a sequence flow within a process definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceFlowId(pub String);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SequenceFlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        ProcessId(s.to_string())
    }
}

impl From<&str> for ActivityId {
    fn from(s: &str) -> Self {
        ActivityId(s.to_string())
    }
}

impl From<&str> for SequenceFlowId {
    fn from(s: &str) -> Self {
        SequenceFlowId(s.to_string())
    }
}

/// An immutable, validated process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// ID of the process
    pub id: ProcessId,

    /// Human-readable name
    pub name: String,

    /// Deployed version
    pub version: u32,

    /// Root scope holding the top-level activities and flows
    pub scope: ScopeDefinition,

    /// Declared messages
    #[serde(default)]
    pub messages: Vec<MessageDefinition>,

    /// Declared signals
    #[serde(default)]
    pub signals: Vec<SignalDefinition>,
}

/// Activities and flows of the root process or of a sub-process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeDefinition {
    /// Activity nodes of this scope
    pub activities: Vec<ActivityDefinition>,

    /// Sequence flows connecting the activities
    pub flows: Vec<SequenceFlow>,
}

/// A directed edge between two activities of the same scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlow {
    /// ID of the flow
    pub id: SequenceFlowId,

    /// Source activity
    pub source: ActivityId,

    /// Target activity
    pub target: ActivityId,

    /// Optional boolean condition
    #[serde(default)]
    pub condition: Option<String>,

    /// Marks the default flow of an exclusive gateway
    #[serde(default)]
    pub is_default: bool,
}

/// A typed activity node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDefinition {
    /// ID of the activity
    pub id: ActivityId,

    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,

    /// Kind-specific configuration
    pub kind: ActivityKind,
}

/// The closed set of supported activity kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Start event of a scope
    StartEvent,
    /// End event; a terminating end cancels the rest of its scope
    EndEvent {
        /// Whether reaching this event terminates the scope
        terminate: bool,
    },
    /// Task completed by an external caller
    Task,
    /// Task that runs a script through the script executor
    ScriptTask(ScriptTask),
    /// Exclusive (XOR) gateway
    ExclusiveGateway,
    /// Parallel (AND) gateway, fork or join depending on its flows
    ParallelGateway,
    /// Event-based gateway racing its catch-event successors
    EventBasedGateway,
    /// Intermediate timer catch event
    TimerCatch(TimerDefinition),
    /// Intermediate message catch event
    MessageCatch {
        /// Name of the awaited message
        message: String,
    },
    /// Intermediate signal catch event
    SignalCatch {
        /// Name of the awaited signal
        signal: String,
    },
    /// Intermediate signal throw event
    SignalThrow {
        /// Name of the broadcast signal
        signal: String,
    },
    /// Boundary event attached to a host activity
    Boundary(BoundaryEvent),
    /// Embedded sub-process owning its own scope
    SubProcess(ScopeDefinition),
    /// Call activity starting a child workflow
    CallActivity(CallActivity),
    /// Multi-instance wrapper around an inner activity
    MultiInstance(MultiInstance),
}

/// Script task configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTask {
    /// Script source
    pub script: String,
    /// Script language or format understood by the executor
    pub format: String,
}

/// Boundary event configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryEvent {
    /// Host activity in the same scope
    pub attached_to: ActivityId,
    /// Whether firing cancels the host
    pub cancel_activity: bool,
    /// What fires the boundary
    pub trigger: BoundaryTrigger,
}

/// Trigger of a boundary event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundaryTrigger {
    /// Timer boundary
    Timer(TimerDefinition),
    /// Message boundary
    Message(String),
    /// Signal boundary
    Signal(String),
    /// Error boundary; `None` catches every error code
    Error(Option<String>),
}

/// When a timer becomes due
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerDefinition {
    /// Relative to the moment the timer is registered
    Duration(Duration),
    /// Absolute instant
    Date(DateTime<Utc>),
}

/// Call activity configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallActivity {
    /// Process started as the child workflow
    pub process_id: ProcessId,
    /// Parent to child variable mapping
    #[serde(default)]
    pub inputs: Vec<VariableMapping>,
    /// Child to parent variable mapping
    #[serde(default)]
    pub outputs: Vec<VariableMapping>,
    /// Copy every visible parent variable into the child
    #[serde(default)]
    pub propagate_all_inputs: bool,
    /// Copy every child root variable back into the parent
    #[serde(default)]
    pub propagate_all_outputs: bool,
}

/// A source to target variable copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMapping {
    /// Variable read on the source side
    pub source: String,
    /// Variable written on the target side
    pub target: String,
}

/// Multi-instance wrapper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstance {
    /// Activity run once per iteration
    pub inner: Box<ActivityDefinition>,
    /// Run iterations one after another instead of all at once
    pub sequential: bool,
    /// Variable holding the input collection, or an iteration count
    pub collection: String,
    /// Variable receiving the current element in each iteration scope
    #[serde(default)]
    pub element_variable: Option<String>,
    /// Variable read from each iteration scope when it completes
    #[serde(default)]
    pub output_element: Option<String>,
    /// Variable receiving the ordered outputs on the wrapper's scope
    #[serde(default)]
    pub output_collection: Option<String>,
}

/// A declared message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDefinition {
    /// Message name
    pub name: String,
    /// JMESPath expression producing the correlation key
    #[serde(default)]
    pub correlation_key: Option<String>,
}

/// A declared signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
}

/// Role of a parallel gateway derived from its flow counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayDirection {
    /// One incoming flow (or none), any number of outgoing flows
    Fork,
    /// Several incoming flows merging into one outgoing flow
    Join,
}

impl ProcessDefinition {
    /// Create a definition around a root scope
    pub fn new(id: impl Into<String>, name: impl Into<String>, scope: ScopeDefinition) -> Self {
        Self {
            id: ProcessId(id.into()),
            name: name.into(),
            version: 1,
            scope,
            messages: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Declare a message
    pub fn with_message(mut self, message: MessageDefinition) -> Self {
        self.messages.push(message);
        self
    }

    /// Declare a signal
    pub fn with_signal(mut self, name: impl Into<String>) -> Self {
        self.signals.push(SignalDefinition { name: name.into() });
        self
    }

    /// Look up a message declaration
    pub fn message(&self, name: &str) -> Option<&MessageDefinition> {
        self.messages.iter().find(|m| m.name == name)
    }

    /// Validate the definition structure
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut activity_ids = HashSet::new();
        let mut flow_ids = HashSet::new();
        validate_scope(&self.scope, &mut activity_ids, &mut flow_ids)
    }
}

fn validate_scope<'a>(
    scope: &'a ScopeDefinition,
    activity_ids: &mut HashSet<&'a ActivityId>,
    flow_ids: &mut HashSet<&'a SequenceFlowId>,
) -> Result<(), CoreError> {
    let starts = scope
        .activities
        .iter()
        .filter(|a| matches!(a.kind, ActivityKind::StartEvent))
        .count();
    if starts != 1 {
        return Err(CoreError::ValidationError(format!(
            "Scope must have exactly one start event, found {}",
            starts
        )));
    }

    for activity in &scope.activities {
        if !activity_ids.insert(&activity.id) {
            return Err(CoreError::ValidationError(format!(
                "Duplicate activity ID: {}",
                activity.id
            )));
        }
    }

    for flow in &scope.flows {
        if !flow_ids.insert(&flow.id) {
            return Err(CoreError::ValidationError(format!(
                "Duplicate sequence flow ID: {}",
                flow.id
            )));
        }
        let source = scope.activity(&flow.source).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Flow {} references unknown source: {}",
                flow.id, flow.source
            ))
        })?;
        let target = scope.activity(&flow.target).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Flow {} references unknown target: {}",
                flow.id, flow.target
            ))
        })?;
        if matches!(target.kind, ActivityKind::Boundary(_) | ActivityKind::StartEvent) {
            return Err(CoreError::ValidationError(format!(
                "Flow {} cannot target {}",
                flow.id, flow.target
            )));
        }
        let from_exclusive = matches!(source.kind, ActivityKind::ExclusiveGateway);
        if (flow.condition.is_some() || flow.is_default) && !from_exclusive {
            return Err(CoreError::ValidationError(format!(
                "Flow {} has a condition or default marker but does not leave an exclusive gateway",
                flow.id
            )));
        }
        if flow.is_default && flow.condition.is_some() {
            return Err(CoreError::ValidationError(format!(
                "Default flow {} cannot carry a condition",
                flow.id
            )));
        }
    }

    for activity in &scope.activities {
        match &activity.kind {
            ActivityKind::ExclusiveGateway => {
                let defaults = scope
                    .outgoing(&activity.id)
                    .iter()
                    .filter(|f| f.is_default)
                    .count();
                if defaults > 1 {
                    return Err(CoreError::ValidationError(format!(
                        "Exclusive gateway {} has more than one default flow",
                        activity.id
                    )));
                }
            }
            ActivityKind::ParallelGateway => {
                scope
                    .gateway_direction(&activity.id)
                    .map_err(|e| CoreError::ValidationError(e.to_string()))?;
            }
            ActivityKind::Boundary(boundary) => {
                let host = scope.activity(&boundary.attached_to).ok_or_else(|| {
                    CoreError::ValidationError(format!(
                        "Boundary event {} is attached to unknown activity {}",
                        activity.id, boundary.attached_to
                    ))
                })?;
                if matches!(
                    host.kind,
                    ActivityKind::Boundary(_) | ActivityKind::StartEvent | ActivityKind::EndEvent { .. }
                ) {
                    return Err(CoreError::ValidationError(format!(
                        "Boundary event {} cannot attach to {}",
                        activity.id, host.id
                    )));
                }
                if matches!(boundary.trigger, BoundaryTrigger::Error(_)) && !boundary.cancel_activity {
                    return Err(CoreError::ValidationError(format!(
                        "Error boundary event {} must be interrupting",
                        activity.id
                    )));
                }
            }
            ActivityKind::SubProcess(inner) => validate_scope(inner, activity_ids, flow_ids)?,
            ActivityKind::MultiInstance(mi) => {
                if !activity_ids.insert(&mi.inner.id) {
                    return Err(CoreError::ValidationError(format!(
                        "Duplicate activity ID: {}",
                        mi.inner.id
                    )));
                }
                match &mi.inner.kind {
                    ActivityKind::Task
                    | ActivityKind::ScriptTask(_)
                    | ActivityKind::CallActivity(_) => {}
                    ActivityKind::SubProcess(inner) => {
                        validate_scope(inner, activity_ids, flow_ids)?
                    }
                    _ => {
                        return Err(CoreError::ValidationError(format!(
                            "Multi-instance {} wraps an unsupported activity kind",
                            activity.id
                        )))
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

impl ScopeDefinition {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an activity
    pub fn with_activity(mut self, activity: ActivityDefinition) -> Self {
        self.activities.push(activity);
        self
    }

    /// Add a sequence flow
    pub fn with_flow(mut self, flow: SequenceFlow) -> Self {
        self.flows.push(flow);
        self
    }

    /// Look up an activity of this scope
    pub fn activity(&self, id: &ActivityId) -> Option<&ActivityDefinition> {
        self.activities.iter().find(|a| &a.id == id)
    }

    /// The scope's start event
    pub fn start_event(&self) -> Option<&ActivityDefinition> {
        self.activities
            .iter()
            .find(|a| matches!(a.kind, ActivityKind::StartEvent))
    }

    /// Flows leaving an activity, in definition order
    pub fn outgoing(&self, id: &ActivityId) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| &f.source == id).collect()
    }

    /// Flows entering an activity, in definition order
    pub fn incoming(&self, id: &ActivityId) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| &f.target == id).collect()
    }

    /// Boundary events attached to a host activity
    pub fn boundaries_of(&self, host: &ActivityId) -> Vec<(&ActivityDefinition, &BoundaryEvent)> {
        self.activities
            .iter()
            .filter_map(|a| match &a.kind {
                ActivityKind::Boundary(b) if &b.attached_to == host => Some((a, b)),
                _ => None,
            })
            .collect()
    }

    /// First error boundary on `host` matching `code`.
    ///
    /// An exact code match wins over a catch-all boundary.
    pub fn error_boundary_for(&self, host: &ActivityId, code: &str) -> Option<&ActivityDefinition> {
        let candidates: Vec<_> = self
            .boundaries_of(host)
            .into_iter()
            .filter_map(|(a, b)| match &b.trigger {
                BoundaryTrigger::Error(c) => Some((a, c)),
                _ => None,
            })
            .collect();
        candidates
            .iter()
            .find(|(_, c)| c.as_deref() == Some(code))
            .or_else(|| candidates.iter().find(|(_, c)| c.is_none()))
            .map(|(a, _)| *a)
    }

    /// Classify a parallel gateway from its flow counts
    pub fn gateway_direction(&self, id: &ActivityId) -> Result<GatewayDirection, CoreError> {
        let incoming = self.incoming(id).len();
        let outgoing = self.outgoing(id).len();
        if incoming <= 1 {
            Ok(GatewayDirection::Fork)
        } else if outgoing <= 1 {
            Ok(GatewayDirection::Join)
        } else {
            Err(CoreError::ConfigurationError(format!(
                "Parallel gateway {} is mixed ({} incoming, {} outgoing)",
                id, incoming, outgoing
            )))
        }
    }
}

impl SequenceFlow {
    /// Create an unconditional flow
    pub fn new(id: &str, source: &str, target: &str) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            is_default: false,
        }
    }

    /// Attach a condition expression
    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    /// Mark as the default flow of its gateway
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

impl ActivityDefinition {
    /// Create an activity of the given kind
    pub fn new(id: &str, kind: ActivityKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Start event
    pub fn start_event(id: &str) -> Self {
        Self::new(id, ActivityKind::StartEvent)
    }

    /// Plain end event
    pub fn end_event(id: &str) -> Self {
        Self::new(id, ActivityKind::EndEvent { terminate: false })
    }

    /// Terminating end event
    pub fn terminate_end_event(id: &str) -> Self {
        Self::new(id, ActivityKind::EndEvent { terminate: true })
    }

    /// Externally completed task
    pub fn task(id: &str) -> Self {
        Self::new(id, ActivityKind::Task)
    }

    /// Script task
    pub fn script_task(id: &str, script: &str, format: &str) -> Self {
        Self::new(
            id,
            ActivityKind::ScriptTask(ScriptTask {
                script: script.to_string(),
                format: format.to_string(),
            }),
        )
    }

    /// Exclusive gateway
    pub fn exclusive_gateway(id: &str) -> Self {
        Self::new(id, ActivityKind::ExclusiveGateway)
    }

    /// Parallel gateway
    pub fn parallel_gateway(id: &str) -> Self {
        Self::new(id, ActivityKind::ParallelGateway)
    }

    /// Event-based gateway
    pub fn event_based_gateway(id: &str) -> Self {
        Self::new(id, ActivityKind::EventBasedGateway)
    }

    /// Timer catch event
    pub fn timer_catch(id: &str, timer: TimerDefinition) -> Self {
        Self::new(id, ActivityKind::TimerCatch(timer))
    }

    /// Message catch event
    pub fn message_catch(id: &str, message: &str) -> Self {
        Self::new(
            id,
            ActivityKind::MessageCatch {
                message: message.to_string(),
            },
        )
    }

    /// Signal catch event
    pub fn signal_catch(id: &str, signal: &str) -> Self {
        Self::new(
            id,
            ActivityKind::SignalCatch {
                signal: signal.to_string(),
            },
        )
    }

    /// Signal throw event
    pub fn signal_throw(id: &str, signal: &str) -> Self {
        Self::new(
            id,
            ActivityKind::SignalThrow {
                signal: signal.to_string(),
            },
        )
    }

    /// Interrupting boundary event
    pub fn boundary(id: &str, attached_to: &str, trigger: BoundaryTrigger) -> Self {
        Self::new(
            id,
            ActivityKind::Boundary(BoundaryEvent {
                attached_to: attached_to.into(),
                cancel_activity: true,
                trigger,
            }),
        )
    }

    /// Make a boundary event non-interrupting; no effect on other kinds
    pub fn non_interrupting(mut self) -> Self {
        if let ActivityKind::Boundary(b) = &mut self.kind {
            b.cancel_activity = false;
        }
        self
    }

    /// Embedded sub-process
    pub fn sub_process(id: &str, scope: ScopeDefinition) -> Self {
        Self::new(id, ActivityKind::SubProcess(scope))
    }

    /// Call activity
    pub fn call_activity(id: &str, call: CallActivity) -> Self {
        Self::new(id, ActivityKind::CallActivity(call))
    }

    /// Multi-instance wrapper
    pub fn multi_instance(id: &str, config: MultiInstance) -> Self {
        Self::new(id, ActivityKind::MultiInstance(config))
    }
}

impl CallActivity {
    /// Call a process without variable mapping
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            propagate_all_inputs: false,
            propagate_all_outputs: false,
        }
    }

    /// Map a parent variable into the child
    pub fn with_input(mut self, source: &str, target: &str) -> Self {
        self.inputs.push(VariableMapping {
            source: source.to_string(),
            target: target.to_string(),
        });
        self
    }

    /// Map a child variable back into the parent
    pub fn with_output(mut self, source: &str, target: &str) -> Self {
        self.outputs.push(VariableMapping {
            source: source.to_string(),
            target: target.to_string(),
        });
        self
    }
}

impl MultiInstance {
    /// Wrap an inner activity, iterating over `collection`
    pub fn new(inner: ActivityDefinition, collection: &str, sequential: bool) -> Self {
        Self {
            inner: Box::new(inner),
            sequential,
            collection: collection.to_string(),
            element_variable: None,
            output_element: None,
            output_collection: None,
        }
    }

    /// Expose each element under `name` in its iteration scope
    pub fn with_element_variable(mut self, name: &str) -> Self {
        self.element_variable = Some(name.to_string());
        self
    }

    /// Collect `element` from every iteration into `collection`
    pub fn with_output(mut self, element: &str, collection: &str) -> Self {
        self.output_element = Some(element.to_string());
        self.output_collection = Some(collection.to_string());
        self
    }
}

impl TimerDefinition {
    /// Parse an ISO-8601 duration (`PT1H`) or an RFC 3339 date
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        if text.starts_with('P') {
            parse_iso8601_duration(text).map(TimerDefinition::Duration)
        } else {
            DateTime::parse_from_rfc3339(text)
                .map(|d| TimerDefinition::Date(d.with_timezone(&Utc)))
                .map_err(|e| CoreError::ValidationError(format!("Invalid timer date {}: {}", text, e)))
        }
    }

    /// Instant at which the timer becomes due when registered at `now`
    pub fn due_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
        match self {
            TimerDefinition::Duration(d) => {
                let delta = chrono::Duration::from_std(*d)
                    .map_err(|e| CoreError::TimerError(format!("Timer duration out of range: {}", e)))?;
                Ok(now + delta)
            }
            TimerDefinition::Date(date) => Ok(*date),
        }
    }
}

fn parse_iso8601_duration(text: &str) -> Result<Duration, CoreError> {
    let invalid = || CoreError::ValidationError(format!("Invalid ISO-8601 duration: {}", text));
    let rest = text.strip_prefix('P').ok_or_else(invalid)?;

    let mut seconds = 0f64;
    let mut in_time = false;
    let mut number = String::new();
    let mut components = 0;
    for c in rest.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                let value: f64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let factor = match (in_time, unit) {
                    (false, 'W') => 604_800.0,
                    (false, 'D') => 86_400.0,
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(invalid()),
                };
                seconds += value * factor;
                components += 1;
            }
        }
    }
    if !number.is_empty() || components == 0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}
