use crate::domain::activity_instance::ActivityInstance;
use crate::domain::events::{DomainEvent, WorkflowCompleted, WorkflowFailed, WorkflowStarted};
use crate::domain::process_definition::{ActivityId, ProcessId, SequenceFlowId};
use crate::types::Variables;
use crate::{ActivityError, CoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowInstanceId(pub String);

/// Identifier of an activity instance, unique within its workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityInstanceId(pub String);

/// Identifier of a variable scope, unique within its workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableScopeId(pub String);

impl WorkflowInstanceId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        WorkflowInstanceId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ActivityInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for VariableScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowInstanceId {
    fn from(s: &str) -> Self {
        WorkflowInstanceId(s.to_string())
    }
}

impl From<&str> for ActivityInstanceId {
    fn from(s: &str) -> Self {
        ActivityInstanceId(s.to_string())
    }
}

/// Lifecycle stage of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStage {
    /// Created but not started
    NotStarted,
    /// Has active work
    Running,
    /// All work finished normally
    Completed,
    /// All work finished and an unhandled failure was recorded
    Failed,
}

impl WorkflowStage {
    /// Completed or failed
    pub fn is_finished(&self) -> bool {
        matches!(self, WorkflowStage::Completed | WorkflowStage::Failed)
    }
}

/// Link from a child workflow to the call activity that started it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// Parent workflow instance
    pub instance_id: WorkflowInstanceId,
    /// Call activity instance awaiting the child
    pub activity_instance_id: ActivityInstanceId,
    /// Call activity definition
    pub activity_id: ActivityId,
}

/// Iteration bookkeeping of a multi-instance wrapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceState {
    /// Elements iterated over, one per iteration
    pub elements: Vec<Value>,
    /// Iterations spawned so far
    pub spawned: usize,
    /// Iterations finished so far
    pub finished: usize,
    /// Output element collected per iteration index
    #[serde(default)]
    pub outputs: BTreeMap<usize, Value>,
}

impl MultiInstanceState {
    /// Total number of iterations
    pub fn total(&self) -> usize {
        self.elements.len()
    }
}

/// One activity occurrence tracked by the workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInstanceEntry {
    /// Activity instance id
    pub id: ActivityInstanceId,

    /// Activity definition id
    pub activity_id: ActivityId,

    /// Owning sub-process or multi-instance entry; `None` for the root scope
    pub scope_id: Option<ActivityInstanceId>,

    /// Child workflow started by a call activity
    #[serde(default)]
    pub child_workflow_id: Option<WorkflowInstanceId>,

    /// Logically removed; the entry no longer takes part in execution
    pub completed: bool,

    /// Lifecycle state
    pub activity: ActivityInstance,

    /// Incoming flows that have delivered a token to a join gateway
    #[serde(default)]
    pub arrived_flows: Vec<SequenceFlowId>,

    /// Event-based gateway instance that spawned this catch event
    #[serde(default)]
    pub event_gateway: Option<ActivityInstanceId>,

    /// Iteration index when owned by a multi-instance wrapper
    #[serde(default)]
    pub iteration: Option<usize>,

    /// Iteration state when this entry is a multi-instance wrapper
    #[serde(default)]
    pub multi_instance: Option<MultiInstanceState>,

    /// Failure on this entry was caught by an error boundary
    #[serde(default)]
    pub error_caught: bool,
}

impl ActivityInstanceEntry {
    /// Still taking part in execution
    pub fn is_active(&self) -> bool {
        !self.completed
    }

    /// Failure that no boundary caught
    pub fn unhandled_error(&self) -> Option<&ActivityError> {
        if self.error_caught {
            None
        } else {
            self.activity.error()
        }
    }
}

/// Variables visible to activities bound to this scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableScope {
    /// Scope id
    pub id: VariableScopeId,
    /// Enclosing scope; `None` only for the root scope
    pub parent: Option<VariableScopeId>,
    /// Local variables
    pub variables: Variables,
}

/// Evaluation state of one conditional outgoing flow of a gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSequenceState {
    /// Gateway activity instance
    pub gateway_instance_id: ActivityInstanceId,
    /// Outgoing flow
    pub flow_id: SequenceFlowId,
    /// Whether a result has been recorded
    pub evaluated: bool,
    /// Recorded result
    pub result: bool,
}

/// What a subscription waits for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// Timer registered with the scheduler under the subscription key
    Timer,
    /// Message subscription
    Message {
        /// Message name
        name: String,
        /// Correlation key the message must carry
        correlation_key: String,
    },
    /// Signal subscription
    Signal {
        /// Signal name
        name: String,
    },
}

/// An external registration held on behalf of an activity instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique key within the instance
    pub key: String,
    /// Catch event or boundary host the subscription belongs to
    pub host: ActivityInstanceId,
    /// Boundary event to follow on fire; `None` for catch events
    pub boundary: Option<ActivityId>,
    /// Whether firing the boundary cancels the host
    pub cancel_activity: bool,
    /// What the subscription waits for
    pub kind: SubscriptionKind,
}

/// Durable state of one running process
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance id
    pub id: WorkflowInstanceId,

    /// Process being executed
    pub process_id: ProcessId,

    /// Lifecycle stage
    pub stage: WorkflowStage,

    /// Call activity that started this instance
    pub parent: Option<ParentLink>,

    /// Activity occurrences in creation order
    pub entries: Vec<ActivityInstanceEntry>,

    /// Root variable scope
    pub root_scope_id: VariableScopeId,

    /// All variable scopes
    pub scopes: BTreeMap<VariableScopeId, VariableScope>,

    /// Gateway condition rows
    pub conditions: Vec<ConditionSequenceState>,

    /// Live timer, message and signal registrations
    pub subscriptions: Vec<Subscription>,

    /// First failure that no boundary caught
    pub failure: Option<ActivityError>,

    /// Counter for ids generated inside this instance
    pub sequence: u64,

    /// When the instance was created
    pub created_at: DateTime<Utc>,

    /// When the instance started
    pub started_at: Option<DateTime<Utc>>,

    /// When the instance finished
    pub completed_at: Option<DateTime<Utc>>,

    /// Events recorded since the last drain
    #[serde(skip)]
    events: Vec<Box<dyn DomainEvent>>,
}

// Recorded events are transient and not cloned
impl Clone for WorkflowInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            process_id: self.process_id.clone(),
            stage: self.stage,
            parent: self.parent.clone(),
            entries: self.entries.clone(),
            root_scope_id: self.root_scope_id.clone(),
            scopes: self.scopes.clone(),
            conditions: self.conditions.clone(),
            subscriptions: self.subscriptions.clone(),
            failure: self.failure.clone(),
            sequence: self.sequence,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            events: Vec::new(),
        }
    }
}

impl WorkflowInstance {
    /// Create a not-started instance with a seeded root scope
    pub fn new(
        id: WorkflowInstanceId,
        process_id: ProcessId,
        parent: Option<ParentLink>,
        variables: Variables,
    ) -> Self {
        let root_scope_id = VariableScopeId("scope-0".to_string());
        let mut scopes = BTreeMap::new();
        scopes.insert(
            root_scope_id.clone(),
            VariableScope {
                id: root_scope_id.clone(),
                parent: None,
                variables,
            },
        );
        Self {
            id,
            process_id,
            stage: WorkflowStage::NotStarted,
            parent,
            entries: Vec::new(),
            root_scope_id,
            scopes,
            conditions: Vec::new(),
            subscriptions: Vec::new(),
            failure: None,
            sequence: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            events: Vec::new(),
        }
    }

    /// NotStarted -> Running
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.stage != WorkflowStage::NotStarted {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot start workflow in stage: {:?}",
                self.stage
            )));
        }
        let now = Utc::now();
        self.stage = WorkflowStage::Running;
        self.started_at = Some(now);
        self.record_event(Box::new(WorkflowStarted {
            workflow_instance_id: self.id.clone(),
            process_id: self.process_id.clone(),
            timestamp: now,
        }));
        Ok(())
    }

    /// Running -> Completed
    pub fn complete(&mut self) -> Result<(), CoreError> {
        if self.stage != WorkflowStage::Running {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot complete workflow in stage: {:?}",
                self.stage
            )));
        }
        let now = Utc::now();
        self.stage = WorkflowStage::Completed;
        self.completed_at = Some(now);
        self.record_event(Box::new(WorkflowCompleted {
            workflow_instance_id: self.id.clone(),
            timestamp: now,
        }));
        Ok(())
    }

    /// Running -> Failed
    pub fn fail(&mut self, error: ActivityError) -> Result<(), CoreError> {
        if self.stage != WorkflowStage::Running {
            return Err(CoreError::InvalidTransition(format!(
                "Cannot fail workflow in stage: {:?}",
                self.stage
            )));
        }
        let now = Utc::now();
        self.stage = WorkflowStage::Failed;
        self.completed_at = Some(now);
        self.record_event(Box::new(WorkflowFailed {
            workflow_instance_id: self.id.clone(),
            error,
            timestamp: now,
        }));
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{}-{}", prefix, self.sequence)
    }

    /// Create a not-started entry
    pub fn add_entry(
        &mut self,
        activity_id: ActivityId,
        scope_id: Option<ActivityInstanceId>,
        variable_scope_id: VariableScopeId,
    ) -> ActivityInstanceId {
        let id = ActivityInstanceId(self.next_id(&activity_id.0));
        self.entries.push(ActivityInstanceEntry {
            id: id.clone(),
            activity_id,
            scope_id,
            child_workflow_id: None,
            completed: false,
            activity: ActivityInstance::new(variable_scope_id),
            arrived_flows: Vec::new(),
            event_gateway: None,
            iteration: None,
            multi_instance: None,
            error_caught: false,
        });
        id
    }

    /// Look up an entry
    pub fn entry(&self, id: &ActivityInstanceId) -> Option<&ActivityInstanceEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Look up an entry for mutation
    pub fn entry_mut(&mut self, id: &ActivityInstanceId) -> Result<&mut ActivityInstanceEntry, CoreError> {
        self.entries
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown activity instance: {}", id)))
    }

    /// Entries still taking part in execution
    pub fn active_entries(&self) -> impl Iterator<Item = &ActivityInstanceEntry> {
        self.entries.iter().filter(|e| e.is_active())
    }

    /// Whether any entry is still active
    pub fn has_active_entries(&self) -> bool {
        self.entries.iter().any(|e| e.is_active())
    }

    /// First active, executing entry of an activity definition
    pub fn find_executing(&self, activity_id: &ActivityId) -> Option<&ActivityInstanceEntry> {
        self.active_entries()
            .find(|e| &e.activity_id == activity_id && e.activity.is_executing())
    }

    /// Entries owned by a sub-process or multi-instance entry
    pub fn children_of<'a>(
        &'a self,
        owner: &'a ActivityInstanceId,
    ) -> impl Iterator<Item = &'a ActivityInstanceEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.scope_id.as_ref() == Some(owner))
    }

    /// `id` followed by every entry in its scope tree, depth-first
    pub fn scope_tree(&self, id: &ActivityInstanceId) -> Vec<ActivityInstanceId> {
        let mut ordered = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            let children: Vec<_> = self.children_of(&current).map(|e| e.id.clone()).collect();
            ordered.push(current);
            stack.extend(children.into_iter().rev());
        }
        ordered
    }

    /// Look up a variable scope
    pub fn scope(&self, id: &VariableScopeId) -> Option<&VariableScope> {
        self.scopes.get(id)
    }

    /// Create a scope nested in `parent`
    pub fn create_scope(&mut self, parent: &VariableScopeId, variables: Variables) -> VariableScopeId {
        let id = VariableScopeId(self.next_id("scope"));
        self.scopes.insert(
            id.clone(),
            VariableScope {
                id: id.clone(),
                parent: Some(parent.clone()),
                variables,
            },
        );
        id
    }

    /// Snapshot a scope into an independently mutable sibling.
    ///
    /// The copy shares the source's parent; a copy of the root scope nests
    /// under the root so that the root stays unique.
    pub fn clone_scope(&mut self, source: &VariableScopeId) -> Result<VariableScopeId, CoreError> {
        let original = self
            .scopes
            .get(source)
            .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown variable scope: {}", source)))?;
        let parent = original.parent.clone().unwrap_or_else(|| original.id.clone());
        let variables = original.variables.clone();
        Ok(self.create_scope(&parent, variables))
    }

    /// Resolve a variable through the scope chain
    pub fn variable(&self, scope: &VariableScopeId, name: &str) -> Option<&Value> {
        let mut current = self.scopes.get(scope);
        while let Some(s) = current {
            if let Some(value) = s.variables.get(name) {
                return Some(value);
            }
            current = s.parent.as_ref().and_then(|p| self.scopes.get(p));
        }
        None
    }

    /// All variables visible from a scope, nearer scopes shadowing outer ones
    pub fn visible_variables(&self, scope: &VariableScopeId) -> Variables {
        let mut chain = Vec::new();
        let mut current = self.scopes.get(scope);
        while let Some(s) = current {
            chain.push(s);
            current = s.parent.as_ref().and_then(|p| self.scopes.get(p));
        }
        let mut visible = Variables::new();
        for s in chain.into_iter().rev() {
            visible.extend(s.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        visible
    }

    /// Write a variable into the nearest scope that already defines it,
    /// or into `scope` itself when none does
    pub fn set_variable(&mut self, scope: &VariableScopeId, name: &str, value: Value) -> Result<(), CoreError> {
        let mut target = None;
        let mut current = Some(scope.clone());
        while let Some(id) = current {
            let s = self
                .scopes
                .get(&id)
                .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown variable scope: {}", id)))?;
            if s.variables.contains_key(name) {
                target = Some(id);
                break;
            }
            current = s.parent.clone();
        }
        let target = target.unwrap_or_else(|| scope.clone());
        if let Some(s) = self.scopes.get_mut(&target) {
            s.variables.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Write a variable into `scope` itself, shadowing outer definitions
    pub fn set_local_variable(&mut self, scope: &VariableScopeId, name: &str, value: Value) -> Result<(), CoreError> {
        let s = self
            .scopes
            .get_mut(scope)
            .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown variable scope: {}", scope)))?;
        s.variables.insert(name.to_string(), value);
        Ok(())
    }

    /// Write every variable of `variables`
    pub fn merge_variables(&mut self, scope: &VariableScopeId, variables: Variables) -> Result<(), CoreError> {
        for (name, value) in variables {
            self.set_variable(scope, &name, value)?;
        }
        Ok(())
    }

    /// Register pending condition rows for a gateway
    pub fn add_condition_rows(&mut self, gateway: &ActivityInstanceId, flows: &[SequenceFlowId]) {
        for flow in flows {
            let exists = self
                .conditions
                .iter()
                .any(|c| &c.gateway_instance_id == gateway && &c.flow_id == flow);
            if !exists {
                self.conditions.push(ConditionSequenceState {
                    gateway_instance_id: gateway.clone(),
                    flow_id: flow.clone(),
                    evaluated: false,
                    result: false,
                });
            }
        }
    }

    /// Condition rows of a gateway, in registration order
    pub fn condition_rows(&self, gateway: &ActivityInstanceId) -> Vec<&ConditionSequenceState> {
        self.conditions
            .iter()
            .filter(|c| &c.gateway_instance_id == gateway)
            .collect()
    }

    /// Record a condition result; returns false for unknown or already evaluated rows
    pub fn record_condition_result(
        &mut self,
        gateway: &ActivityInstanceId,
        flow: &SequenceFlowId,
        result: bool,
    ) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| &c.gateway_instance_id == gateway && &c.flow_id == flow)
        {
            Some(row) if !row.evaluated => {
                row.evaluated = true;
                row.result = result;
                true
            }
            _ => false,
        }
    }

    /// Track a registration
    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Remove and return the first registration matching `predicate`
    pub fn take_subscription<F>(&mut self, predicate: F) -> Option<Subscription>
    where
        F: Fn(&Subscription) -> bool,
    {
        let index = self.subscriptions.iter().position(predicate)?;
        Some(self.subscriptions.remove(index))
    }

    /// Remove and return every registration held for `host`
    pub fn take_subscriptions_of(&mut self, host: &ActivityInstanceId) -> Vec<Subscription> {
        let (taken, kept) = std::mem::take(&mut self.subscriptions)
            .into_iter()
            .partition(|s| &s.host == host);
        self.subscriptions = kept;
        taken
    }

    /// Remember the first unhandled failure
    pub fn record_failure(&mut self, error: ActivityError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Drain recorded domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}
