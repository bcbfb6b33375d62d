//! The per-trigger execution loop.
//!
//! An [`ExecutionContext`] borrows one loaded instance for the duration of a
//! single external trigger. The trigger mutates the instance, then [`run`]
//! drives it to a fixed point: not-started entries execute, completed entries
//! transition, finished scopes close. Work that crosses instance boundaries
//! is collected as [`OutboundEffect`]s for the dispatcher.
//!
//! [`run`]: ExecutionContext::run

use crate::domain::catalog::{self, Located};
use crate::domain::command::ExecutionCommand;
use crate::domain::events::{ActivityCompleted, ActivityFailed, ActivityStarted};
use crate::domain::process_definition::{ActivityId, ActivityKind, ProcessDefinition, ProcessId, SequenceFlowId};
use crate::domain::repository::Collaborators;
use crate::domain::workflow_instance::{
    ActivityInstanceEntry, ActivityInstanceId, ParentLink, Subscription, VariableScopeId, WorkflowInstance,
    WorkflowInstanceId, WorkflowStage,
};
use crate::types::Variables;
use crate::{ActivityError, CoreError, EngineConfig};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Request to create and start a workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    /// Id of the new instance
    pub instance_id: WorkflowInstanceId,
    /// Process to run
    pub process_id: ProcessId,
    /// Initial root scope variables
    pub variables: Variables,
    /// Call activity awaiting this instance
    pub parent: Option<ParentLink>,
}

/// Asynchronous evaluation of one exclusive gateway condition row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRequest {
    /// Instance owning the gateway
    pub instance_id: WorkflowInstanceId,
    /// Gateway activity instance
    pub gateway_instance_id: ActivityInstanceId,
    /// Row to fill in
    pub flow_id: SequenceFlowId,
    /// Condition expression
    pub expression: String,
    /// Variables visible to the gateway
    pub variables: Variables,
}

/// Work for other instances or for the evaluator, produced by a trigger
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEffect {
    /// Start a child workflow
    StartChildWorkflow(StartWorkflowRequest),
    /// Tell a parent its child completed
    NotifyParentCompleted {
        /// Parent call activity
        parent: ParentLink,
        /// The finished child
        child_id: WorkflowInstanceId,
        /// Child root scope variables
        variables: Variables,
    },
    /// Tell a parent its child failed
    NotifyParentFailed {
        /// Parent call activity
        parent: ParentLink,
        /// The failed child
        child_id: WorkflowInstanceId,
        /// Unhandled failure
        error: ActivityError,
    },
    /// Evaluate a condition and report back with `set_condition_result`
    EvaluateCondition(ConditionRequest),
    /// Broadcast a signal to every subscriber
    BroadcastSignal {
        /// Signal name
        signal: String,
        /// Variables delivered with the signal
        variables: Variables,
    },
}

/// Addresses an activity instance from outside the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityRef {
    /// The first executing instance of an activity definition
    Definition(ActivityId),
    /// A specific activity instance
    Instance(ActivityInstanceId),
}

pub(crate) struct ExecutionContext<'a> {
    pub(crate) instance: &'a mut WorkflowInstance,
    pub(crate) definition: &'a ProcessDefinition,
    pub(crate) collaborators: &'a Collaborators,
    pub(crate) config: &'a EngineConfig,
    pub(crate) effects: Vec<OutboundEffect>,
    // registrations made while processing this trigger
    pub(crate) registered: Vec<Subscription>,
    steps: usize,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        instance: &'a mut WorkflowInstance,
        definition: &'a ProcessDefinition,
        collaborators: &'a Collaborators,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            instance,
            definition,
            collaborators,
            config,
            effects: Vec::new(),
            registered: Vec::new(),
            steps: 0,
        }
    }

    /// Effects for other instances and the registrations this trigger made
    pub(crate) fn into_parts(self) -> (Vec<OutboundEffect>, Vec<Subscription>) {
        (self.effects, self.registered)
    }

    pub(crate) fn locate(&self, id: &ActivityInstanceId) -> Result<Located<'a>, CoreError> {
        let definition: &'a ProcessDefinition = self.definition;
        catalog::locate(definition, &*self.instance, id)
    }

    pub(crate) fn entry(&self, id: &ActivityInstanceId) -> Result<&ActivityInstanceEntry, CoreError> {
        self.instance
            .entry(id)
            .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown activity instance: {}", id)))
    }

    pub(crate) fn variable_scope_of(&self, id: &ActivityInstanceId) -> Result<VariableScopeId, CoreError> {
        Ok(self.entry(id)?.activity.variable_scope_id.clone())
    }

    pub(crate) fn visible_variables(&self, id: &ActivityInstanceId) -> Result<Variables, CoreError> {
        let scope = self.variable_scope_of(id)?;
        Ok(self.instance.visible_variables(&scope))
    }

    /// Drive the instance until no entry can make progress
    pub(crate) async fn run(&mut self) -> Result<(), CoreError> {
        loop {
            let mut progressed = false;
            while let Some(id) = self.next_not_started() {
                self.tick()?;
                self.execute_entry(&id).await?;
                progressed = true;
            }
            if self.transition_completed().await? {
                progressed = true;
            }
            if self.sweep_completed_scopes().await? {
                progressed = true;
            }
            if !progressed {
                break;
            }
            self.tick()?;
        }
        self.finish_if_idle()
    }

    fn tick(&mut self) -> Result<(), CoreError> {
        self.steps += 1;
        if self.steps > self.config.max_loop_iterations {
            return Err(CoreError::StructuralViolation(format!(
                "Execution of instance {} exceeded {} steps",
                self.instance.id, self.config.max_loop_iterations
            )));
        }
        Ok(())
    }

    fn next_not_started(&self) -> Option<ActivityInstanceId> {
        self.instance
            .active_entries()
            .find(|e| e.activity.is_not_started())
            .map(|e| e.id.clone())
    }

    async fn execute_entry(&mut self, id: &ActivityInstanceId) -> Result<(), CoreError> {
        let located = self.locate(id)?;
        let entry = self.instance.entry_mut(id)?;
        entry.activity.execute()?;
        let activity_id = entry.activity_id.clone();

        debug!(
            instance_id = %self.instance.id,
            activity_id = %activity_id,
            activity_instance_id = %id,
            "Executing activity"
        );
        self.instance.record_event(Box::new(ActivityStarted {
            workflow_instance_id: self.instance.id.clone(),
            activity_id,
            activity_instance_id: id.clone(),
            timestamp: Utc::now(),
        }));

        let commands = {
            let instance: &WorkflowInstance = &*self.instance;
            let entry = instance
                .entry(id)
                .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown activity instance: {}", id)))?;
            catalog::decide(
                instance,
                entry,
                located.activity,
                located.scope,
                self.config.max_multi_instance_iterations,
            )?
        };
        for command in commands {
            self.apply(id, located, command).await?;
        }
        Ok(())
    }

    async fn apply(
        &mut self,
        id: &ActivityInstanceId,
        located: Located<'a>,
        command: ExecutionCommand,
    ) -> Result<(), CoreError> {
        match command {
            ExecutionCommand::CompleteActivity => self.instance.entry_mut(id)?.activity.complete(),
            ExecutionCommand::FailActivity(error) => self.fail_activity(id, error).await,
            ExecutionCommand::CompleteWorkflow => self.terminate_scope(id).await,
            ExecutionCommand::OpenScope => self.open_scope(id, located),
            ExecutionCommand::SpawnIterations {
                elements,
                sequential,
            } => self.spawn_iterations(id, located, elements, sequential),
            ExecutionCommand::RegisterTimer { timer, binding } => {
                self.register_timer(id, &timer, binding).await
            }
            ExecutionCommand::RegisterMessage { message, binding } => {
                self.register_message(id, &message, binding).await
            }
            ExecutionCommand::RegisterSignal { signal, binding } => {
                self.register_signal(id, &signal, binding).await
            }
            ExecutionCommand::StartChildWorkflow {
                process_id,
                inputs,
                propagate_all,
            } => self.start_child(id, process_id, &inputs, propagate_all),
            ExecutionCommand::AddConditions { flows } => {
                self.instance.add_condition_rows(id, &flows);
                Ok(())
            }
            ExecutionCommand::EvaluateCondition {
                flow_id,
                expression,
            } => {
                let variables = self.visible_variables(id)?;
                self.effects.push(OutboundEffect::EvaluateCondition(ConditionRequest {
                    instance_id: self.instance.id.clone(),
                    gateway_instance_id: id.clone(),
                    flow_id,
                    expression,
                    variables,
                }));
                Ok(())
            }
            ExecutionCommand::ExecuteScript { script, format } => {
                self.execute_script(id, &script, &format).await
            }
            ExecutionCommand::ThrowSignal { signal } => {
                let variables = self.visible_variables(id)?;
                debug!(instance_id = %self.instance.id, signal = %signal, "Throwing signal");
                self.effects
                    .push(OutboundEffect::BroadcastSignal { signal, variables });
                Ok(())
            }
        }
    }

    async fn execute_script(&mut self, id: &ActivityInstanceId, script: &str, format: &str) -> Result<(), CoreError> {
        let variables = self.visible_variables(id)?;
        match self
            .collaborators
            .scripts
            .execute(script, &variables, format)
            .await
        {
            Ok(updated) => {
                let scope = self.variable_scope_of(id)?;
                self.instance.merge_variables(&scope, updated)?;
                self.instance.entry_mut(id)?.activity.complete()
            }
            Err(error) => self.fail_activity(id, error).await,
        }
    }

    /// Follow the outgoing flows of every finished entry
    async fn transition_completed(&mut self) -> Result<bool, CoreError> {
        let ready: Vec<ActivityInstanceId> = self
            .instance
            .active_entries()
            .filter(|e| e.activity.is_terminal())
            .map(|e| e.id.clone())
            .collect();

        for id in &ready {
            // an earlier transition in this batch may have cancelled it
            if !self.entry(id)?.is_active() {
                continue;
            }
            self.teardown_subscriptions(id).await;

            let entry = self.instance.entry_mut(id)?;
            entry.completed = true;
            let finished_normally = entry.activity.is_completed();
            let is_iteration = entry.iteration.is_some();
            let activity_id = entry.activity_id.clone();

            if is_iteration {
                self.on_iteration_finished(id)?;
            }
            if !finished_normally {
                continue;
            }

            self.instance.record_event(Box::new(ActivityCompleted {
                workflow_instance_id: self.instance.id.clone(),
                activity_id: activity_id.clone(),
                activity_instance_id: id.clone(),
                timestamp: Utc::now(),
            }));

            let located = self.locate(id)?;
            let successors = {
                let instance: &WorkflowInstance = &*self.instance;
                let entry = instance
                    .entry(id)
                    .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown activity instance: {}", id)))?;
                catalog::next_activities(instance, entry, located.activity, located.scope)?
            };
            debug!(
                instance_id = %self.instance.id,
                activity_id = %activity_id,
                successors = successors.len(),
                "Activity completed"
            );
            for successor in successors {
                self.spawn_successor(id, located, successor)?;
            }
        }
        Ok(!ready.is_empty())
    }

    fn finish_if_idle(&mut self) -> Result<(), CoreError> {
        if self.instance.stage != WorkflowStage::Running || self.instance.has_active_entries() {
            return Ok(());
        }

        let parent = self.instance.parent.clone();
        match self.instance.failure.clone() {
            Some(error) => {
                warn!(instance_id = %self.instance.id, error = %error, "Workflow failed");
                self.instance.fail(error.clone())?;
                if let Some(parent) = parent {
                    self.effects.push(OutboundEffect::NotifyParentFailed {
                        parent,
                        child_id: self.instance.id.clone(),
                        error,
                    });
                }
            }
            None => {
                info!(instance_id = %self.instance.id, process_id = %self.instance.process_id, "Workflow completed");
                self.instance.complete()?;
                if let Some(parent) = parent {
                    let root = self.instance.root_scope_id.clone();
                    self.effects.push(OutboundEffect::NotifyParentCompleted {
                        parent,
                        child_id: self.instance.id.clone(),
                        variables: self.instance.visible_variables(&root),
                    });
                }
            }
        }
        Ok(())
    }

    /// Complete a waiting task on behalf of an external caller
    pub(crate) async fn complete_external(&mut self, target: &ActivityRef, variables: Variables) -> Result<(), CoreError> {
        let id = self.resolve_ref(target)?;
        let located = self.locate(&id)?;
        if !matches!(located.activity.kind, ActivityKind::Task) {
            return Err(CoreError::ActivityNotActive(format!(
                "{} is not a task awaiting completion",
                located.activity.id
            )));
        }
        let scope = self.variable_scope_of(&id)?;
        self.instance.merge_variables(&scope, variables)?;
        self.instance.entry_mut(&id)?.activity.complete()
    }

    /// Fail an executing activity on behalf of an external caller
    pub(crate) async fn fail_external(&mut self, target: &ActivityRef, error: ActivityError) -> Result<(), CoreError> {
        let id = self.resolve_ref(target)?;
        self.fail_activity(&id, error).await
    }

    fn resolve_ref(&self, target: &ActivityRef) -> Result<ActivityInstanceId, CoreError> {
        let entry = match target {
            ActivityRef::Definition(activity_id) => self
                .instance
                .find_executing(activity_id)
                .ok_or_else(|| CoreError::ActivityNotActive(activity_id.0.clone()))?,
            ActivityRef::Instance(id) => self
                .instance
                .entry(id)
                .ok_or_else(|| CoreError::ActivityNotFound(id.0.clone()))?,
        };
        if !entry.is_active() || !entry.activity.is_executing() {
            return Err(CoreError::ActivityNotActive(entry.id.0.clone()));
        }
        Ok(entry.id.clone())
    }

    pub(crate) fn record_failure_event(&mut self, id: &ActivityInstanceId, error: &ActivityError) -> Result<(), CoreError> {
        let activity_id = self.entry(id)?.activity_id.clone();
        self.instance.record_event(Box::new(ActivityFailed {
            workflow_instance_id: self.instance.id.clone(),
            activity_id,
            activity_instance_id: id.clone(),
            error: error.clone(),
            timestamp: Utc::now(),
        }));
        Ok(())
    }
}
