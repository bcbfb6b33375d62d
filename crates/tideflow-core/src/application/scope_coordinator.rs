//! Sub-process scopes, multi-instance iterations and cancellation cascades.

use super::execution_loop::ExecutionContext;
use crate::domain::catalog::Located;
use crate::domain::events::{ActivityCancelled, ActivityFailed};
use crate::domain::process_definition::ActivityKind;
use crate::domain::workflow_instance::{ActivityInstanceId, MultiInstanceState};
use crate::types::Variables;
use crate::CoreError;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Variable holding the zero-based iteration index inside an iteration scope
pub const LOOP_COUNTER: &str = "loopCounter";

impl<'a> ExecutionContext<'a> {
    /// Open the scope of a sub-process entry and seed its start event
    pub(crate) fn open_scope(&mut self, id: &ActivityInstanceId, located: Located<'a>) -> Result<(), CoreError> {
        let ActivityKind::SubProcess(scope) = &located.activity.kind else {
            return Err(CoreError::StructuralViolation(format!(
                "{} does not open a scope",
                located.activity.id
            )));
        };
        let start = scope.start_event().ok_or_else(|| {
            CoreError::ConfigurationError(format!("Sub-process {} has no start event", located.activity.id))
        })?;

        let parent_scope = self.variable_scope_of(id)?;
        let child_scope = self.instance.create_scope(&parent_scope, Variables::new());
        let start_id = self.instance.add_entry(start.id.clone(), Some(id.clone()), child_scope);
        debug!(
            instance_id = %self.instance.id,
            sub_process = %id,
            start = %start_id,
            "Opened sub-process scope"
        );
        Ok(())
    }

    /// Start a multi-instance wrapper's iterations
    pub(crate) fn spawn_iterations(
        &mut self,
        id: &ActivityInstanceId,
        located: Located<'a>,
        elements: Vec<Value>,
        sequential: bool,
    ) -> Result<(), CoreError> {
        let total = elements.len();
        self.instance.entry_mut(id)?.multi_instance = Some(MultiInstanceState {
            elements,
            spawned: 0,
            finished: 0,
            outputs: BTreeMap::new(),
        });
        debug!(instance_id = %self.instance.id, wrapper = %id, total, sequential, "Spawning iterations");

        let count = if sequential { 1 } else { total };
        for _ in 0..count {
            self.spawn_next_iteration(id, located)?;
        }
        Ok(())
    }

    fn spawn_next_iteration(&mut self, wrapper_id: &ActivityInstanceId, located: Located<'a>) -> Result<bool, CoreError> {
        let ActivityKind::MultiInstance(mi) = &located.activity.kind else {
            return Err(CoreError::StructuralViolation(format!(
                "{} is not a multi-instance activity",
                located.activity.id
            )));
        };

        let (index, element, wrapper_scope) = {
            let wrapper = self.instance.entry_mut(wrapper_id)?;
            let scope = wrapper.activity.variable_scope_id.clone();
            let state = wrapper.multi_instance.as_mut().ok_or_else(|| {
                CoreError::StructuralViolation(format!("{} has no iteration state", wrapper_id))
            })?;
            if state.spawned >= state.total() {
                return Ok(false);
            }
            let index = state.spawned;
            state.spawned += 1;
            (index, state.elements.get(index).cloned().unwrap_or(Value::Null), scope)
        };

        let scope = self.instance.clone_scope(&wrapper_scope)?;
        self.instance.set_local_variable(&scope, LOOP_COUNTER, json!(index))?;
        if let Some(name) = &mi.element_variable {
            self.instance.set_local_variable(&scope, name, element)?;
        }

        let iteration_id = self
            .instance
            .add_entry(mi.inner.id.clone(), Some(wrapper_id.clone()), scope);
        self.instance.entry_mut(&iteration_id)?.iteration = Some(index);
        debug!(instance_id = %self.instance.id, wrapper = %wrapper_id, iteration = index, "Iteration spawned");
        Ok(true)
    }

    /// Account for a finished iteration and spawn the next sequential one
    pub(crate) fn on_iteration_finished(&mut self, iteration_id: &ActivityInstanceId) -> Result<(), CoreError> {
        let (wrapper_id, index, scope, succeeded) = {
            let entry = self.entry(iteration_id)?;
            (
                entry.scope_id.clone(),
                entry.iteration.unwrap_or_default(),
                entry.activity.variable_scope_id.clone(),
                entry.activity.is_completed(),
            )
        };
        let Some(wrapper_id) = wrapper_id else {
            return Ok(());
        };
        let located = self.locate(&wrapper_id)?;
        let ActivityKind::MultiInstance(mi) = &located.activity.kind else {
            return Ok(());
        };
        let output = mi
            .output_element
            .as_ref()
            .and_then(|name| self.instance.variable(&scope, name).cloned());

        let wrapper = self.instance.entry_mut(&wrapper_id)?;
        if !wrapper.is_active() {
            return Ok(());
        }
        let state = wrapper.multi_instance.as_mut().ok_or_else(|| {
            CoreError::StructuralViolation(format!("{} has no iteration state", wrapper_id))
        })?;
        state.finished += 1;
        if let (true, Some(value)) = (succeeded, output) {
            state.outputs.insert(index, value);
        }

        if mi.sequential && succeeded {
            self.spawn_next_iteration(&wrapper_id, located)?;
        }
        Ok(())
    }

    /// Close every scope-owning entry whose children have all finished
    pub(crate) async fn sweep_completed_scopes(&mut self) -> Result<bool, CoreError> {
        let mut closed = false;
        let mut rounds = 0;
        while let Some(owner) = self.next_closable_scope() {
            rounds += 1;
            if rounds > self.config.max_scope_sweep_iterations {
                return Err(CoreError::StructuralViolation(format!(
                    "Scope sweep of instance {} did not settle after {} rounds",
                    self.instance.id, self.config.max_scope_sweep_iterations
                )));
            }
            self.close_scope(&owner)?;
            closed = true;
        }
        Ok(closed)
    }

    fn next_closable_scope(&self) -> Option<ActivityInstanceId> {
        self.instance
            .active_entries()
            .filter(|e| e.activity.is_executing())
            .find(|owner| {
                let children: Vec<_> = self.instance.children_of(&owner.id).collect();
                if children.is_empty() || !children.iter().all(|c| c.completed) {
                    return false;
                }
                match &owner.multi_instance {
                    Some(state) => {
                        state.finished >= state.total()
                            || children.iter().any(|c| c.unhandled_error().is_some())
                    }
                    None => true,
                }
            })
            .map(|e| e.id.clone())
    }

    fn close_scope(&mut self, owner: &ActivityInstanceId) -> Result<(), CoreError> {
        let failure = self
            .instance
            .children_of(owner)
            .find_map(|c| c.unhandled_error().cloned());

        if let Some(error) = failure {
            debug!(instance_id = %self.instance.id, scope = %owner, error = %error, "Scope closed by unhandled failure");
            let entry = self.instance.entry_mut(owner)?;
            entry.activity.fail(error.clone());
            let activity_id = entry.activity_id.clone();
            self.instance.record_event(Box::new(ActivityFailed {
                workflow_instance_id: self.instance.id.clone(),
                activity_id,
                activity_instance_id: owner.clone(),
                error,
                timestamp: Utc::now(),
            }));
            return Ok(());
        }

        let located = self.locate(owner)?;
        if let ActivityKind::MultiInstance(mi) = &located.activity.kind {
            if let Some(collection) = &mi.output_collection {
                let entry = self.entry(owner)?;
                let scope = entry.activity.variable_scope_id.clone();
                let outputs: Vec<Value> = entry
                    .multi_instance
                    .as_ref()
                    .map(|state| state.outputs.values().cloned().collect())
                    .unwrap_or_default();
                self.instance.set_variable(&scope, collection, Value::Array(outputs))?;
            }
        }

        debug!(instance_id = %self.instance.id, scope = %owner, "Scope completed");
        self.instance.entry_mut(owner)?.activity.complete()
    }

    /// Cancel an entry together with everything in its scope tree.
    ///
    /// Child workflows started by cancelled call activities keep running.
    pub(crate) async fn cancel_entry(&mut self, id: &ActivityInstanceId, reason: &str) -> Result<(), CoreError> {
        for target in self.instance.scope_tree(id) {
            let entry = self.instance.entry_mut(&target)?;
            if !entry.is_active() {
                continue;
            }
            entry.completed = true;
            if !entry.activity.is_terminal() {
                entry.activity.cancel(reason)?;
                let activity_id = entry.activity_id.clone();
                self.instance.record_event(Box::new(ActivityCancelled {
                    workflow_instance_id: self.instance.id.clone(),
                    activity_id,
                    activity_instance_id: target.clone(),
                    reason: reason.to_string(),
                    timestamp: Utc::now(),
                }));
            }
            self.teardown_subscriptions(&target).await;
        }
        debug!(instance_id = %self.instance.id, activity_instance_id = %id, reason, "Cancelled scope tree");
        Ok(())
    }

    /// Terminate end event: cancel everything else in the enclosing scope
    pub(crate) async fn terminate_scope(&mut self, id: &ActivityInstanceId) -> Result<(), CoreError> {
        let owner = self.entry(id)?.scope_id.clone();
        let targets: Vec<ActivityInstanceId> = self
            .instance
            .active_entries()
            .filter(|e| e.scope_id == owner && &e.id != id)
            .map(|e| e.id.clone())
            .collect();
        for target in targets {
            self.cancel_entry(&target, &format!("terminated by {}", id)).await?;
        }
        Ok(())
    }
}
