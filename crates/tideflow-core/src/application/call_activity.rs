//! Call activities: child workflow start and completion.

use super::execution_loop::{ExecutionContext, OutboundEffect, StartWorkflowRequest};
use crate::domain::process_definition::{ActivityKind, ProcessId, VariableMapping};
use crate::domain::workflow_instance::{ActivityInstanceId, ParentLink, WorkflowInstanceId};
use crate::types::Variables;
use crate::{ActivityError, CoreError};
use tracing::debug;

impl<'a> ExecutionContext<'a> {
    /// Map inputs and request the child start.
    ///
    /// The child id derives from the parent and the call activity instance
    /// so that a repeated start request is recognised as a duplicate.
    pub(crate) fn start_child(
        &mut self,
        id: &ActivityInstanceId,
        process_id: ProcessId,
        inputs: &[VariableMapping],
        propagate_all: bool,
    ) -> Result<(), CoreError> {
        let visible = self.visible_variables(id)?;
        let mut variables = if propagate_all { visible.clone() } else { Variables::new() };
        for mapping in inputs {
            if let Some(value) = visible.get(&mapping.source) {
                variables.insert(mapping.target.clone(), value.clone());
            }
        }

        let child_id = WorkflowInstanceId(format!("{}/{}", self.instance.id, id));
        let parent_instance_id = self.instance.id.clone();
        let entry = self.instance.entry_mut(id)?;
        entry.child_workflow_id = Some(child_id.clone());
        let parent = ParentLink {
            instance_id: parent_instance_id,
            activity_instance_id: id.clone(),
            activity_id: entry.activity_id.clone(),
        };

        debug!(instance_id = %self.instance.id, child_id = %child_id, process_id = %process_id, "Starting child workflow");
        self.effects.push(OutboundEffect::StartChildWorkflow(StartWorkflowRequest {
            instance_id: child_id,
            process_id,
            variables,
            parent: Some(parent),
        }));
        Ok(())
    }

    fn awaiting_child(&self, id: &ActivityInstanceId, child_id: &WorkflowInstanceId) -> bool {
        self.instance
            .entry(id)
            .map(|e| e.is_active() && e.activity.is_executing() && e.child_workflow_id.as_ref() == Some(child_id))
            .unwrap_or(false)
    }

    /// Map child outputs back and complete the call activity
    pub(crate) fn complete_from_child(
        &mut self,
        id: &ActivityInstanceId,
        child_id: &WorkflowInstanceId,
        variables: Variables,
    ) -> Result<bool, CoreError> {
        if !self.awaiting_child(id, child_id) {
            debug!(instance_id = %self.instance.id, child_id = %child_id, "Ignoring completion of unawaited child");
            return Ok(false);
        }
        let located = self.locate(id)?;
        let ActivityKind::CallActivity(call) = &located.activity.kind else {
            return Err(CoreError::StructuralViolation(format!(
                "{} is not a call activity",
                located.activity.id
            )));
        };

        let scope = self.variable_scope_of(id)?;
        if call.propagate_all_outputs {
            self.instance.merge_variables(&scope, variables.clone())?;
        }
        for mapping in &call.outputs {
            if let Some(value) = variables.get(&mapping.source) {
                self.instance.set_variable(&scope, &mapping.target, value.clone())?;
            }
        }
        self.instance.entry_mut(id)?.activity.complete()?;
        Ok(true)
    }

    /// Fail the call activity with the child's unhandled error
    pub(crate) async fn fail_from_child(
        &mut self,
        id: &ActivityInstanceId,
        child_id: &WorkflowInstanceId,
        error: ActivityError,
    ) -> Result<bool, CoreError> {
        if !self.awaiting_child(id, child_id) {
            debug!(instance_id = %self.instance.id, child_id = %child_id, "Ignoring failure of unawaited child");
            return Ok(false);
        }
        self.fail_activity(id, error).await?;
        Ok(true)
    }
}
