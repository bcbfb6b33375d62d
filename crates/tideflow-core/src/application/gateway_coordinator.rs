//! Successor spawning, parallel join reuse and gateway decisions.

use super::execution_loop::ExecutionContext;
use crate::domain::catalog::{self, ExclusiveDecision, Located, Successor};
use crate::domain::process_definition::{ActivityKind, GatewayDirection, SequenceFlowId};
use crate::domain::workflow_instance::{ActivityInstanceId, WorkflowInstance};
use crate::CoreError;
use tracing::debug;

impl<'a> ExecutionContext<'a> {
    /// Create or reuse the entry a completed activity flows into.
    ///
    /// A parallel join already waiting in the same scope absorbs the token
    /// instead of getting a second entry.
    pub(crate) fn spawn_successor(
        &mut self,
        source_id: &ActivityInstanceId,
        source: Located<'a>,
        successor: Successor<'a>,
    ) -> Result<(), CoreError> {
        let (scope_id, variable_scope) = {
            let entry = self.entry(source_id)?;
            (entry.scope_id.clone(), entry.activity.variable_scope_id.clone())
        };
        let target = successor.activity;
        let flow_id = successor.flow.id.clone();

        let is_join = matches!(target.kind, ActivityKind::ParallelGateway)
            && source.scope.gateway_direction(&target.id)? == GatewayDirection::Join;

        if is_join {
            let waiting = self
                .instance
                .active_entries()
                .find(|e| e.activity_id == target.id && e.scope_id == scope_id && !e.activity.is_terminal())
                .map(|e| e.id.clone());
            if let Some(join_id) = waiting {
                let join = self.instance.entry_mut(&join_id)?;
                join.arrived_flows.push(flow_id);
                if join.activity.is_executing() {
                    join.activity.reset_executing()?;
                }
                let arrived = join.arrived_flows.len();
                debug!(
                    instance_id = %self.instance.id,
                    join = %join_id,
                    arrived,
                    "Token arrived at parallel join"
                );
                return Ok(());
            }
        }

        let forks = matches!(source.activity.kind, ActivityKind::ParallelGateway)
            && source.scope.gateway_direction(&source.activity.id)? == GatewayDirection::Fork;
        let variable_scope = if forks {
            self.instance.clone_scope(&variable_scope)?
        } else {
            variable_scope
        };

        let id = self.instance.add_entry(target.id.clone(), scope_id, variable_scope);
        let entry = self.instance.entry_mut(&id)?;
        if is_join {
            entry.arrived_flows.push(flow_id);
        }
        if matches!(source.activity.kind, ActivityKind::EventBasedGateway) {
            entry.event_gateway = Some(source_id.clone());
        }
        Ok(())
    }

    /// Record one evaluated condition row and complete the gateway once its
    /// decision is known; returns false for stale results
    pub(crate) fn apply_condition_result(
        &mut self,
        gateway: &ActivityInstanceId,
        flow: &SequenceFlowId,
        result: bool,
    ) -> Result<bool, CoreError> {
        let waiting = self
            .instance
            .entry(gateway)
            .map(|e| e.is_active() && e.activity.is_executing())
            .unwrap_or(false);
        if !waiting {
            debug!(instance_id = %self.instance.id, gateway = %gateway, "Ignoring condition result for inactive gateway");
            return Ok(false);
        }
        if !self.instance.record_condition_result(gateway, flow, result) {
            debug!(instance_id = %self.instance.id, gateway = %gateway, flow = %flow, "Condition row unknown or already evaluated");
            return Ok(false);
        }

        let located = self.locate(gateway)?;
        let decision = {
            let instance: &WorkflowInstance = &*self.instance;
            let entry = self.entry(gateway)?;
            catalog::resolve_exclusive(instance, entry, located.scope)?
        };
        if let ExclusiveDecision::Take(taken) = decision {
            debug!(instance_id = %self.instance.id, gateway = %gateway, flow = %taken.id, "Exclusive gateway decided");
            self.instance.entry_mut(gateway)?.activity.complete()?;
        }
        Ok(true)
    }

    /// Cancel the other branches of the event-based gateway `winner` came from
    pub(crate) async fn cancel_event_gateway_siblings(&mut self, winner: &ActivityInstanceId) -> Result<(), CoreError> {
        let Some(gateway) = self.entry(winner)?.event_gateway.clone() else {
            return Ok(());
        };
        let losers: Vec<ActivityInstanceId> = self
            .instance
            .active_entries()
            .filter(|e| e.event_gateway.as_ref() == Some(&gateway) && &e.id != winner)
            .map(|e| e.id.clone())
            .collect();
        for loser in losers {
            self.cancel_entry(&loser, &format!("event-based gateway {} resolved by {}", gateway, winner))
                .await?;
        }
        Ok(())
    }
}
