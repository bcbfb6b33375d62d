//! Decision logic per activity kind.
//!
//! Everything here is pure: functions read the instance and the definition
//! and answer with [`ExecutionCommand`]s or successor lists. Only the
//! execution loop mutates state.

use crate::domain::command::{EventBinding, ExecutionCommand};
use crate::domain::process_definition::{
    ActivityDefinition, ActivityKind, BoundaryTrigger, GatewayDirection, MultiInstance,
    ProcessDefinition, ScopeDefinition, SequenceFlow,
};
use crate::domain::workflow_instance::{ActivityInstanceEntry, ActivityInstanceId, WorkflowInstance};
use crate::{ActivityError, CoreError};
use serde_json::{json, Value};

/// An activity definition together with the scope it lives in
#[derive(Debug, Clone, Copy)]
pub struct Located<'d> {
    /// The activity
    pub activity: &'d ActivityDefinition,
    /// Scope whose flows connect the activity
    pub scope: &'d ScopeDefinition,
}

/// A flow to follow and the activity it leads to
#[derive(Debug, Clone, Copy)]
pub struct Successor<'d> {
    /// Flow taken
    pub flow: &'d SequenceFlow,
    /// Target activity
    pub activity: &'d ActivityDefinition,
}

/// Outcome of exclusive gateway resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveDecision<'d> {
    /// Some relevant condition row has no result yet
    Pending,
    /// The flow to take
    Take(&'d SequenceFlow),
}

/// Find the definition of an entry by walking its owning scopes
pub fn locate<'d>(
    definition: &'d ProcessDefinition,
    instance: &WorkflowInstance,
    entry_id: &ActivityInstanceId,
) -> Result<Located<'d>, CoreError> {
    let entry = instance
        .entry(entry_id)
        .ok_or_else(|| CoreError::StructuralViolation(format!("Unknown activity instance: {}", entry_id)))?;

    let scope = match &entry.scope_id {
        None => &definition.scope,
        Some(owner_id) => {
            let owner = locate(definition, instance, owner_id)?;
            match &owner.activity.kind {
                ActivityKind::SubProcess(scope) => scope,
                ActivityKind::MultiInstance(mi) if mi.inner.id == entry.activity_id => {
                    return Ok(Located {
                        activity: &mi.inner,
                        scope: owner.scope,
                    });
                }
                _ => {
                    return Err(CoreError::StructuralViolation(format!(
                        "Activity instance {} is owned by {} which opens no scope",
                        entry_id, owner_id
                    )))
                }
            }
        }
    };

    let activity = scope
        .activity(&entry.activity_id)
        .ok_or_else(|| CoreError::ActivityNotFound(entry.activity_id.0.clone()))?;
    Ok(Located { activity, scope })
}

/// Commands to run when an activity instance starts executing.
///
/// `max_iterations` bounds the number of multi-instance iterations.
pub fn decide(
    instance: &WorkflowInstance,
    entry: &ActivityInstanceEntry,
    activity: &ActivityDefinition,
    scope: &ScopeDefinition,
    max_iterations: usize,
) -> Result<Vec<ExecutionCommand>, CoreError> {
    let mut commands = Vec::new();
    match &activity.kind {
        ActivityKind::StartEvent | ActivityKind::EventBasedGateway | ActivityKind::Boundary(_) => {
            commands.push(ExecutionCommand::CompleteActivity);
        }
        ActivityKind::EndEvent { terminate } => {
            commands.push(ExecutionCommand::CompleteActivity);
            if *terminate {
                commands.push(ExecutionCommand::CompleteWorkflow);
            }
        }
        ActivityKind::Task => {
            commands.extend(boundary_registrations(activity, scope));
        }
        ActivityKind::ScriptTask(task) => {
            commands.extend(boundary_registrations(activity, scope));
            commands.push(ExecutionCommand::ExecuteScript {
                script: task.script.clone(),
                format: task.format.clone(),
            });
        }
        ActivityKind::ExclusiveGateway => {
            let conditional: Vec<&SequenceFlow> = scope
                .outgoing(&activity.id)
                .into_iter()
                .filter(|f| f.condition.is_some())
                .collect();
            if conditional.is_empty() {
                commands.push(ExecutionCommand::CompleteActivity);
            } else {
                commands.push(ExecutionCommand::AddConditions {
                    flows: conditional.iter().map(|f| f.id.clone()).collect(),
                });
                for flow in conditional {
                    if let Some(expression) = &flow.condition {
                        commands.push(ExecutionCommand::EvaluateCondition {
                            flow_id: flow.id.clone(),
                            expression: expression.clone(),
                        });
                    }
                }
            }
        }
        ActivityKind::ParallelGateway => match scope.gateway_direction(&activity.id)? {
            GatewayDirection::Fork => commands.push(ExecutionCommand::CompleteActivity),
            GatewayDirection::Join => {
                let synchronized = scope
                    .incoming(&activity.id)
                    .iter()
                    .all(|f| entry.arrived_flows.contains(&f.id));
                if synchronized {
                    commands.push(ExecutionCommand::CompleteActivity);
                }
            }
        },
        ActivityKind::TimerCatch(timer) => commands.push(ExecutionCommand::RegisterTimer {
            timer: timer.clone(),
            binding: EventBinding::catch_event(),
        }),
        ActivityKind::MessageCatch { message } => commands.push(ExecutionCommand::RegisterMessage {
            message: message.clone(),
            binding: EventBinding::catch_event(),
        }),
        ActivityKind::SignalCatch { signal } => commands.push(ExecutionCommand::RegisterSignal {
            signal: signal.clone(),
            binding: EventBinding::catch_event(),
        }),
        ActivityKind::SignalThrow { signal } => {
            commands.push(ExecutionCommand::ThrowSignal {
                signal: signal.clone(),
            });
            commands.push(ExecutionCommand::CompleteActivity);
        }
        ActivityKind::SubProcess(_) => {
            commands.extend(boundary_registrations(activity, scope));
            commands.push(ExecutionCommand::OpenScope);
        }
        ActivityKind::CallActivity(call) => {
            commands.extend(boundary_registrations(activity, scope));
            commands.push(ExecutionCommand::StartChildWorkflow {
                process_id: call.process_id.clone(),
                inputs: call.inputs.clone(),
                propagate_all: call.propagate_all_inputs,
            });
        }
        ActivityKind::MultiInstance(mi) => {
            commands.extend(boundary_registrations(activity, scope));
            let collection = instance.variable(&entry.activity.variable_scope_id, &mi.collection);
            check_iteration_limit(mi, collection, max_iterations)?;
            match collection_elements(mi, collection) {
                Ok(elements) if elements.is_empty() => {
                    commands.push(ExecutionCommand::CompleteActivity)
                }
                Ok(elements) => commands.push(ExecutionCommand::SpawnIterations {
                    elements,
                    sequential: mi.sequential,
                }),
                Err(error) => commands.push(ExecutionCommand::FailActivity(error)),
            }
        }
    }
    Ok(commands)
}

/// Successors of a completed activity instance
pub fn next_activities<'d>(
    instance: &WorkflowInstance,
    entry: &ActivityInstanceEntry,
    activity: &ActivityDefinition,
    scope: &'d ScopeDefinition,
) -> Result<Vec<Successor<'d>>, CoreError> {
    // iterations report to their wrapper instead of following flows
    if entry.iteration.is_some() {
        return Ok(Vec::new());
    }

    let outgoing = scope.outgoing(&activity.id);
    let flows = match &activity.kind {
        ActivityKind::ExclusiveGateway if !outgoing.is_empty() => {
            match resolve_exclusive(instance, entry, scope)? {
                ExclusiveDecision::Take(flow) => vec![flow],
                ExclusiveDecision::Pending => {
                    return Err(CoreError::StructuralViolation(format!(
                        "Exclusive gateway {} completed before its decision",
                        entry.id
                    )))
                }
            }
        }
        _ => outgoing,
    };

    flows
        .into_iter()
        .map(|flow| {
            scope
                .activity(&flow.target)
                .map(|activity| Successor { flow, activity })
                .ok_or_else(|| CoreError::ActivityNotFound(flow.target.0.clone()))
        })
        .collect()
}

/// Decide which flow an exclusive gateway takes.
///
/// Rows are consulted in definition order; the first true row wins once
/// every row before it has evaluated false. With every row false the
/// default flow is taken, and without one the gateway is misconfigured.
pub fn resolve_exclusive<'d>(
    instance: &WorkflowInstance,
    gateway: &ActivityInstanceEntry,
    scope: &'d ScopeDefinition,
) -> Result<ExclusiveDecision<'d>, CoreError> {
    let outgoing = scope.outgoing(&gateway.activity_id);
    let rows = instance.condition_rows(&gateway.id);

    for flow in outgoing.iter().copied().filter(|f| f.condition.is_some()) {
        match rows.iter().find(|r| r.flow_id == flow.id) {
            Some(row) if row.evaluated && row.result => return Ok(ExclusiveDecision::Take(flow)),
            Some(row) if row.evaluated => {}
            _ => return Ok(ExclusiveDecision::Pending),
        }
    }

    default_flow(&outgoing)
        .map(ExclusiveDecision::Take)
        .ok_or_else(|| {
            CoreError::ConfigurationError(format!(
                "Exclusive gateway {} has no true condition and no default flow",
                gateway.activity_id
            ))
        })
}

fn default_flow<'d>(outgoing: &[&'d SequenceFlow]) -> Option<&'d SequenceFlow> {
    if let Some(flow) = outgoing.iter().copied().find(|f| f.is_default) {
        return Some(flow);
    }
    let mut unconditional = outgoing.iter().copied().filter(|f| f.condition.is_none());
    match (unconditional.next(), unconditional.next()) {
        (Some(flow), None) => Some(flow),
        _ => None,
    }
}

fn boundary_registrations(activity: &ActivityDefinition, scope: &ScopeDefinition) -> Vec<ExecutionCommand> {
    scope
        .boundaries_of(&activity.id)
        .into_iter()
        .filter_map(|(boundary, event)| {
            let binding = EventBinding::boundary(boundary.id.clone(), event.cancel_activity);
            match &event.trigger {
                BoundaryTrigger::Timer(timer) => Some(ExecutionCommand::RegisterTimer {
                    timer: timer.clone(),
                    binding,
                }),
                BoundaryTrigger::Message(message) => Some(ExecutionCommand::RegisterMessage {
                    message: message.clone(),
                    binding,
                }),
                BoundaryTrigger::Signal(signal) => Some(ExecutionCommand::RegisterSignal {
                    signal: signal.clone(),
                    binding,
                }),
                BoundaryTrigger::Error(_) => None,
            }
        })
        .collect()
}

fn check_iteration_limit(mi: &MultiInstance, collection: Option<&Value>, max_iterations: usize) -> Result<(), CoreError> {
    let count = match collection {
        Some(Value::Array(items)) => items.len() as u64,
        Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
        _ => return Ok(()),
    };
    if count > max_iterations as u64 {
        return Err(CoreError::ConfigurationError(format!(
            "Collection '{}' asks for {} iterations, the limit is {}",
            mi.collection, count, max_iterations
        )));
    }
    Ok(())
}

fn collection_elements(mi: &MultiInstance, collection: Option<&Value>) -> Result<Vec<Value>, ActivityError> {
    match collection {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Number(n)) if n.as_u64().is_some() => {
            let count = n.as_u64().unwrap_or_default();
            Ok((0..count).map(|i| json!(i)).collect())
        }
        _ => Err(ActivityError::new(
            "MultiInstanceError",
            format!(
                "Collection variable '{}' is missing or not a list",
                mi.collection
            ),
        )),
    }
}
