/// Per-trigger execution loop and outbound effects
pub mod execution_loop;

/// Successor spawning and gateway decisions
mod gateway_coordinator;

/// Sub-process scopes, iterations and cancellation
pub mod scope_coordinator;

/// Timers, messages, signals and error boundaries
mod boundary_coordinator;

/// Child workflows of call activities
mod call_activity;

/// Workflow execution service
pub mod workflow_execution_service;

/// Runtime interface for external systems
pub mod runtime_interface;
