//!
//! Tideflow Core - workflow engine for BPMN-style processes
//!
//! This crate holds the process definition model, the workflow instance
//! aggregate, the execution loop that advances instances in response to
//! external triggers, and the per-instance dispatcher that serializes
//! those triggers. Storage, correlation, timers and expression evaluation
//! are collaborator traits implemented by other crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - definitions, instance aggregate and contracts
pub mod domain;

/// Application services - execution loop and dispatcher
pub mod application;

/// Variable maps and expression helpers
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

// Re-export key types
pub use config::EngineConfig;
pub use error::{ActivityError, CoreError};
pub use types::Variables;

// Application interfaces
pub use application::execution_loop::{ActivityRef, ConditionRequest, OutboundEffect, StartWorkflowRequest};
pub use application::runtime_interface::{RuntimeInterface, CHILD_START_FAILED};
pub use application::workflow_execution_service::{
    DomainEventHandler, LoggingEventHandler, Trigger, TriggerOutcome, WorkflowExecutionService,
};

// Re-export main API types for easy use
pub use domain::process_definition::{
    ActivityDefinition, ActivityId, ActivityKind, BoundaryTrigger, CallActivity, MultiInstance,
    ProcessDefinition, ProcessId, ScopeDefinition, SequenceFlow, SequenceFlowId, TimerDefinition,
};
pub use domain::repository::{
    Collaborators, ConditionEvaluator, MessageCorrelationRegistry, MessageSubscription,
    ProcessDefinitionRegistry, ScriptExecutor, SignalCorrelationRegistry, SignalSubscription,
    TimerFired, TimerRegistration, TimerScheduler, VersionedInstance, WorkflowStateStore,
};
pub use domain::workflow_instance::{
    ActivityInstanceId, WorkflowInstance, WorkflowInstanceId, WorkflowStage,
};
