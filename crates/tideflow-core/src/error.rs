use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for the Tideflow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Workflow instance not found
    #[error("Workflow instance not found: {0}")]
    WorkflowInstanceNotFound(String),

    /// Process definition not found
    #[error("Process definition not found: {0}")]
    ProcessDefinitionNotFound(String),

    /// Activity not found in the process definition
    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    /// Activity exists but has no active instance able to accept the call
    #[error("Activity not active: {0}")]
    ActivityNotActive(String),

    /// Illegal activity or workflow lifecycle transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Definition defect that prevents the instance from progressing
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Optimistic write rejected by the state store
    #[error("Version conflict for instance {instance_id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        /// Instance being written
        instance_id: String,
        /// Version the writer read
        expected: Option<u64>,
        /// Version currently stored
        actual: Option<u64>,
    },

    /// Engine invariant violated; not retryable
    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    /// Process definition failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Timer error
    #[error("Timer error: {0}")]
    TimerError(String),

    /// Message or signal correlation error
    #[error("Correlation error: {0}")]
    CorrelationError(String),

    /// Condition evaluation error
    #[error("Condition evaluation error: {0}")]
    ConditionEvaluationError(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

/// A business failure raised by an activity's own work.
///
/// Unlike [`CoreError`], this never aborts the execution loop. It is stored on
/// the failing activity instance and routed through error boundary matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityError {
    /// Error code matched against error boundary events
    pub code: String,
    /// Human readable message
    pub message: String,
}

impl ActivityError {
    /// Create a new activity error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
