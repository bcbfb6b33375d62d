use crate::domain::workflow_instance::VariableScopeId;
use crate::{ActivityError, CoreError};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one activity occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    /// Created, decision logic not yet run
    NotStarted,
    /// Running or waiting for an external trigger
    Executing,
    /// Finished normally
    Completed,
    /// Finished with a domain failure
    Failed(ActivityError),
    /// Finished by cancellation
    Cancelled(String),
}

/// Runtime state of one activity occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInstance {
    /// Current lifecycle state
    pub state: ActivityState,
    /// Variable scope the activity reads and writes
    pub variable_scope_id: VariableScopeId,
}

impl ActivityInstance {
    /// Create a not-started activity bound to a variable scope
    pub fn new(variable_scope_id: VariableScopeId) -> Self {
        Self {
            state: ActivityState::NotStarted,
            variable_scope_id,
        }
    }

    /// NotStarted/Completed -> Executing
    pub fn execute(&mut self) -> Result<(), CoreError> {
        match self.state {
            ActivityState::NotStarted | ActivityState::Completed => {
                self.state = ActivityState::Executing;
                Ok(())
            }
            _ => Err(self.invalid("execute")),
        }
    }

    /// Executing -> Completed
    pub fn complete(&mut self) -> Result<(), CoreError> {
        match self.state {
            ActivityState::Executing => {
                self.state = ActivityState::Completed;
                Ok(())
            }
            _ => Err(self.invalid("complete")),
        }
    }

    /// Any -> Failed
    pub fn fail(&mut self, error: ActivityError) {
        self.state = ActivityState::Failed(error);
    }

    /// NotStarted/Executing -> Cancelled
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        match self.state {
            ActivityState::NotStarted | ActivityState::Executing => {
                self.state = ActivityState::Cancelled(reason.into());
                Ok(())
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    /// Executing -> NotStarted, used when a join gateway must re-evaluate
    pub fn reset_executing(&mut self) -> Result<(), CoreError> {
        match self.state {
            ActivityState::Executing => {
                self.state = ActivityState::NotStarted;
                Ok(())
            }
            _ => Err(self.invalid("reset")),
        }
    }

    /// Completed, failed or cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ActivityState::Completed | ActivityState::Failed(_) | ActivityState::Cancelled(_)
        )
    }

    /// Whether the activity is executing
    pub fn is_executing(&self) -> bool {
        self.state == ActivityState::Executing
    }

    /// Whether the activity has not started
    pub fn is_not_started(&self) -> bool {
        self.state == ActivityState::NotStarted
    }

    /// Whether the activity finished normally
    pub fn is_completed(&self) -> bool {
        self.state == ActivityState::Completed
    }

    /// Failure recorded on the activity, if any
    pub fn error(&self) -> Option<&ActivityError> {
        match &self.state {
            ActivityState::Failed(e) => Some(e),
            _ => None,
        }
    }

    fn invalid(&self, operation: &str) -> CoreError {
        CoreError::InvalidTransition(format!(
            "Cannot {} activity in state: {:?}",
            operation, self.state
        ))
    }
}
