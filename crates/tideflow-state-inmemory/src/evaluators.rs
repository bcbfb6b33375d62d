//! JMESPath based condition and script evaluation.

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use tideflow_core::{
    domain::repository::{ConditionEvaluator, ScriptExecutor},
    types::{search_variables, variables_to_json, Variables},
    ActivityError, CoreError,
};

/// Script format understood by [`JmespathScriptExecutor`]
pub const JMESPATH_FORMAT: &str = "jmespath";

/// Evaluates gateway conditions as JMESPath expressions.
///
/// A condition holds when the expression result is truthy (non-empty,
/// non-false, non-null).
#[derive(Debug, Default, Clone, Copy)]
pub struct JmespathConditionEvaluator;

impl JmespathConditionEvaluator {
    /// Create a new evaluator
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConditionEvaluator for JmespathConditionEvaluator {
    async fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool, CoreError> {
        let compiled = jmespath::compile(expression).map_err(|e| {
            CoreError::ConditionEvaluationError(format!("Invalid condition '{}': {}", expression, e))
        })?;
        let result = compiled.search(variables_to_json(variables)).map_err(|e| {
            CoreError::ConditionEvaluationError(format!("Failed to evaluate '{}': {}", expression, e))
        })?;
        let truthy = result.is_truthy();
        trace!(expression, truthy, "Condition evaluated");
        Ok(truthy)
    }
}

/// Runs script tasks written as JMESPath expressions.
///
/// The expression must produce an object; its fields are written back as
/// variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct JmespathScriptExecutor;

impl JmespathScriptExecutor {
    /// Create a new executor
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScriptExecutor for JmespathScriptExecutor {
    async fn execute(
        &self,
        script: &str,
        variables: &Variables,
        format: &str,
    ) -> Result<Variables, ActivityError> {
        if !format.eq_ignore_ascii_case(JMESPATH_FORMAT) {
            return Err(ActivityError::new(
                "ScriptError",
                format!("Unsupported script format: {}", format),
            ));
        }
        match search_variables(script, variables) {
            Ok(Value::Object(fields)) => Ok(fields.into_iter().collect()),
            Ok(Value::Null) => Ok(Variables::new()),
            Ok(other) => Err(ActivityError::new(
                "ScriptError",
                format!("Script must produce an object, got {}", other),
            )),
            Err(e) => Err(ActivityError::new("ScriptError", e.to_string())),
        }
    }
}
