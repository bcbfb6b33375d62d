use crate::CoreError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Variables held by a scope or passed across the engine boundary.
///
/// Ordered so that snapshots serialize deterministically.
pub type Variables = BTreeMap<String, Value>;

/// Build a variable map from a JSON object.
///
/// Non-object values produce an empty map.
pub fn variables_from_json(value: Value) -> Variables {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Variables::new(),
    }
}

/// Convert a variable map into a JSON object.
pub fn variables_to_json(variables: &Variables) -> Value {
    Value::Object(
        variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

/// Evaluate a JMESPath expression against a variable map.
pub fn search_variables(expression: &str, variables: &Variables) -> Result<Value, CoreError> {
    let compiled = jmespath::compile(expression).map_err(|e| {
        CoreError::ExpressionError(format!("Invalid expression '{}': {}", expression, e))
    })?;
    let context = variables_to_json(variables);
    let result = compiled.search(&context).map_err(|e| {
        CoreError::ExpressionError(format!("Failed to evaluate '{}': {}", expression, e))
    })?;
    Ok(serde_json::to_value(&*result)?)
}

/// Render a variable value as a correlation key.
///
/// Strings are used verbatim; every other value uses its JSON text.
pub fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JMESPath-style truthiness used for condition results.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}
