//! Tool executor: resolves a named tool, coerces the model's loosely-typed
//! arguments against the declared schema, and contains every failure as an
//! in-band [`StructuredToolResult`] so the loop always continues.

use crate::registry::ToolRegistry;
use crate::tools::{ParameterType, StructuredToolResult, ToolParameter};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Invokes registered tools with validated parameters.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    /// Executor over the given registry.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this executor resolves names against.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// User-facing one-liner for a call, for progress display and provenance.
    pub fn describe(&self, name: &str, params: &Value) -> String {
        match self.registry.lookup(name) {
            Some(tool) => tool.one_liner(params),
            None => name.to_string(),
        }
    }

    /// Invoke `name` with `params`.
    ///
    /// Never returns `Err`: unknown names, schema violations and tool
    /// failures all come back as `Error`-status results with the original
    /// params echoed for traceability. Tools own their I/O deadlines; only
    /// the run-level deadline bounds this call from outside.
    pub async fn invoke(&self, name: &str, params: Value) -> StructuredToolResult {
        let Some(tool) = self.registry.lookup(name) else {
            warn!(tool = name, "model requested unknown tool");
            return StructuredToolResult::error(format!("no tool named {name}"))
                .with_params(params);
        };

        let coerced = match coerce_params(tool.parameters(), &params) {
            Ok(coerced) => coerced,
            Err(message) => {
                return StructuredToolResult::error(message).with_params(params);
            }
        };

        let started = Instant::now();
        let result = match tool.invoke(coerced.clone()).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "tool invocation failed");
                StructuredToolResult::error(e.to_string())
            }
        };
        let elapsed = started.elapsed();
        debug!(tool = name, elapsed_ms = elapsed.as_millis() as u64, status = ?result.status, "tool finished");
        tracing::Span::current().record("elapsed_ms", elapsed.as_millis() as u64);

        if result.params.is_some() {
            result
        } else {
            result.with_params(coerced)
        }
    }
}

/// Shallow coercion of the model's arguments against the declared schema.
///
/// String/number/bool values are converted to the declared scalar type where
/// a lossless reading exists; missing required parameters and uncoercible
/// values produce a descriptive error without invoking the tool. Parameters
/// the tool did not declare pass through untouched.
fn coerce_params(
    schema: &std::collections::BTreeMap<String, ToolParameter>,
    params: &Value,
) -> std::result::Result<Value, String> {
    let supplied = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => return Err(format!("tool arguments must be an object, got {other}")),
    };

    let mut coerced = supplied.clone();

    for (name, parameter) in schema {
        match supplied.get(name) {
            None | Some(Value::Null) => {
                if parameter.required {
                    return Err(format!("missing required parameter '{name}'"));
                }
            }
            Some(value) => {
                let converted = coerce_value(value, parameter.param_type).ok_or_else(|| {
                    format!(
                        "parameter '{name}' has wrong type: expected {}, got {value}",
                        parameter.param_type.as_schema_type()
                    )
                })?;
                coerced.insert(name.clone(), converted);
            }
        }
    }

    Ok(Value::Object(coerced))
}

fn coerce_value(value: &Value, expected: ParameterType) -> Option<Value> {
    match expected {
        ParameterType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        ParameterType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
            Value::Number(n) => {
                let f = n.as_f64()?;
                (f.fract() == 0.0).then(|| serde_json::json!(f as i64))
            }
            Value::String(s) => s.trim().parse::<i64>().ok().map(|n| serde_json::json!(n)),
            _ => None,
        },
        ParameterType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|n| serde_json::json!(n)),
            _ => None,
        },
        ParameterType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ParameterType::Array => value.is_array().then(|| value.clone()),
        ParameterType::Object => value.is_object().then(|| value.clone()),
    }
}
