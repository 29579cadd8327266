//! # Tool System
//!
//! Tools are the capabilities the model may invoke during an investigation.
//! The runtime never depends on a concrete tool: everything goes through two
//! small capability traits.
//!
//! 1. **[`Tool`]**: `{name, description, parameters, invoke}`. Every
//!    invocation returns a [`StructuredToolResult`], the uniform shape the
//!    loop appends to history.
//!
//! 2. **[`Toolset`]**: a named bundle of related tools with lifecycle state:
//!    configured, prerequisites checked, then `Enabled` or `Failed`. Only
//!    enabled toolsets contribute tools to the registry.
//!
//! [`FunctionTool`] is the stock `Tool` implementation: a declared parameter
//! schema plus an async closure handler, built with a fluent builder. It is
//! what embedders and the test suite reach for.
//!
//! ## Handler Pattern
//!
//! `FunctionTool` handlers are stored as
//! `Arc<dyn Fn(Value) -> Pin<Box<dyn Future<...>>> + Send + Sync>`: the `Arc`
//! makes tools cheaply cloneable into the registry, boxing erases each
//! closure's concrete future type, and the `Send + Sync` bounds let sibling
//! tool calls run concurrently on the runtime.
//!
//! ## Example
//!
//! ```rust
//! use opsagent::{function_tool, ParameterType, StructuredToolResult};
//!
//! let echo = function_tool("echo", "Echo the input back")
//!     .param("text", ParameterType::String)
//!     .build(|params| async move {
//!         let text = params["text"].as_str().unwrap_or_default().to_string();
//!         Ok(StructuredToolResult::success(text))
//!     });
//! assert_eq!(echo.name(), "echo");
//! ```

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

// ============================================================================
// STRUCTURED TOOL RESULTS
// ============================================================================

/// Outcome of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Error,
    NoData,
}

/// The uniform return shape for every tool.
///
/// Exactly one of `data` or `error` is meaningful per status: `Success` and
/// `NoData` carry `data` (possibly empty), `Error` carries `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredToolResult {
    pub status: ToolResultStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Echo of the call's arguments, for traceability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Token count of the payload at the time it was appended to history,
    /// set by the loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned_token_count: Option<usize>,
}

impl StructuredToolResult {
    /// Successful result with a data payload.
    pub fn success(data: impl Into<String>) -> Self {
        Self {
            status: ToolResultStatus::Success,
            data: Some(data.into()),
            error: None,
            params: None,
            returned_token_count: None,
        }
    }

    /// Failed result with an error message.
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: ToolResultStatus::Error,
            data: None,
            error: Some(error.into()),
            params: None,
            returned_token_count: None,
        }
    }

    /// The query ran but produced nothing.
    pub fn no_data() -> Self {
        Self {
            status: ToolResultStatus::NoData,
            data: None,
            error: None,
            params: None,
            returned_token_count: None,
        }
    }

    /// Attach the invocation arguments for traceability.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// The payload that goes into the tool message.
    ///
    /// Errors are prefixed so the model can recognize a failed call; a
    /// `NoData` result is represented explicitly rather than as silence.
    pub fn message_payload(&self) -> String {
        match self.status {
            ToolResultStatus::Success => self.data.clone().unwrap_or_default(),
            ToolResultStatus::NoData => self
                .data
                .clone()
                .unwrap_or_else(|| "No data returned".to_string()),
            ToolResultStatus::Error => {
                let error = self.error.as_deref().unwrap_or("unknown error");
                match &self.data {
                    Some(data) if !data.is_empty() => format!("Error: {error}\n{data}"),
                    _ => format!("Error: {error}"),
                }
            }
        }
    }
}

// ============================================================================
// PARAMETER SCHEMA
// ============================================================================

/// JSON-schema-subset types a tool parameter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    /// JSON Schema type name.
    pub fn as_schema_type(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }
}

/// Declared schema for one tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    #[serde(rename = "type")]
    pub param_type: ParameterType,

    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolParameter {
    /// Required parameter of the given type.
    pub fn required(param_type: ParameterType) -> Self {
        Self {
            param_type,
            required: true,
            description: None,
        }
    }

    /// Optional parameter of the given type.
    pub fn optional(param_type: ParameterType) -> Self {
        Self {
            param_type,
            required: false,
            description: None,
        }
    }

    /// Attach a description shown to the model.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Convert a tool's declared parameters to the OpenAI function-calling format.
///
/// Output shape:
///
/// ```json
/// {
///   "type": "function",
///   "function": {
///     "name": "...",
///     "description": "...",
///     "parameters": {
///       "type": "object",
///       "properties": { "param": {"type": "string", "description": "..."} },
///       "required": ["param"]
///     }
///   }
/// }
/// ```
pub fn tool_schema(tool: &dyn Tool) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (name, param) in tool.parameters() {
        let mut prop = serde_json::Map::new();
        prop.insert(
            "type".to_string(),
            Value::String(param.param_type.as_schema_type().to_string()),
        );
        if let Some(description) = &param.description {
            prop.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        properties.insert(name.clone(), Value::Object(prop));
        if param.required {
            required.push(Value::String(name.clone()));
        }
    }

    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name(),
            "description": tool.description(),
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        },
    })
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// An opaque, registered capability the model may invoke.
///
/// Implementations MUST be safe to call concurrently from multiple tasks;
/// the runtime does not serialize calls to the same tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (snake_case by convention).
    fn name(&self) -> &str;

    /// Human-readable description sent to the model.
    fn description(&self) -> &str;

    /// Declared parameter schema, keyed by parameter name.
    ///
    /// A `BTreeMap` keeps the generated schema stable across runs.
    fn parameters(&self) -> &BTreeMap<String, ToolParameter>;

    /// User-facing one-liner for progress display, e.g.
    /// `kubectl get pods -n prod`. Defaults to `name(params)`.
    fn one_liner(&self, params: &Value) -> String {
        format!("{}({})", self.name(), compact_params(params))
    }

    /// Invoke the tool with already-coerced parameters.
    ///
    /// Returning `Err` is equivalent to returning an `Error`-status result;
    /// the executor converts it and the loop continues either way.
    async fn invoke(&self, params: Value) -> Result<StructuredToolResult>;
}

fn compact_params(params: &Value) -> String {
    match params.as_object() {
        Some(map) => map
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
        None => params.to_string(),
    }
}

/// Lifecycle state of a toolset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolsetStatus {
    Enabled,
    Disabled,
    Failed,
}

impl std::fmt::Display for ToolsetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolsetStatus::Enabled => "enabled",
            ToolsetStatus::Disabled => "disabled",
            ToolsetStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a toolset prerequisite check.
#[derive(Debug, Clone, PartialEq)]
pub struct PrerequisiteCheck {
    pub ok: bool,
    pub error: Option<String>,
}

impl PrerequisiteCheck {
    /// Prerequisites satisfied.
    pub fn passed() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// Prerequisites failed with a human-readable reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// A named bundle of related tools with shared configuration and lifecycle.
#[async_trait]
pub trait Toolset: Send + Sync {
    /// Unique toolset name.
    fn name(&self) -> &str;

    /// Whether the user wants this toolset active. Disabled toolsets skip
    /// prerequisite checks entirely.
    fn enabled(&self) -> bool {
        true
    }

    /// The tools this toolset contributes when enabled.
    fn tools(&self) -> Vec<Arc<dyn Tool>>;

    /// Verify external prerequisites (binaries, credentials, reachability).
    async fn check_prerequisites(&self) -> PrerequisiteCheck {
        PrerequisiteCheck::passed()
    }

    /// Current lifecycle status.
    fn status(&self) -> ToolsetStatus;

    /// Record the outcome of a prerequisite check.
    fn set_status(&self, status: ToolsetStatus);

    /// Whether this toolset serves the logs backend role. At most one
    /// logging toolset is registered per runtime.
    fn is_logging(&self) -> bool {
        false
    }

    /// Whether this is a built-in default (as opposed to user-supplied).
    /// A user-supplied logging toolset displaces the default one.
    fn is_default(&self) -> bool {
        false
    }
}

// ============================================================================
// FUNCTION TOOL
// ============================================================================

/// Type alias for function tool handlers.
type ToolHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<StructuredToolResult>> + Send>>
        + Send
        + Sync,
>;

/// Stock [`Tool`] implementation backed by an async closure.
///
/// Immutable after construction; cloning shares the handler through its
/// `Arc`, so tools are cheap to hand to the registry.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: BTreeMap<String, ToolParameter>,
    one_liner: Option<String>,
    handler: ToolHandler,
}

impl FunctionTool {
    /// Create a tool directly; most callers use [`function_tool`] instead.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: BTreeMap<String, ToolParameter>,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StructuredToolResult>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            one_liner: None,
            handler: Arc::new(move |params| Box::pin(handler(params))),
        }
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &BTreeMap<String, ToolParameter> {
        &self.parameters
    }

    fn one_liner(&self, params: &Value) -> String {
        match &self.one_liner {
            Some(template) => render_one_liner(template, params),
            None => format!("{}({})", self.name, compact_params(params)),
        }
    }

    async fn invoke(&self, params: Value) -> Result<StructuredToolResult> {
        (self.handler)(params).await
    }
}

/// Substitute `{param}` placeholders with the invocation's argument values.
fn render_one_liner(template: &str, params: &Value) -> String {
    let mut rendered = template.to_string();
    if let Some(map) = params.as_object() {
        for (key, value) in map {
            let placeholder = format!("{{{key}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &replacement);
        }
    }
    rendered
}

/// Builder for [`FunctionTool`] with a fluent API.
///
/// ```rust
/// use opsagent::{function_tool, ParameterType, StructuredToolResult};
///
/// let tool = function_tool("fetch_logs", "Fetch logs for a pod")
///     .param("pod", ParameterType::String)
///     .optional_param("tail", ParameterType::Integer)
///     .one_liner("fetch logs for pod {pod}")
///     .build(|params| async move {
///         Ok(StructuredToolResult::success(format!("logs for {}", params["pod"])))
///     });
/// ```
pub struct FunctionToolBuilder {
    name: String,
    description: String,
    parameters: BTreeMap<String, ToolParameter>,
    one_liner: Option<String>,
}

impl FunctionToolBuilder {
    /// Add a required parameter.
    pub fn param(mut self, name: &str, param_type: ParameterType) -> Self {
        self.parameters
            .insert(name.to_string(), ToolParameter::required(param_type));
        self
    }

    /// Add an optional parameter.
    pub fn optional_param(mut self, name: &str, param_type: ParameterType) -> Self {
        self.parameters
            .insert(name.to_string(), ToolParameter::optional(param_type));
        self
    }

    /// Add a fully-specified parameter.
    pub fn parameter(mut self, name: &str, parameter: ToolParameter) -> Self {
        self.parameters.insert(name.to_string(), parameter);
        self
    }

    /// User-facing one-liner template with `{param}` placeholders.
    pub fn one_liner(mut self, template: impl Into<String>) -> Self {
        self.one_liner = Some(template.into());
        self
    }

    /// Finalize with the handler.
    pub fn build<F, Fut>(self, handler: F) -> FunctionTool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StructuredToolResult>> + Send + 'static,
    {
        let mut tool = FunctionTool::new(self.name, self.description, self.parameters, handler);
        tool.one_liner = self.one_liner;
        tool
    }
}

/// Create a tool using the builder pattern.
pub fn function_tool(
    name: impl Into<String>,
    description: impl Into<String>,
) -> FunctionToolBuilder {
    FunctionToolBuilder {
        name: name.into(),
        description: description.into(),
        parameters: BTreeMap::new(),
        one_liner: None,
    }
}

// ============================================================================
// STATIC TOOLSET
// ============================================================================

/// Stock [`Toolset`] bundling pre-built tools with no prerequisites.
///
/// Status starts `Disabled` and flips to `Enabled`/`Failed` once the runtime
/// runs the prerequisite check.
pub struct StaticToolset {
    name: String,
    enabled: bool,
    tools: Vec<Arc<dyn Tool>>,
    status: Mutex<ToolsetStatus>,
    logging: bool,
    default: bool,
}

impl StaticToolset {
    /// Bundle the given tools under a toolset name.
    pub fn new(name: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            tools,
            status: Mutex::new(ToolsetStatus::Disabled),
            logging: false,
            default: false,
        }
    }

    /// Mark the toolset as user-disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Mark the toolset as serving the logs backend role.
    pub fn logging(mut self) -> Self {
        self.logging = true;
        self
    }

    /// Mark the toolset as a built-in default.
    pub fn default_builtin(mut self) -> Self {
        self.default = true;
        self
    }
}

#[async_trait]
impl Toolset for StaticToolset {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }

    fn status(&self) -> ToolsetStatus {
        *self.status.lock().expect("toolset status lock poisoned")
    }

    fn set_status(&self, status: ToolsetStatus) {
        *self.status.lock().expect("toolset status lock poisoned") = status;
    }

    fn is_logging(&self) -> bool {
        self.logging
    }

    fn is_default(&self) -> bool {
        self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_function_tool_invoke() {
        let add = function_tool("add", "Add two numbers")
            .param("a", ParameterType::Number)
            .param("b", ParameterType::Number)
            .build(|params| async move {
                let a = params["a"].as_f64().unwrap_or(0.0);
                let b = params["b"].as_f64().unwrap_or(0.0);
                Ok(StructuredToolResult::success(format!("{}", a + b)))
            });

        let result = add.invoke(json!({"a": 5.0, "b": 3.0})).await.unwrap();
        assert_eq!(result.status, ToolResultStatus::Success);
        assert_eq!(result.data.as_deref(), Some("8"));
    }

    #[test]
    fn test_tool_schema_format() {
        let tool = function_tool("search", "Search for information")
            .parameter(
                "query",
                ToolParameter::required(ParameterType::String).with_description("What to find"),
            )
            .optional_param("limit", ParameterType::Integer)
            .build(|_| async { Ok(StructuredToolResult::no_data()) });

        let schema = tool_schema(&tool);
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "search");
        assert_eq!(
            schema["function"]["parameters"]["properties"]["query"]["type"],
            "string"
        );
        assert_eq!(
            schema["function"]["parameters"]["properties"]["query"]["description"],
            "What to find"
        );
        assert_eq!(
            schema["function"]["parameters"]["required"],
            json!(["query"])
        );
    }

    #[test]
    fn test_one_liner_template() {
        let tool = function_tool("kubectl_get", "Get resources")
            .param("resource", ParameterType::String)
            .optional_param("namespace", ParameterType::String)
            .one_liner("kubectl get {resource} -n {namespace}")
            .build(|_| async { Ok(StructuredToolResult::no_data()) });

        let line = tool.one_liner(&json!({"resource": "pods", "namespace": "prod"}));
        assert_eq!(line, "kubectl get pods -n prod");
    }

    #[test]
    fn test_one_liner_default() {
        let tool = function_tool("echo", "Echo")
            .param("text", ParameterType::String)
            .build(|_| async { Ok(StructuredToolResult::no_data()) });

        assert_eq!(tool.one_liner(&json!({"text": "hi"})), r#"echo(text="hi")"#);
    }

    #[test]
    fn test_structured_result_payload() {
        let ok = StructuredToolResult::success("all good");
        assert_eq!(ok.message_payload(), "all good");

        let err = StructuredToolResult::error("connection refused");
        assert_eq!(err.message_payload(), "Error: connection refused");

        let empty = StructuredToolResult::no_data();
        assert_eq!(empty.message_payload(), "No data returned");

        // Zero-byte data is a valid success payload, not an error.
        let zero = StructuredToolResult::success("");
        assert_eq!(zero.status, ToolResultStatus::Success);
        assert_eq!(zero.message_payload(), "");
    }

    #[test]
    fn test_static_toolset_lifecycle() {
        let toolset = StaticToolset::new("kubernetes", vec![]);
        assert_eq!(toolset.status(), ToolsetStatus::Disabled);
        toolset.set_status(ToolsetStatus::Enabled);
        assert_eq!(toolset.status(), ToolsetStatus::Enabled);
        assert!(toolset.enabled());
        assert!(!toolset.is_logging());
    }
}
