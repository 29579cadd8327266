//! Core type definitions for the opsagent runtime.
//!
//! This module contains the data structures shared by every component:
//!
//! # Message System
//!
//! - [`ChatMessage`]: a single item in conversation history, mirroring the
//!   OpenAI chat-completions wire shape
//! - [`MessageRole`]: who sent the message (System, User, Assistant, Tool)
//! - [`AssistantToolCall`] / [`FunctionCall`]: a tool call as emitted by the
//!   model (arguments arrive as a JSON string on the wire)
//!
//! # Run Configuration
//!
//! - [`RunOptions`]: per-run knobs for the agent loop (step budget, tool
//!   choice, temperature, repetition cap, deadline)
//! - [`RunOptionsBuilder`]: builder with validation
//! - [`ToolChoice`]: auto / none / a specific named tool
//!
//! # Results
//!
//! - [`LlmResult`]: the runtime's public return (final answer, full history,
//!   and per-tool-call provenance)
//! - [`ToolCallRecord`]: one executed tool call with its result and token cost
//!
//! # Validated Newtypes
//!
//! [`ModelName`], [`BaseUrl`] and [`Temperature`] validate at construction so
//! misconfiguration is caught before the first request.

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// ============================================================================
// NEWTYPE WRAPPERS FOR COMPILE-TIME TYPE SAFETY
// ============================================================================

/// A model identifier that is safe to put in a request body and look up in
/// the capability table.
///
/// Provider routing prefixes (`openai/gpt-4o`, `bedrock/claude-...`) are
/// legal; [`ModelName::family`] strips them for capability lookups. Names
/// with whitespace are rejected outright, since they can only be a
/// misconfiguration.
///
/// ```
/// use opsagent::ModelName;
///
/// let model: ModelName = "openai/gpt-4o".parse().unwrap();
/// assert_eq!(model.as_str(), "openai/gpt-4o");
/// assert_eq!(model.family(), "gpt-4o");
///
/// assert!("".parse::<ModelName>().is_err());
/// assert!("gpt 4o".parse::<ModelName>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelName(String);

/// Routing prefixes that providers prepend to the bare model name.
const MODEL_ROUTING_PREFIXES: [&str; 4] = ["openai/", "bedrock/", "vertex_ai/", "azure/"];

impl ModelName {
    /// Validate a model identifier.
    ///
    /// # Errors
    ///
    /// Rejects empty names and names containing whitespace.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_input("model name is empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(Error::invalid_input(format!(
                "model name '{name}' contains whitespace"
            )));
        }
        Ok(ModelName(name))
    }

    /// The identifier as configured, routing prefix included.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare model name, with any provider routing prefix stripped.
    /// This is what the capability table keys on.
    pub fn family(&self) -> &str {
        Self::family_of(&self.0)
    }

    /// Prefix stripping for names that have not been validated yet.
    pub fn family_of(name: &str) -> &str {
        for prefix in MODEL_ROUTING_PREFIXES {
            if let Some(bare) = name.strip_prefix(prefix) {
                return bare;
            }
        }
        name
    }
}

impl std::str::FromStr for ModelName {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

/// A chat-completions endpoint base, normalized so path joins are
/// predictable.
///
/// The scheme must be `http` or `https` and a host must follow it; trailing
/// slashes are dropped at construction so [`BaseUrl::join`] never produces
/// doubled separators.
///
/// ```
/// use opsagent::BaseUrl;
///
/// let url = BaseUrl::new("http://localhost:11434/v1/").unwrap();
/// assert_eq!(url.as_str(), "http://localhost:11434/v1");
/// assert_eq!(url.join("chat/completions"), "http://localhost:11434/v1/chat/completions");
///
/// assert!(BaseUrl::new("localhost:11434").is_err());
/// assert!(BaseUrl::new("ftp://host/v1").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseUrl(String);

impl BaseUrl {
    /// Validate and normalize an endpoint base.
    ///
    /// # Errors
    ///
    /// Rejects URLs without an `http`/`https` scheme or with nothing after
    /// the scheme.
    pub fn new(url: impl Into<String>) -> crate::Result<Self> {
        let url = url.into();
        let trimmed = url.trim();

        let scheme = if trimmed.starts_with("http://") {
            "http://"
        } else if trimmed.starts_with("https://") {
            "https://"
        } else {
            return Err(Error::invalid_input(format!(
                "base URL '{url}' must use http or https"
            )));
        };

        let rest = trimmed[scheme.len()..].trim_end_matches('/');
        if rest.is_empty() {
            return Err(Error::invalid_input(format!("base URL '{url}' has no host")));
        }

        Ok(BaseUrl(format!("{scheme}{rest}")))
    }

    /// The normalized base, without a trailing slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a path to the base.
    pub fn join(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }
}

/// A sampling temperature already range-checked against what
/// chat-completions providers accept.
///
/// ```
/// use opsagent::Temperature;
///
/// let temp = Temperature::try_from(0.2).unwrap();
/// assert_eq!(temp.get(), 0.2);
///
/// assert!(Temperature::try_from(-0.1).is_err());
/// assert!(Temperature::try_from(f32::NAN).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature(f32);

impl Temperature {
    /// Fully deterministic sampling.
    pub const MIN: Temperature = Temperature(0.0);

    /// The top of the range chat providers accept.
    pub const MAX: Temperature = Temperature(2.0);

    /// The checked value.
    pub fn get(&self) -> f32 {
        self.0
    }
}

impl TryFrom<f32> for Temperature {
    type Error = Error;

    /// # Errors
    ///
    /// Rejects non-finite values and anything outside `0.0..=2.0`.
    fn try_from(value: f32) -> crate::Result<Self> {
        if !value.is_finite() || !(Self::MIN.0..=Self::MAX.0).contains(&value) {
            return Err(Error::invalid_input(format!(
                "temperature {value} is outside {}..={}",
                Self::MIN.0,
                Self::MAX.0
            )));
        }
        Ok(Temperature(value))
    }
}

// ============================================================================
// MESSAGE SYSTEM
// ============================================================================

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// The function half of a tool call as it appears on the wire.
///
/// `arguments` is a JSON *string*, not a parsed object, because that is
/// what function-calling providers emit. The executor parses it on dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

fn function_call_type() -> String {
    "function".to_string()
}

/// A tool call emitted by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantToolCall {
    /// Provider-issued call id; tool messages answer it by this id.
    pub id: String,

    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,

    pub function: FunctionCall,
}

impl AssistantToolCall {
    /// Construct a call with already-serialized arguments.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A single item in conversation history.
///
/// Mirrors the OpenAI chat-completions message shape so histories serialize
/// directly into requests:
///
/// - `content` may be `None` for assistant messages that only carry tool calls
/// - `tool_calls` is non-empty only on assistant messages
/// - `tool_call_id` and `name` are set only on tool messages, answering a
///   call from the immediately preceding assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<AssistantToolCall>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create an assistant message with text content only.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create an assistant message carrying tool calls (content optional).
    pub fn assistant_tool_calls(
        content: Option<String>,
        tool_calls: Vec<AssistantToolCall>,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a tool message answering `tool_call_id`.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    /// Content as a str, empty when absent.
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

// ============================================================================
// RUN CONFIGURATION
// ============================================================================

/// How the model may select tools on a completion.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolChoice {
    /// The model decides whether and which tools to call.
    #[default]
    Auto,
    /// Tool calling disabled for this completion.
    None,
    /// Force a call to the named tool.
    Required(String),
}

impl ToolChoice {
    /// Wire representation for the completions request.
    pub fn to_wire(&self) -> Value {
        match self {
            ToolChoice::Auto => Value::String("auto".to_string()),
            ToolChoice::None => Value::String("none".to_string()),
            ToolChoice::Required(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name },
            }),
        }
    }
}

/// Default per-request deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);

/// Per-run configuration for the agent loop.
///
/// Construct with [`RunOptions::builder()`]; defaults match the runtime's
/// documented behavior (10 steps, auto tool choice, repetition cap 3,
/// compaction on, 10-minute deadline).
///
/// # Examples
///
/// ```
/// use opsagent::RunOptions;
///
/// let options = RunOptions::builder()
///     .max_steps(5)
///     .temperature(0.2)
///     .build()
///     .unwrap();
/// assert_eq!(options.max_steps, 5);
/// ```
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum LLM completion calls per run (compaction calls excluded).
    pub max_steps: u32,

    /// Tool selection policy passed to the provider.
    pub tool_choice: ToolChoice,

    /// Sampling temperature, provider default when `None`.
    pub temperature: Option<f32>,

    /// Optional JSON schema; when set it is forwarded on completions so the
    /// final answer is JSON-valid against it.
    pub response_format: Option<Value>,

    /// Number of identical (tool, params) executions allowed before calls
    /// are short-circuited with a synthetic error.
    pub repetition_cap: usize,

    /// Whether conversation compaction may run when truncation is not enough.
    pub compaction_enabled: bool,

    /// Hard cap on a single tool result, in tokens.
    pub max_tool_output_tokens: usize,

    /// Overall wall-clock deadline for the run.
    pub deadline: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: 10,
            tool_choice: ToolChoice::Auto,
            temperature: None,
            response_format: None,
            repetition_cap: 3,
            compaction_enabled: true,
            max_tool_output_tokens: crate::truncation::MAX_TOOL_TOKENS,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl RunOptions {
    /// Start building run options.
    pub fn builder() -> RunOptionsBuilder {
        RunOptionsBuilder::default()
    }
}

/// Builder for [`RunOptions`] with validation on `build()`.
#[derive(Debug, Default)]
pub struct RunOptionsBuilder {
    max_steps: Option<u32>,
    tool_choice: Option<ToolChoice>,
    temperature: Option<f32>,
    response_format: Option<Value>,
    repetition_cap: Option<usize>,
    compaction_enabled: Option<bool>,
    max_tool_output_tokens: Option<usize>,
    deadline: Option<Duration>,
}

impl RunOptionsBuilder {
    /// Maximum LLM completion calls per run. Zero returns the prepared
    /// prompt without ever calling the model.
    pub fn max_steps(mut self, steps: u32) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Tool selection policy.
    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    /// Sampling temperature (validated to 0.0..=2.0 at build).
    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    /// JSON schema the final answer must validate against.
    pub fn response_format(mut self, schema: Value) -> Self {
        self.response_format = Some(schema);
        self
    }

    /// Identical-call executions allowed before short-circuiting.
    pub fn repetition_cap(mut self, cap: usize) -> Self {
        self.repetition_cap = Some(cap);
        self
    }

    /// Enable or disable conversation compaction.
    pub fn compaction_enabled(mut self, enabled: bool) -> Self {
        self.compaction_enabled = Some(enabled);
        self
    }

    /// Hard cap on a single tool result, in tokens.
    pub fn max_tool_output_tokens(mut self, tokens: usize) -> Self {
        self.max_tool_output_tokens = Some(tokens);
        self
    }

    /// Overall wall-clock deadline for the run.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range temperature or a zero
    /// repetition cap (a cap of zero would short-circuit every call).
    pub fn build(self) -> crate::Result<RunOptions> {
        if let Some(t) = self.temperature {
            Temperature::try_from(t)?;
        }
        if self.repetition_cap == Some(0) {
            return Err(Error::invalid_input("repetition_cap must be at least 1"));
        }

        let defaults = RunOptions::default();
        Ok(RunOptions {
            max_steps: self.max_steps.unwrap_or(defaults.max_steps),
            tool_choice: self.tool_choice.unwrap_or(defaults.tool_choice),
            temperature: self.temperature,
            response_format: self.response_format,
            repetition_cap: self.repetition_cap.unwrap_or(defaults.repetition_cap),
            compaction_enabled: self
                .compaction_enabled
                .unwrap_or(defaults.compaction_enabled),
            max_tool_output_tokens: self
                .max_tool_output_tokens
                .unwrap_or(defaults.max_tool_output_tokens),
            deadline: self.deadline.unwrap_or(defaults.deadline),
        })
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// One executed tool call, kept for provenance in [`LlmResult`].
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    /// Provider-issued call id.
    pub id: String,

    /// Tool name as requested by the model.
    pub name: String,

    /// User-facing one-liner describing the call, e.g. `kubectl get pods -n prod`.
    pub description: String,

    /// The structured result the tool (or the executor, on failure) produced.
    pub result: crate::tools::StructuredToolResult,

    /// Token count of the tool message appended to history, post-truncation.
    pub token_count: Option<usize>,
}

/// The runtime's public return value.
#[derive(Debug, Clone)]
pub struct LlmResult {
    /// Final assistant content. `None` when the run ended without a text
    /// answer (e.g. `max_steps == 0`).
    pub result: Option<String>,

    /// Full final history, including the system prompt.
    pub messages: Vec<ChatMessage>,

    /// Flat, ordered list of every executed tool call.
    pub tool_calls: Vec<ToolCallRecord>,

    /// Prompt tokens reported by the provider, summed over completions.
    pub prompt_tokens: usize,

    /// Completion tokens reported by the provider, summed over completions.
    pub completion_tokens: usize,
}

impl LlmResult {
    /// Total tokens across all completions in the run.
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}
