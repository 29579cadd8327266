//! # opsagent - Tool-Calling Agent Runtime
//!
//! A runtime for LLM-driven investigation agents: given a question or an
//! alert, it drives a function-calling model through an iterative
//! tool-calling loop, dispatching requested calls into pluggable toolsets,
//! keeping the conversation inside the model's context window, and returning
//! a structured result with full tool-call provenance.
//!
//! ## Key Features
//!
//! - **Multi-turn agent loop**: alternates LLM completions, parallel tool
//!   dispatch, and budget checks until the model answers or a budget runs out
//! - **Pluggable toolsets**: small `Tool`/`Toolset` traits, prerequisite
//!   checks, and a registry that only exposes healthy toolsets
//! - **Context management**: per-tool output truncation and LLM-driven
//!   conversation compaction, with a deterministic token accountant
//! - **Budget enforcement**: step caps, repetition caps, a bounded dispatch
//!   semaphore, and a per-run deadline
//! - **Failure isolation**: tool failures become in-band error results; only
//!   faults that prevent forward progress abort a run
//! - **Sessions**: in-memory conversations keyed by id, serialized per
//!   session, evicted when idle
//! - **Retry Logic**: exponential backoff with jitter for transient provider
//!   faults
//!
//! ## Two Entry Points
//!
//! ### 1. The runtime handle (`AgentRuntime`)
//! One handle per process; both the CLI and an HTTP server front it:
//!
//! ```rust,no_run
//! use opsagent::{AgentRuntime, OpenAiClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> opsagent::Result<()> {
//!     let llm = Arc::new(
//!         OpenAiClient::builder()
//!             .model("gpt-4o")
//!             .build()?,
//!     );
//!
//!     let runtime = AgentRuntime::builder()
//!         .llm(llm)
//!         .build()
//!         .await?;
//!
//!     let result = runtime
//!         .run_agent(None, "Why is the checkout service slow?", None)
//!         .await?;
//!     println!("{}", result.result.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ### 2. The bare loop (`AgentLoop`)
//! For embedders that manage their own prompts and sessions:
//!
//! ```rust,no_run
//! use opsagent::{AgentLoop, ChatMessage, OpenAiClient, ToolExecutor, ToolRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> opsagent::Result<()> {
//!     let llm = Arc::new(OpenAiClient::builder().model("gpt-4o").build()?);
//!     let executor = ToolExecutor::new(Arc::new(ToolRegistry::empty()));
//!
//!     let result = AgentLoop::new(llm, executor)
//!         .run(vec![
//!             ChatMessage::system("You are a helpful assistant"),
//!             ChatMessage::user("hello"),
//!         ])
//!         .await?;
//!     println!("{}", result.result.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **agent**: the loop state machine (completions, bounded parallel tool
//!   dispatch, budget enforcement, cancellation)
//! - **runtime**: the process-wide `AgentRuntime` handle and entry points
//! - **tools**: `Tool`/`Toolset` traits, `FunctionTool` builder, structured
//!   results
//! - **registry** / **executor**: tool lookup and safe invocation
//! - **accounting** / **truncation**: token budgeting, truncation, compaction
//! - **conversations**: follow-up prompts over a completed investigation
//! - **session**: in-memory conversation sessions
//! - **llm**: the `Llm` trait and the OpenAI-compatible reference client
//! - **retry**: exponential backoff for transient provider faults
//! - **error**: the `Error` enum and `Result` alias
//! - **types**: messages, options, results, validated newtypes

mod accounting;
mod agent;
mod conversations;
mod error;
mod executor;
mod llm;
mod registry;
mod runtime;
mod session;
mod tools;
mod truncation;
mod types;

/// Backoff policy for transient provider faults.
/// Public so embedders can tune how hard the loop retries completions.
pub mod retry;

// --- Agent Loop & Runtime ---

pub use agent::{AgentLoop, DEFAULT_TOOL_CONCURRENCY, STEP_LIMIT_NOTE};
pub use conversations::{
    ConversationExchange, InvestigationSummary, ToolCallSummary, build_followup_messages,
    embedded_tool_budget,
};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder, Issue};

// --- Tool System ---

pub use executor::ToolExecutor;
pub use registry::ToolRegistry;
pub use tools::{
    FunctionTool, FunctionToolBuilder, ParameterType, PrerequisiteCheck, StaticToolset,
    StructuredToolResult, Tool, ToolParameter, ToolResultStatus, Toolset, ToolsetStatus,
    function_tool, tool_schema,
};

// --- Context Management ---

pub use accounting::{ModelCapabilities, SAFETY_MARGIN, TokenAccountant, TokenCount, model_capabilities};
pub use truncation::{
    COMPACTED_NOTICE, COMPACTION_PROMPT, MAX_TOOL_TOKENS, MIN_TOOL_TOKENS, compact_history,
    per_tool_budget, truncate_data, truncate_tool_messages,
};

// --- LLM Seam ---

pub use llm::{CompletionRequest, Llm, LlmResponse, OpenAiClient, OpenAiClientBuilder, Usage};

// --- Sessions ---

pub use session::{ConversationSession, DEFAULT_IDLE_TIMEOUT, SessionManager};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Core Types ---

pub use types::{
    AssistantToolCall, BaseUrl, ChatMessage, DEFAULT_DEADLINE, FunctionCall, LlmResult,
    MessageRole, ModelName, RunOptions, RunOptionsBuilder, Temperature, ToolCallRecord, ToolChoice,
};

/// Convenience module containing the most commonly used types and functions.
/// Import with `use opsagent::prelude::*;` to get everything you need for
/// typical usage.
pub mod prelude {
    pub use crate::{
        AgentLoop, AgentRuntime, ChatMessage, Error, FunctionTool, Issue, Llm, LlmResult,
        MessageRole, OpenAiClient, ParameterType, Result, RunOptions, StaticToolset,
        StructuredToolResult, Tool, ToolCallRecord, ToolChoice, ToolExecutor, ToolRegistry,
        ToolResultStatus, Toolset, ToolsetStatus, function_tool,
    };
}
