//! Shared fixtures: a scripted mock LLM and a few well-behaved tools.

#![allow(dead_code)]

use async_trait::async_trait;
use opsagent::{
    AssistantToolCall, ChatMessage, CompletionRequest, Error, Llm, LlmResponse, ParameterType,
    Result, StructuredToolResult, TokenAccountant, TokenCount, Tool, ToolExecutor, ToolRegistry,
    Toolset, ToolsetStatus, StaticToolset, Usage, function_tool,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted completion outcome.
pub enum MockTurn {
    Message(ChatMessage),
    TransientError(u16),
    PermanentError(u16),
}

/// Scripted LLM: plays back queued turns and records every request it saw.
pub struct MockLlm {
    script: Mutex<VecDeque<MockTurn>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
    pub calls: AtomicUsize,
    accountant: TokenAccountant,
    context_window: usize,
    max_output_tokens: usize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            accountant: TokenAccountant::new("gpt-4o"),
            context_window: 128_000,
            max_output_tokens: 4_096,
        }
    }

    /// Shrink the pretend model's limits to force budget pressure.
    pub fn with_limits(mut self, context_window: usize, max_output_tokens: usize) -> Self {
        self.context_window = context_window;
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Queue a plain text answer.
    pub fn push_text(&self, content: &str) {
        self.push(MockTurn::Message(ChatMessage::assistant(content)));
    }

    /// Queue an assistant turn carrying one tool call.
    pub fn push_tool_call(&self, id: &str, name: &str, arguments: &str) {
        self.push_tool_calls(vec![(id, name, arguments)]);
    }

    /// Queue an assistant turn carrying several tool calls.
    pub fn push_tool_calls(&self, calls: Vec<(&str, &str, &str)>) {
        let calls = calls
            .into_iter()
            .map(|(id, name, arguments)| AssistantToolCall::new(id, name, arguments))
            .collect();
        self.push(MockTurn::Message(ChatMessage::assistant_tool_calls(
            None, calls,
        )));
    }

    pub fn push(&self, turn: MockTurn) {
        self.script.lock().unwrap().push_back(turn);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages of the `n`-th request the mock received.
    pub fn request_messages(&self, n: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[n].messages.clone()
    }
}

#[async_trait]
impl Llm for MockLlm {
    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn max_output_tokens(&self) -> usize {
        self.max_output_tokens
    }

    fn count_tokens(&self, messages: &[ChatMessage]) -> TokenCount {
        self.accountant.count_messages(messages)
    }

    async fn completion(&self, request: CompletionRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let turn = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockTurn::PermanentError(500));

        match turn {
            MockTurn::Message(message) => Ok(LlmResponse {
                message,
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            }),
            MockTurn::TransientError(status) => Err(Error::provider_transient(
                format!("mock transient failure ({status})"),
                Some(status),
            )),
            MockTurn::PermanentError(status) => Err(Error::provider_permanent(
                format!("mock permanent failure ({status})"),
                Some(status),
            )),
        }
    }
}

/// Registry + executor over the given tools, all inside one enabled toolset.
pub fn executor_for(tools: Vec<Arc<dyn Tool>>) -> ToolExecutor {
    let toolset = StaticToolset::new("test-toolset", tools);
    toolset.set_status(ToolsetStatus::Enabled);
    let toolsets: Vec<Arc<dyn Toolset>> = vec![Arc::new(toolset)];
    ToolExecutor::new(Arc::new(ToolRegistry::build(&toolsets)))
}

/// Executor with no tools at all.
pub fn empty_executor() -> ToolExecutor {
    ToolExecutor::new(Arc::new(ToolRegistry::empty()))
}

/// `echo{text}` returning its input, counting invocations.
pub fn echo_tool(invocations: Arc<AtomicUsize>) -> Arc<dyn Tool> {
    Arc::new(
        function_tool("echo", "Echo the text back")
            .param("text", ParameterType::String)
            .build(move |params| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    let text = params["text"].as_str().unwrap_or_default().to_string();
                    Ok(StructuredToolResult::success(text))
                }
            }),
    )
}

/// A tool that sleeps, then returns its own name.
pub fn sleep_tool(name: &str, duration: Duration) -> Arc<dyn Tool> {
    let tool_name = name.to_string();
    Arc::new(
        function_tool(name, "Sleep then report").build(move |_| {
            let tool_name = tool_name.clone();
            async move {
                tokio::time::sleep(duration).await;
                Ok(StructuredToolResult::success(tool_name))
            }
        }),
    )
}

/// A tool returning a fixed payload, for truncation pressure.
pub fn bulky_tool(name: &str, payload_len: usize) -> Arc<dyn Tool> {
    Arc::new(
        function_tool(name, "Return a large payload").build(move |_| async move {
            Ok(StructuredToolResult::success("x".repeat(payload_len)))
        }),
    )
}
