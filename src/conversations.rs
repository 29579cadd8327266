//! Follow-up conversations over a completed investigation.
//!
//! After an alert investigation finishes, operators ask follow-up questions
//! ("why did the OOM killer fire?", "which deploy introduced this?"). The
//! follow-up prompt embeds the prior analysis and the tool outputs that
//! grounded it. Those outputs can be enormous, so they are sized against
//! the context window before embedding:
//!
//! 1. Render the prompt with every tool output *omitted* and measure it.
//! 2. Split what remains of the budget across all embedded outputs:
//!    `min(10_000, (context - rendered - max_output) / tool_count)`.
//! 3. Re-render with each output truncated to its share.
//!
//! When nothing was ever run, the prompt embeds the analysis alone and no
//! sizing pass happens.

use crate::llm::Llm;
use crate::truncation::{MAX_TOOL_TOKENS, truncate_data};
use crate::types::{ChatMessage, LlmResult, ToolCallRecord};

/// One tool call as embedded in a follow-up prompt.
#[derive(Debug, Clone)]
pub struct ToolCallSummary {
    pub name: String,
    pub description: String,
    pub output: String,
}

impl From<&ToolCallRecord> for ToolCallSummary {
    fn from(record: &ToolCallRecord) -> Self {
        Self {
            name: record.name.clone(),
            description: record.description.clone(),
            output: record.result.message_payload(),
        }
    }
}

/// A completed investigation: the written analysis plus the tool calls that
/// produced it.
#[derive(Debug, Clone)]
pub struct InvestigationSummary {
    pub analysis: String,
    pub tools: Vec<ToolCallSummary>,
}

impl InvestigationSummary {
    /// Summarize a finished run for follow-up conversations.
    pub fn from_result(result: &LlmResult) -> Self {
        Self {
            analysis: result.result.clone().unwrap_or_default(),
            tools: result.tool_calls.iter().map(ToolCallSummary::from).collect(),
        }
    }
}

/// One prior follow-up exchange.
#[derive(Debug, Clone)]
pub struct ConversationExchange {
    pub ask: String,
    pub answer: InvestigationSummary,
}

/// Token budget for each tool output embedded in a follow-up prompt.
///
/// Whatever the window has left (after the payload-free prompt and the
/// model's output reservation) is split evenly, capped at 10k tokens per
/// output.
pub fn embedded_tool_budget(
    llm: &dyn Llm,
    messages_without_tools: &[ChatMessage],
    tool_count: usize,
) -> usize {
    let available = llm.context_window() as i64
        - llm.count_tokens(messages_without_tools).total as i64
        - llm.max_output_tokens() as i64;
    let share = (available / tool_count.max(1) as i64).max(0) as usize;
    share.min(MAX_TOOL_TOKENS)
}

fn render_tools(out: &mut String, tools: &[ToolCallSummary], budget: Option<usize>) {
    for tool in tools {
        out.push_str("\n### ");
        out.push_str(&tool.description);
        out.push('\n');
        match budget {
            Some(budget) => out.push_str(&truncate_data(&tool.output, budget)),
            None => out.push_str(&tool.output),
        }
        out.push('\n');
    }
}

/// Render the follow-up system prompt. A `tool_budget` of `None` embeds
/// outputs whole; `Some(0)` keeps only the tool framing (the sizing pass).
fn render_followup_prompt(
    investigation: &InvestigationSummary,
    history: &[ConversationExchange],
    tool_budget: Option<usize>,
) -> String {
    let mut prompt = String::from(
        "You are continuing a conversation about a completed investigation. Answer follow-up \
         questions using the investigation findings below; run tools again only when the \
         recorded evidence is not enough.\n\n## Investigation\n",
    );
    prompt.push_str(&investigation.analysis);
    render_tools(&mut prompt, &investigation.tools, tool_budget);

    for exchange in history {
        prompt.push_str("\n## Earlier follow-up\nQ: ");
        prompt.push_str(&exchange.ask);
        prompt.push_str("\nA: ");
        prompt.push_str(&exchange.answer.analysis);
        render_tools(&mut prompt, &exchange.answer.tools, tool_budget);
    }
    prompt
}

/// Compose the message list for a follow-up ask, sizing embedded tool
/// outputs against the context window.
pub fn build_followup_messages(
    llm: &dyn Llm,
    investigation: &InvestigationSummary,
    history: &[ConversationExchange],
    ask: &str,
) -> Vec<ChatMessage> {
    let tool_count =
        investigation.tools.len() + history.iter().map(|e| e.answer.tools.len()).sum::<usize>();

    if tool_count == 0 {
        let prompt = render_followup_prompt(investigation, history, None);
        return vec![ChatMessage::system(prompt), ChatMessage::user(ask)];
    }

    // Pass 1: measure the prompt with all tool framing but no payloads.
    let bare_prompt = render_followup_prompt(investigation, history, Some(0));
    let probe = vec![ChatMessage::system(bare_prompt), ChatMessage::user(ask)];
    let budget = embedded_tool_budget(llm, &probe, tool_count);

    // Pass 2: embed each output cut to its share.
    let prompt = render_followup_prompt(investigation, history, Some(budget));
    vec![ChatMessage::system(prompt), ChatMessage::user(ask)]
}
