//! Context reduction: per-tool output truncation and, when that is not
//! enough, whole-conversation compaction.
//!
//! Two strategies, in order of increasing aggressiveness:
//!
//! 1. **Tool-output truncation.** The remaining budget is split across the
//!    tool results in history; any result over its share is cut at a char
//!    boundary and marked with `…[TRUNCATED: N more chars]` so the model can
//!    recognize incomplete data. Status and params survive, only `data`
//!    shrinks. Truncation is idempotent.
//!
//! 2. **Conversation compaction.** The system prompt is retained verbatim
//!    and the rest of the history is replaced with an LLM-written summary
//!    plus a continuation notice. Compacting an already-compact history
//!    never grows it; a failed compaction call leaves the history untouched
//!    and logs a warning.

use crate::llm::{CompletionRequest, Llm};
use crate::types::{ChatMessage, MessageRole};
use tracing::{debug, warn};

/// Floor for a single tool result's budget, in tokens.
pub const MIN_TOOL_TOKENS: usize = 500;

/// Absolute cap for a single tool result's budget, in tokens.
pub const MAX_TOOL_TOKENS: usize = 10_000;

/// Characters reserved for the truncation marker inside the budget, so a
/// truncated payload still fits and re-truncation is a no-op.
const MARKER_RESERVE: usize = 48;

/// Prompt sent to the model to compact the conversation.
pub const COMPACTION_PROMPT: &str = "Summarize this investigation so it can continue in a fresh \
context. Describe: (1) what was asked, (2) which tools were run and what each one revealed, \
(3) conclusions reached so far, and (4) outstanding goals or hypotheses still to check. \
Be thorough but do not reproduce raw tool output.";

/// Notice appended after the summary so the model knows history was replaced.
pub const COMPACTED_NOTICE: &str =
    "The conversation history has been compacted to preserve available space in the context \
window. Continue.";

/// Per-tool token budget: an even split of the available budget, clamped to
/// `[MIN_TOOL_TOKENS, cap]`.
pub fn per_tool_budget(available_for_tools: i64, pending_tools: usize, cap: usize) -> usize {
    let pending = pending_tools.max(1) as i64;
    let share = (available_for_tools / pending).max(0) as usize;
    share.clamp(MIN_TOOL_TOKENS, cap.max(MIN_TOOL_TOKENS))
}

/// Truncate `data` to roughly `budget_tokens`, appending the marker.
///
/// Idempotent: output always fits the budget, so truncating again returns it
/// unchanged. The cut lands on a char boundary.
pub fn truncate_data(data: &str, budget_tokens: usize) -> String {
    let budget_chars = budget_tokens.saturating_mul(4);
    if data.len() <= budget_chars {
        return data.to_string();
    }

    let mut keep = budget_chars.saturating_sub(MARKER_RESERVE);
    while keep > 0 && !data.is_char_boundary(keep) {
        keep -= 1;
    }

    let removed = data.len() - keep;
    format!("{}…[TRUNCATED: {} more chars]", &data[..keep], removed)
}

/// Shrink oversized tool messages in `messages` so the set fits the budget.
///
/// The budget for tool output is what remains of the context window after
/// the non-tool content, the model's output reservation and the safety
/// margin; it is split evenly across all tool messages and each one over its
/// share is truncated in place. Returns `true` when anything changed.
pub fn truncate_tool_messages(llm: &dyn Llm, messages: &mut [ChatMessage], cap: usize) -> bool {
    let tool_count = messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .count();
    if tool_count == 0 {
        return false;
    }

    // Budget everything that is not tool payload first.
    let without_tool_data: Vec<ChatMessage> = messages
        .iter()
        .map(|m| {
            if m.role == MessageRole::Tool {
                let mut stripped = m.clone();
                stripped.content = Some(String::new());
                stripped
            } else {
                m.clone()
            }
        })
        .collect();

    let available_for_tools = llm.context_window() as i64
        - llm.count_tokens(&without_tool_data).total as i64
        - llm.max_output_tokens() as i64
        - crate::accounting::SAFETY_MARGIN as i64;

    let budget = per_tool_budget(available_for_tools, tool_count, cap);

    let mut changed = false;
    for message in messages.iter_mut() {
        if message.role != MessageRole::Tool {
            continue;
        }
        let content = message.content_str();
        if llm.count_tokens(std::slice::from_ref(message)).total > budget {
            let truncated = truncate_data(content, budget);
            if truncated != content {
                debug!(
                    tool = message.name.as_deref().unwrap_or(""),
                    from = content.len(),
                    to = truncated.len(),
                    "truncated tool output"
                );
                message.content = Some(truncated);
                changed = true;
            }
        }
    }
    changed
}

/// Split off the leading system message, if any.
fn strip_system_prompt(messages: &[ChatMessage]) -> (Vec<ChatMessage>, Option<ChatMessage>) {
    match messages.first() {
        Some(first) if first.role == MessageRole::System => {
            (messages[1..].to_vec(), Some(first.clone()))
        }
        _ => (messages.to_vec(), None),
    }
}

/// Compact the conversation history through the LLM.
///
/// On success the history becomes `[system?, assistant(summary),
/// system(notice)]`. The compacted form is only adopted when it is actually
/// smaller; if the compaction call fails, the original history is returned
/// unchanged and a warning is logged.
pub async fn compact_history(llm: &dyn Llm, messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let (mut history, system_prompt) = strip_system_prompt(messages);
    if history.is_empty() {
        return messages.to_vec();
    }
    history.push(ChatMessage::user(COMPACTION_PROMPT));

    let response = match llm.completion(CompletionRequest::new(history)).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "failed to compact conversation history, keeping original");
            return messages.to_vec();
        }
    };

    let summary = response.message.content_str().to_string();
    if summary.is_empty() {
        warn!("compaction returned an empty summary, keeping original history");
        return messages.to_vec();
    }

    let mut compacted = Vec::with_capacity(3);
    if let Some(system) = system_prompt {
        compacted.push(system);
    }
    compacted.push(ChatMessage::assistant(summary));
    compacted.push(ChatMessage::system(COMPACTED_NOTICE));

    // Compaction must never grow the history.
    let before = llm.count_tokens(messages).total;
    let after = llm.count_tokens(&compacted).total;
    if after >= before {
        debug!(before, after, "compaction did not shrink history, keeping original");
        return messages.to_vec();
    }

    debug!(before, after, "compacted conversation history");
    compacted
}
