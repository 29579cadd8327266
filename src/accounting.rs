//! Token accounting: message counting, model capability limits, and the
//! context-window budget formula.
//!
//! Counts are best-effort by design. They are deterministic for a given
//! (model, messages) pair and additive at message granularity, but they do
//! not promise to match the provider's billing count: a character-based
//! approximation (1 token ≈ 4 characters) is accurate enough for budgeting
//! across model families, and every budget check keeps a safety margin.
//!
//! Context and output limits come from a built-in capability table keyed by
//! model name (with provider-prefix stripping and family fallbacks), and can
//! be overridden through `OPSAGENT_MAX_CONTEXT_TOKENS` /
//! `OPSAGENT_MAX_OUTPUT_TOKENS`, read once at construction.

use crate::types::{ChatMessage, MessageRole, ModelName};
use std::env;
use tracing::{debug, warn};

/// Tokens reserved on top of the model's maximum output when checking
/// whether a message set fits.
pub const SAFETY_MARGIN: usize = 256;

/// Context window used when the model is not in the capability table.
const FALLBACK_CONTEXT_WINDOW: usize = 128_000;

/// Output limit used when the model is not in the capability table.
const FALLBACK_MAX_OUTPUT: usize = 4_096;

/// Per-message token counts, bucketed by role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCount {
    pub total: usize,
    pub system: usize,
    pub user: usize,
    pub assistant: usize,
    pub tool: usize,
    /// Tokens attributable to tool calls embedded in assistant messages.
    pub tool_call: usize,
}

/// Context and output limits for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub context_window: usize,
    pub max_output_tokens: usize,
}

/// Look up capabilities for a model name.
///
/// Exact entries first, then longest-prefix family match, then a 128k/4096
/// fallback with a warning.
pub fn model_capabilities(model: &str) -> ModelCapabilities {
    // (name-or-prefix, context window, max output). Longest prefixes first
    // within a family so e.g. "gpt-4o-mini" wins over "gpt-4o".
    const TABLE: &[(&str, usize, usize)] = &[
        ("gpt-4o-mini", 128_000, 16_384),
        ("gpt-4o", 128_000, 16_384),
        ("gpt-4.1-mini", 1_047_576, 32_768),
        ("gpt-4.1", 1_047_576, 32_768),
        ("gpt-4-turbo", 128_000, 4_096),
        ("gpt-4", 8_192, 4_096),
        ("gpt-3.5-turbo", 16_385, 4_096),
        ("o3-mini", 200_000, 100_000),
        ("o3", 200_000, 100_000),
        ("o4-mini", 200_000, 100_000),
        ("claude-3-5-haiku", 200_000, 8_192),
        ("claude-3-5-sonnet", 200_000, 8_192),
        ("claude-3-7-sonnet", 200_000, 64_000),
        ("claude-sonnet-4", 200_000, 64_000),
        ("claude-opus-4", 200_000, 32_000),
        ("gemini-1.5-pro", 2_097_152, 8_192),
        ("gemini-2.0-flash", 1_048_576, 8_192),
        ("gemini-2.5-pro", 1_048_576, 65_536),
        ("llama-3.1", 128_000, 4_096),
        ("llama3", 8_192, 4_096),
        ("mistral-large", 128_000, 4_096),
        ("qwen2.5", 32_768, 8_192),
        ("deepseek", 65_536, 8_192),
    ];

    // `openai/gpt-4o` and `gpt-4o` share an entry.
    let name = ModelName::family_of(model);

    if let Some((_, context, output)) = TABLE.iter().find(|(entry, _, _)| *entry == name) {
        return ModelCapabilities {
            context_window: *context,
            max_output_tokens: *output,
        };
    }

    if let Some((entry, context, output)) = TABLE
        .iter()
        .filter(|(entry, _, _)| name.starts_with(entry))
        .max_by_key(|(entry, _, _)| entry.len())
    {
        debug!(model = name, family = *entry, "model matched by family prefix");
        return ModelCapabilities {
            context_window: *context,
            max_output_tokens: *output,
        };
    }

    warn!(
        model = name,
        "unknown model, falling back to {FALLBACK_CONTEXT_WINDOW} context / {FALLBACK_MAX_OUTPUT} output tokens"
    );
    ModelCapabilities {
        context_window: FALLBACK_CONTEXT_WINDOW,
        max_output_tokens: FALLBACK_MAX_OUTPUT,
    }
}

fn env_override(var: &str) -> Option<usize> {
    let raw = env::var(var).ok()?;
    match raw.parse::<usize>() {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(_) => {
            warn!(var, value = %raw, "ignoring non-numeric token override");
            None
        }
    }
}

/// Deterministic token accounting for one model.
///
/// Environment overrides are read once, at construction; the accountant is
/// read-only afterwards and safe to share.
#[derive(Debug, Clone)]
pub struct TokenAccountant {
    model: String,
    context_window: usize,
    max_output_tokens: usize,
}

impl TokenAccountant {
    /// Build an accountant for `model`, applying env overrides.
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let capabilities = model_capabilities(&model);
        Self {
            context_window: env_override("OPSAGENT_MAX_CONTEXT_TOKENS")
                .unwrap_or(capabilities.context_window),
            max_output_tokens: env_override("OPSAGENT_MAX_OUTPUT_TOKENS")
                .unwrap_or(capabilities.max_output_tokens),
            model,
        }
    }

    /// The model this accountant was built for.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Maximum input-token capacity for a single completion.
    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Maximum tokens the model may generate in one completion.
    pub fn max_output_tokens(&self) -> usize {
        self.max_output_tokens
    }

    /// Count tokens for a message list, bucketed by role.
    ///
    /// Additive at message granularity: counting a concatenation equals the
    /// sum of counting the parts.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> TokenCount {
        let mut count = TokenCount::default();

        for message in messages {
            let content_tokens = estimate_str(message.content_str());
            let mut call_tokens = 0usize;
            for call in &message.tool_calls {
                // Call framing plus name and serialized arguments.
                call_tokens += 4
                    + estimate_str(&call.function.name)
                    + estimate_str(&call.function.arguments);
            }

            // Role framing costs a few tokens per message on every provider.
            let message_total = 3 + content_tokens + call_tokens;
            count.total += message_total;
            count.tool_call += call_tokens;

            match message.role {
                MessageRole::System => count.system += message_total,
                MessageRole::User => count.user += message_total,
                MessageRole::Assistant => count.assistant += message_total,
                MessageRole::Tool => count.tool += message_total,
            }
        }

        count
    }

    /// Tokens a single string would occupy.
    pub fn count_str(&self, text: &str) -> usize {
        estimate_str(text)
    }

    /// The budget formula:
    ///
    /// ```text
    /// available = context_window - count(messages) - max_output - SAFETY_MARGIN
    /// ```
    ///
    /// Negative means the message set does not fit and the caller must
    /// truncate, compact, or stop.
    pub fn available_tokens(&self, messages: &[ChatMessage]) -> i64 {
        self.context_window as i64
            - self.count_messages(messages).total as i64
            - self.max_output_tokens as i64
            - SAFETY_MARGIN as i64
    }
}

/// Character-based approximation: 1 token ≈ 4 characters, rounded up.
fn estimate_str(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssistantToolCall;

    #[test]
    fn test_routed_names_share_capabilities() {
        assert_eq!(
            model_capabilities("openai/gpt-4o"),
            model_capabilities("gpt-4o")
        );
        assert_eq!(
            model_capabilities("bedrock/claude-3-5-sonnet"),
            model_capabilities("claude-3-5-sonnet")
        );
    }

    #[test]
    fn test_capabilities_exact_and_prefix() {
        let caps = model_capabilities("gpt-4o");
        assert_eq!(caps.context_window, 128_000);
        assert_eq!(caps.max_output_tokens, 16_384);

        // Dated releases fall back to the family entry.
        let caps = model_capabilities("gpt-4o-2024-08-06");
        assert_eq!(caps.context_window, 128_000);

        // Longest prefix wins: -mini is not plain gpt-4o.
        let caps = model_capabilities("gpt-4.1-mini-2025-04-14");
        assert_eq!(caps.max_output_tokens, 32_768);
    }

    #[test]
    fn test_capabilities_unknown_fallback() {
        let caps = model_capabilities("totally-unknown-model");
        assert_eq!(caps.context_window, FALLBACK_CONTEXT_WINDOW);
        assert_eq!(caps.max_output_tokens, FALLBACK_MAX_OUTPUT);
    }

    #[test]
    fn test_count_empty() {
        let accountant = TokenAccountant::new("gpt-4o");
        assert_eq!(accountant.count_messages(&[]).total, 0);
    }

    #[test]
    fn test_count_buckets_by_role() {
        let accountant = TokenAccountant::new("gpt-4o");
        let messages = vec![
            ChatMessage::system("You are an investigator"),
            ChatMessage::user("Why is my pod crashlooping?"),
            ChatMessage::tool("call_1", "kubectl_get", "NAME READY STATUS"),
        ];

        let count = accountant.count_messages(&messages);
        assert!(count.system > 0);
        assert!(count.user > 0);
        assert!(count.tool > 0);
        assert_eq!(count.tool_call, 0);
        assert_eq!(count.total, count.system + count.user + count.tool);
    }

    #[test]
    fn test_count_is_additive() {
        let accountant = TokenAccountant::new("gpt-4o");
        let a = vec![ChatMessage::user("first message")];
        let b = vec![ChatMessage::assistant("second message, a bit longer")];
        let combined: Vec<_> = a.iter().chain(b.iter()).cloned().collect();

        assert_eq!(
            accountant.count_messages(&combined).total,
            accountant.count_messages(&a).total + accountant.count_messages(&b).total
        );
    }

    #[test]
    fn test_count_is_deterministic() {
        let accountant = TokenAccountant::new("gpt-4o");
        let messages = vec![ChatMessage::user("determinism check")];
        assert_eq!(
            accountant.count_messages(&messages),
            accountant.count_messages(&messages)
        );
    }

    #[test]
    fn test_tool_calls_counted() {
        let accountant = TokenAccountant::new("gpt-4o");
        let plain = vec![ChatMessage::assistant("thinking")];
        let with_call = vec![ChatMessage::assistant_tool_calls(
            Some("thinking".to_string()),
            vec![AssistantToolCall::new(
                "call_1",
                "kubectl_get",
                r#"{"resource":"pods"}"#,
            )],
        )];

        let plain_count = accountant.count_messages(&plain);
        let call_count = accountant.count_messages(&with_call);
        assert!(call_count.total > plain_count.total);
        assert!(call_count.tool_call > 0);
    }

    #[test]
    fn test_available_tokens_formula() {
        let accountant = TokenAccountant::new("gpt-4o");
        let available = accountant.available_tokens(&[]);
        assert_eq!(
            available,
            128_000 - 16_384 - SAFETY_MARGIN as i64
        );

        let big = vec![ChatMessage::user("x".repeat(4 * 200_000))];
        assert!(accountant.available_tokens(&big) < 0);
    }
}
