//! The agent loop: drives the LLM ↔ tool dialogue until the model answers,
//! a budget runs out, or the caller cancels.
//!
//! Each iteration is one step of the state machine:
//!
//! ```text
//! START     ensure the messages fit the context budget, call the LLM
//! AWAIT_LLM no tool calls  -> DONE (final answer)
//!           tool calls     -> DISPATCH
//! DISPATCH  run every requested call concurrently (bounded), re-serialize
//!           results in emission order, append assistant + tool messages
//! BUDGET    truncate oversized tool output; compact if still over; give up
//!           with ContextExceeded if compaction was not enough
//!           -> START (one fewer step remaining)
//! ```
//!
//! Nothing from an interrupted iteration is committed: cancellation and the
//! run deadline abort at the next suspension point and return the history as
//! of the last fully-completed iteration.

use crate::executor::ToolExecutor;
use crate::llm::{CompletionRequest, Llm, LlmResponse};
use crate::retry::ProviderRetry;
use crate::tools::StructuredToolResult;
use crate::truncation::{compact_history, truncate_tool_messages};
use crate::types::{
    AssistantToolCall, ChatMessage, LlmResult, MessageRole, RunOptions, ToolCallRecord,
};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

/// Default bound on concurrently executing tool calls per process.
pub const DEFAULT_TOOL_CONCURRENCY: usize = 16;

/// Appended to the result when the step budget runs out mid-investigation.
pub const STEP_LIMIT_NOTE: &str = "[Investigation interrupted: the maximum number of reasoning \
steps was reached before the agent finished. The findings above may be incomplete.]";

/// The budget formula from the token accountant, over a trait object.
fn available_tokens(llm: &dyn Llm, messages: &[ChatMessage]) -> i64 {
    llm.context_window() as i64
        - llm.count_tokens(messages).total as i64
        - llm.max_output_tokens() as i64
        - crate::accounting::SAFETY_MARGIN as i64
}

/// Canonical fingerprint of a call's parameters.
///
/// `serde_json` objects are backed by a sorted map, so serializing the parsed
/// value yields a key-order-independent string.
fn canonical_params(params: &Value) -> String {
    params.to_string()
}

enum Pending {
    /// Short-circuited before spawning (bad arguments, repetition cap).
    Ready(StructuredToolResult),
    /// Running on its own task, permit-bounded.
    Task(JoinHandle<StructuredToolResult>),
}

/// Drives one run of the LLM ↔ tool dialogue.
///
/// The loop borrows the executor's registry for its lifetime but owns no
/// tools; an in-flight run keeps using the registry it started with even if
/// the runtime swaps in a refreshed one.
///
/// # Examples
///
/// ```rust,no_run
/// use opsagent::{AgentLoop, ChatMessage, OpenAiClient, ToolExecutor, ToolRegistry};
/// use std::sync::Arc;
///
/// # async fn example() -> opsagent::Result<()> {
/// let llm = Arc::new(OpenAiClient::builder().model("gpt-4o").build()?);
/// let executor = ToolExecutor::new(Arc::new(ToolRegistry::empty()));
/// let agent = AgentLoop::new(llm, executor);
///
/// let result = agent
///     .run(vec![
///         ChatMessage::system("You are an SRE investigator."),
///         ChatMessage::user("Why is checkout latency up?"),
///     ])
///     .await?;
/// println!("{}", result.result.unwrap_or_default());
/// # Ok(())
/// # }
/// ```
pub struct AgentLoop {
    llm: Arc<dyn Llm>,
    executor: ToolExecutor,
    options: RunOptions,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    retry: ProviderRetry,
}

impl AgentLoop {
    /// Loop with default options, its own cancellation token, and a private
    /// dispatch semaphore.
    pub fn new(llm: Arc<dyn Llm>, executor: ToolExecutor) -> Self {
        Self::with_options(llm, executor, RunOptions::default())
    }

    /// Loop with explicit options. The backoff policy is capped against the
    /// run deadline so retries cannot eat the whole run.
    pub fn with_options(llm: Arc<dyn Llm>, executor: ToolExecutor, options: RunOptions) -> Self {
        let retry = ProviderRetry::default().capped_by_deadline(options.deadline);
        Self {
            llm,
            executor,
            options,
            semaphore: Arc::new(Semaphore::new(DEFAULT_TOOL_CONCURRENCY)),
            cancel: CancellationToken::new(),
            retry,
        }
    }

    /// Share a process-wide dispatch semaphore instead of a private one.
    pub fn with_semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.semaphore = semaphore;
        self
    }

    /// Use the caller's cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the provider retry policy.
    pub fn with_retry(mut self, retry: ProviderRetry) -> Self {
        self.retry = retry.capped_by_deadline(self.options.deadline);
        self
    }

    /// A token that cancels this run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the dialogue to completion.
    ///
    /// Terminal outcomes:
    /// - the model answers without tool calls → `Ok`, `result` is the answer
    /// - the step budget runs out → `Ok` with [`STEP_LIMIT_NOTE`] appended
    /// - the messages cannot fit even after compaction → `ContextExceeded`
    /// - provider error after retries → the provider error
    /// - cancellation or deadline → `Cancelled` with the history as of the
    ///   last completed iteration
    pub async fn run(&self, mut messages: Vec<ChatMessage>) -> Result<LlmResult> {
        let deadline = Instant::now() + self.options.deadline;
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut fingerprints: HashMap<(String, String), usize> = HashMap::new();
        let mut prompt_tokens = 0usize;
        let mut completion_tokens = 0usize;

        if self.options.max_steps == 0 {
            return Ok(LlmResult {
                result: None,
                messages,
                tool_calls: records,
                prompt_tokens,
                completion_tokens,
            });
        }

        self.ensure_fit(&mut messages, deadline).await?;

        let mut steps_remaining = self.options.max_steps;
        loop {
            let iteration = self.options.max_steps - steps_remaining + 1;
            let span = info_span!("agent_iteration", iteration);

            let request = CompletionRequest {
                messages: messages.clone(),
                tools: self.executor.registry().schemas().to_vec(),
                tool_choice: self.options.tool_choice.clone(),
                response_format: self.options.response_format.clone(),
                temperature: self.options.temperature,
            };
            let response = self
                .guarded(deadline, &messages, self.completion_with_retry(&request))
                .instrument(span.clone())
                .await?;

            prompt_tokens += response.usage.prompt_tokens;
            completion_tokens += response.usage.completion_tokens;

            let mut assistant = response.message;
            assistant.role = MessageRole::Assistant;

            if assistant.tool_calls.is_empty() {
                let result = assistant.content.clone();
                messages.push(assistant);
                return Ok(LlmResult {
                    result,
                    messages,
                    tool_calls: records,
                    prompt_tokens,
                    completion_tokens,
                });
            }

            debug!(
                calls = assistant.tool_calls.len(),
                iteration, "dispatching tool calls"
            );
            let tool_messages = self
                .dispatch(
                    deadline,
                    &messages,
                    &assistant.tool_calls,
                    &mut fingerprints,
                    &mut records,
                )
                .instrument(span)
                .await?;

            // The iteration commits atomically: assistant message and its
            // tool answers land together, in emission order.
            messages.push(assistant);
            messages.extend(tool_messages);

            steps_remaining -= 1;
            if steps_remaining == 0 {
                warn!(
                    max_steps = self.options.max_steps,
                    "step budget exhausted before a final answer"
                );
                return Ok(LlmResult {
                    result: Some(STEP_LIMIT_NOTE.to_string()),
                    messages,
                    tool_calls: records,
                    prompt_tokens,
                    completion_tokens,
                });
            }

            self.ensure_fit(&mut messages, deadline).await?;
        }
    }

    /// One completion, re-attempted on transient provider faults until the
    /// backoff budget runs out. Runs inside the cancellation/deadline guard,
    /// so a cancelled run never sits out a backoff sleep.
    async fn completion_with_retry(&self, request: &CompletionRequest) -> Result<LlmResponse> {
        let mut attempt = 0u32;
        loop {
            match self.llm.completion(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    let Some(delay) = self.retry.backoff(attempt) else {
                        return Err(e);
                    };
                    warn!(attempt, error = %e, "transient provider error, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run every tool call of one assistant turn.
    ///
    /// Calls run as sibling tasks bounded by the semaphore; results are
    /// awaited in the order the model emitted the calls, so the appended
    /// tool messages match the emission order no matter which task finished
    /// first. Nothing is committed to `committed` here, so on cancellation
    /// the whole phase is discarded.
    async fn dispatch(
        &self,
        deadline: Instant,
        committed: &[ChatMessage],
        calls: &[AssistantToolCall],
        fingerprints: &mut HashMap<(String, String), usize>,
        records: &mut Vec<ToolCallRecord>,
    ) -> Result<Vec<ChatMessage>> {
        let mut pending: Vec<(usize, Value, Pending)> = Vec::with_capacity(calls.len());

        for (index, call) in calls.iter().enumerate() {
            let name = call.function.name.clone();
            let params: Value = match serde_json::from_str(&call.function.arguments) {
                Ok(value) => value,
                Err(e) => {
                    let result = StructuredToolResult::error(format!(
                        "could not parse tool arguments as JSON: {e}"
                    ));
                    pending.push((index, Value::Null, Pending::Ready(result)));
                    continue;
                }
            };

            let fingerprint = (name.clone(), canonical_params(&params));
            let seen = fingerprints.entry(fingerprint).or_insert(0);
            if *seen >= self.options.repetition_cap {
                warn!(tool = %name, count = *seen, "repetition cap reached, short-circuiting");
                let result = StructuredToolResult::error(format!(
                    "Skipped due to repetition: {name} was already called {seen} times with these \
                     exact parameters. Calling it again will return the same data; try a \
                     different tool or different parameters."
                ))
                .with_params(params.clone());
                pending.push((index, params, Pending::Ready(result)));
                continue;
            }
            *seen += 1;

            let executor = self.executor.clone();
            let semaphore = self.semaphore.clone();
            let task_name = name.clone();
            let task_params = params.clone();
            let tool_span = info_span!(
                "tool_call",
                tool = %name,
                call_id = %call.id,
                elapsed_ms = tracing::field::Empty,
            );
            let handle = tokio::spawn(
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("dispatch semaphore closed");
                    executor.invoke(&task_name, task_params).await
                }
                .instrument(tool_span),
            );
            pending.push((index, params, Pending::Task(handle)));
        }

        let mut tool_messages = Vec::with_capacity(calls.len());
        let mut abort: Option<Error> = None;

        for (index, params, entry) in pending {
            let call = &calls[index];
            let result = match entry {
                Pending::Ready(result) => result,
                Pending::Task(mut handle) => {
                    if abort.is_some() {
                        // A sibling already failed the phase; drop the rest.
                        handle.abort();
                        continue;
                    }
                    match self
                        .guarded(deadline, committed, async { Ok((&mut handle).await) })
                        .await
                    {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_error)) => {
                            warn!(tool = %call.function.name, error = %join_error, "tool task failed");
                            StructuredToolResult::error(format!("tool task failed: {join_error}"))
                        }
                        Err(cancelled) => {
                            handle.abort();
                            abort = Some(cancelled);
                            continue;
                        }
                    }
                }
            };

            let mut result = result;
            let message =
                ChatMessage::tool(&call.id, &call.function.name, result.message_payload());
            let token_count = self.llm.count_tokens(std::slice::from_ref(&message)).total;
            result.returned_token_count = Some(token_count);

            records.push(ToolCallRecord {
                id: call.id.clone(),
                name: call.function.name.clone(),
                description: self.executor.describe(&call.function.name, &params),
                result,
                token_count: Some(token_count),
            });
            tool_messages.push(message);
        }

        match abort {
            Some(error) => {
                // Roll back this phase's provenance; nothing was committed.
                records.truncate(records.len().saturating_sub(tool_messages.len()));
                Err(error)
            }
            None => Ok(tool_messages),
        }
    }

    /// The BUDGET state: make `messages` fit, escalating from truncation to
    /// compaction (at most once per call), or fail with `ContextExceeded`.
    async fn ensure_fit(&self, messages: &mut Vec<ChatMessage>, deadline: Instant) -> Result<()> {
        if available_tokens(self.llm.as_ref(), messages) >= 0 {
            return Ok(());
        }

        truncate_tool_messages(
            self.llm.as_ref(),
            messages,
            self.options.max_tool_output_tokens,
        );
        if available_tokens(self.llm.as_ref(), messages) >= 0 {
            return Ok(());
        }

        if self.options.compaction_enabled {
            let snapshot = messages.clone();
            let compacted = self
                .guarded(deadline, &snapshot, async {
                    Ok(compact_history(self.llm.as_ref(), &snapshot).await)
                })
                .await?;
            *messages = compacted;
            if available_tokens(self.llm.as_ref(), messages) >= 0 {
                return Ok(());
            }
        }

        Err(Error::ContextExceeded {
            messages: messages.clone(),
        })
    }

    /// Race a suspension point against cancellation and the run deadline.
    ///
    /// Loses cleanly: the aborted work's output is discarded and the caller
    /// gets `Cancelled` with the committed history.
    async fn guarded<T>(
        &self,
        deadline: Instant,
        committed: &[ChatMessage],
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled {
                messages: committed.to_vec(),
            }),
            _ = tokio::time::sleep_until(deadline) => Err(Error::Cancelled {
                messages: committed.to_vec(),
            }),
            result = work => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_params_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": "x"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": "x", "b": 1}"#).unwrap();
        assert_eq!(canonical_params(&a), canonical_params(&b));
    }

    #[test]
    fn test_canonical_params_distinguishes_values() {
        assert_ne!(
            canonical_params(&json!({"resource": "pods"})),
            canonical_params(&json!({"resource": "nodes"}))
        );
    }
}
