//! The process-wide runtime handle.
//!
//! An [`AgentRuntime`] is constructed once and passed to entry points;
//! nothing reads globals except the env-var overrides consumed at
//! construction. It owns the LLM, the toolsets and their registry, the
//! session manager, and the process-wide tool-dispatch semaphore, and it
//! exposes the two public operations:
//!
//! - [`AgentRuntime::run_agent`] answers an ask inside a (possibly resumed)
//!   session
//! - [`AgentRuntime::investigate_issue`] builds the alert-investigation
//!   system prompt and delegates to the same loop
//!
//! Toolset prerequisite checks run at construction. A JSON status cache can
//! seed them so startup is fast; the first served request then triggers a
//! single-flight background refresh that re-checks prerequisites and swaps
//! in a rebuilt registry atomically. In-flight runs keep the registry they
//! started with.

use crate::agent::{AgentLoop, DEFAULT_TOOL_CONCURRENCY};
use crate::conversations::{ConversationExchange, InvestigationSummary, build_followup_messages};
use crate::executor::ToolExecutor;
use crate::llm::Llm;
use crate::registry::ToolRegistry;
use crate::session::{DEFAULT_IDLE_TIMEOUT, SessionManager};
use crate::tools::{Toolset, ToolsetStatus};
use crate::types::{ChatMessage, LlmResult, MessageRole, RunOptions};
use crate::{Error, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default system prompt for plain asks.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a tool-using assistant that investigates \
cloud-native operational questions. Gather evidence with the available tools before \
answering, and ground every claim in tool output.";

// ============================================================================
// ISSUES
// ============================================================================

/// An alert or ticket to investigate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub name: String,
    /// Where the issue came from, e.g. `prometheus`, `pagerduty`.
    pub source_type: String,
    pub description: String,
    /// Raw payload from the source system, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// Render the system prompt for an alert investigation.
fn investigation_system_prompt(sections: &[String]) -> String {
    let mut prompt = String::from(
        "You are investigating an alert from a production system. Use the available tools \
         to gather evidence about the alert before drawing conclusions. Do not speculate: \
         every finding must be backed by tool output.",
    );
    if !sections.is_empty() {
        prompt.push_str("\n\nStructure your answer under exactly these sections:\n");
        for section in sections {
            prompt.push_str("- ");
            prompt.push_str(section);
            prompt.push('\n');
        }
    }
    prompt
}

/// Render the user-side ask for an alert investigation.
fn investigation_ask(issue: &Issue, resource_instructions: Option<&str>) -> String {
    let mut ask = format!(
        "Investigate this {} alert:\n\nAlert: {}\nDescription: {}",
        issue.source_type, issue.name, issue.description
    );
    if let Some(raw) = &issue.raw {
        ask.push_str("\n\nRaw payload:\n");
        ask.push_str(&raw.to_string());
    }
    if let Some(instructions) = resource_instructions {
        ask.push_str("\n\nRunbook instructions for this resource:\n");
        ask.push_str(instructions);
    }
    ask
}

// ============================================================================
// TOOLSET STATUS CACHE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedStatus {
    status: ToolsetStatus,
    last_checked_unix: u64,
}

/// Optional on-disk cache of prerequisite-check outcomes, so startup can
/// skip the checks and let the background refresh correct staleness.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StatusCache {
    #[serde(flatten)]
    entries: HashMap<String, CachedStatus>,
}

impl StatusCache {
    fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable toolset status cache");
                None
            }
        }
    }

    fn save(&self, path: &Path) {
        let serialized = match serde_json::to_string_pretty(self) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not serialize toolset status cache");
                return;
            }
        };
        if let Err(e) = std::fs::write(path, serialized) {
            warn!(path = %path.display(), error = %e, "could not write toolset status cache");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Store the run's final history back into the session.
///
/// The whole history is stored (minus the leading system prompt, which
/// `build` re-adds on the next ask) rather than appended, so a compacted run
/// leaves the session compacted too. Failed runs that carry history
/// (`Cancelled`, `ContextExceeded`) commit their completed iterations.
fn commit_to_session(
    session: &mut crate::session::ConversationSession,
    outcome: &Result<LlmResult>,
) {
    let final_messages: Option<&[ChatMessage]> = match outcome {
        Ok(result) => Some(&result.messages),
        Err(e) => e.messages(),
    };
    let Some(final_messages) = final_messages else {
        return;
    };
    let stripped = match final_messages.first() {
        Some(first) if first.role == MessageRole::System => &final_messages[1..],
        _ => final_messages,
    };
    session.messages = stripped.to_vec();
    session.last_access = std::time::Instant::now();
}

/// Run (or skip, per cache) prerequisite checks and stamp statuses. Checks
/// run concurrently; a slow backend does not serialize startup. Returns
/// whether any status came from the cache.
async fn check_toolsets(toolsets: &[Arc<dyn Toolset>], cache: Option<&StatusCache>) -> bool {
    let mut any_cached = false;
    let mut to_check = Vec::new();
    for toolset in toolsets {
        if !toolset.enabled() {
            toolset.set_status(ToolsetStatus::Disabled);
            continue;
        }
        if let Some(cached) = cache.and_then(|c| c.entries.get(toolset.name())) {
            toolset.set_status(cached.status);
            any_cached = true;
            continue;
        }
        to_check.push(toolset);
    }

    let checks = join_all(to_check.iter().map(|ts| ts.check_prerequisites())).await;
    for (toolset, check) in to_check.iter().zip(checks) {
        if check.ok {
            toolset.set_status(ToolsetStatus::Enabled);
        } else {
            warn!(
                toolset = toolset.name(),
                error = check.error.as_deref().unwrap_or("unknown"),
                "toolset failed prerequisite check"
            );
            toolset.set_status(ToolsetStatus::Failed);
        }
    }
    any_cached
}

fn snapshot_statuses(toolsets: &[Arc<dyn Toolset>]) -> StatusCache {
    let now = unix_now();
    StatusCache {
        entries: toolsets
            .iter()
            .map(|ts| {
                (
                    ts.name().to_string(),
                    CachedStatus {
                        status: ts.status(),
                        last_checked_unix: now,
                    },
                )
            })
            .collect(),
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Everything a process needs to serve agent runs. Construct once with
/// [`AgentRuntime::builder`].
pub struct AgentRuntime {
    llm: Arc<dyn Llm>,
    toolsets: Vec<Arc<dyn Toolset>>,
    registry: RwLock<Arc<ToolRegistry>>,
    sessions: SessionManager,
    semaphore: Arc<Semaphore>,
    system_prompt: String,
    defaults: RunOptions,
    status_cache_path: Option<PathBuf>,
    /// Set when statuses were seeded from the cache and not yet re-checked.
    needs_refresh: AtomicBool,
    refreshing: Arc<AtomicBool>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("toolsets", &self.toolsets.len())
            .field("system_prompt", &self.system_prompt)
            .field("defaults", &self.defaults)
            .field("status_cache_path", &self.status_cache_path)
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Start building a runtime.
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::default()
    }

    /// The registry snapshot new runs will use.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .clone()
    }

    /// The session manager (exposed for eviction/clearing by embedders).
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Answer `ask` inside the session identified by `session_id` (a fresh
    /// session when `None`). Returns the loop's result after committing the
    /// exchange to the session.
    pub async fn run_agent(
        self: &Arc<Self>,
        session_id: Option<&str>,
        ask: &str,
        options: Option<RunOptions>,
    ) -> Result<LlmResult> {
        self.run_agent_with(session_id, ask, options, CancellationToken::new())
            .await
    }

    /// [`run_agent`](Self::run_agent) with a caller-provided cancellation
    /// handle. On cancel the session keeps only fully-completed iterations.
    pub async fn run_agent_with(
        self: &Arc<Self>,
        session_id: Option<&str>,
        ask: &str,
        options: Option<RunOptions>,
        cancel: CancellationToken,
    ) -> Result<LlmResult> {
        let (id, mut session) = self.sessions.acquire(session_id).await;
        debug!(session = %id, "running agent");

        let messages = SessionManager::build(&session, &self.system_prompt, ask);

        let executor = ToolExecutor::new(self.registry());
        let agent = AgentLoop::with_options(
            self.llm.clone(),
            executor,
            options.unwrap_or_else(|| self.defaults.clone()),
        )
        .with_semaphore(self.semaphore.clone())
        .with_cancellation(cancel);

        let outcome = agent.run(messages).await;
        commit_to_session(&mut session, &outcome);
        drop(session);

        self.maybe_spawn_refresh();
        outcome
    }

    /// Investigate an alert: composes the investigation system prompt and
    /// ask, then runs the same loop in a fresh session.
    pub async fn investigate_issue(
        self: &Arc<Self>,
        issue: &Issue,
        resource_instructions: Option<&str>,
        sections: &[String],
        options: Option<RunOptions>,
    ) -> Result<LlmResult> {
        let system_prompt = investigation_system_prompt(sections);
        let ask = investigation_ask(issue, resource_instructions);

        let (id, mut session) = self.sessions.acquire(None).await;
        debug!(session = %id, issue = %issue.id, "investigating issue");

        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(ask)];

        let executor = ToolExecutor::new(self.registry());
        let agent = AgentLoop::with_options(
            self.llm.clone(),
            executor,
            options.unwrap_or_else(|| self.defaults.clone()),
        )
        .with_semaphore(self.semaphore.clone());

        let outcome = agent.run(messages).await;
        commit_to_session(&mut session, &outcome);
        drop(session);

        self.maybe_spawn_refresh();
        outcome
    }

    /// Answer a follow-up question about a completed investigation.
    ///
    /// The prior analysis and its tool outputs are embedded into the system
    /// prompt, sized against the context window (see
    /// [`build_followup_messages`]); the model may still run tools when the
    /// recorded evidence is not enough.
    pub async fn issue_chat(
        self: &Arc<Self>,
        investigation: &InvestigationSummary,
        history: &[ConversationExchange],
        ask: &str,
        options: Option<RunOptions>,
    ) -> Result<LlmResult> {
        let messages = build_followup_messages(self.llm.as_ref(), investigation, history, ask);

        let (id, mut session) = self.sessions.acquire(None).await;
        debug!(session = %id, "follow-up conversation");

        let executor = ToolExecutor::new(self.registry());
        let agent = AgentLoop::with_options(
            self.llm.clone(),
            executor,
            options.unwrap_or_else(|| self.defaults.clone()),
        )
        .with_semaphore(self.semaphore.clone());

        let outcome = agent.run(messages).await;
        commit_to_session(&mut session, &outcome);
        drop(session);

        self.maybe_spawn_refresh();
        outcome
    }

    /// Re-run prerequisite checks now and swap in a rebuilt registry.
    pub async fn refresh_toolsets(&self) {
        check_toolsets(&self.toolsets, None).await;

        let rebuilt = Arc::new(ToolRegistry::build(&self.toolsets));
        let tool_count = rebuilt.len();
        *self.registry.write().expect("registry lock poisoned") = rebuilt;
        info!(tools = tool_count, "toolset refresh complete, registry swapped");

        if let Some(path) = &self.status_cache_path {
            snapshot_statuses(&self.toolsets).save(path);
        }
        self.needs_refresh.store(false, Ordering::SeqCst);
    }

    /// Kick off a single-flight background refresh if statuses were seeded
    /// from the cache. In-flight runs keep their registry snapshot.
    fn maybe_spawn_refresh(self: &Arc<Self>) {
        if !self.needs_refresh.load(Ordering::SeqCst) {
            return;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let runtime = self.clone();
        tokio::spawn(async move {
            debug!("background toolset refresh started");
            runtime.refresh_toolsets().await;
            runtime.refreshing.store(false, Ordering::SeqCst);
        });
    }
}

/// Builder for [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    llm: Option<Arc<dyn Llm>>,
    toolsets: Vec<Arc<dyn Toolset>>,
    system_prompt: String,
    defaults: RunOptions,
    idle_timeout: Duration,
    tool_concurrency: usize,
    status_cache_path: Option<PathBuf>,
}

impl Default for AgentRuntimeBuilder {
    fn default() -> Self {
        Self {
            llm: None,
            toolsets: Vec::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            defaults: RunOptions::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tool_concurrency: DEFAULT_TOOL_CONCURRENCY,
            status_cache_path: None,
        }
    }
}

impl AgentRuntimeBuilder {
    /// The LLM every run uses (required).
    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Add one toolset.
    pub fn toolset(mut self, toolset: Arc<dyn Toolset>) -> Self {
        self.toolsets.push(toolset);
        self
    }

    /// Add several toolsets.
    pub fn toolsets(mut self, toolsets: impl IntoIterator<Item = Arc<dyn Toolset>>) -> Self {
        self.toolsets.extend(toolsets);
        self
    }

    /// System prompt for plain asks (investigations compose their own).
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Default run options when a caller passes `None`.
    pub fn default_options(mut self, options: RunOptions) -> Self {
        self.defaults = options;
        self
    }

    /// Session idle timeout before eviction.
    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Process-wide bound on concurrently executing tool calls.
    pub fn tool_concurrency(mut self, permits: usize) -> Self {
        self.tool_concurrency = permits;
        self
    }

    /// Path to the optional toolset status cache. The runtime works without
    /// it; when present, startup skips prerequisite checks for cached
    /// toolsets and re-checks them in the background after the first request.
    pub fn status_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_cache_path = Some(path.into());
        self
    }

    /// Check toolset prerequisites (or load them from the cache), build the
    /// registry, and assemble the runtime.
    ///
    /// # Errors
    ///
    /// Returns a config error when no LLM was provided or the tool
    /// concurrency is zero.
    pub async fn build(self) -> Result<Arc<AgentRuntime>> {
        let llm = self
            .llm
            .ok_or_else(|| Error::config("AgentRuntime requires an LLM"))?;
        if self.tool_concurrency == 0 {
            return Err(Error::config("tool_concurrency must be at least 1"));
        }

        let cache = self
            .status_cache_path
            .as_deref()
            .and_then(StatusCache::load);
        let seeded_from_cache = check_toolsets(&self.toolsets, cache.as_ref()).await;

        if let Some(path) = &self.status_cache_path {
            snapshot_statuses(&self.toolsets).save(path);
        }

        let registry = Arc::new(ToolRegistry::build(&self.toolsets));
        info!(
            tools = registry.len(),
            toolsets = self.toolsets.len(),
            from_cache = seeded_from_cache,
            "agent runtime ready"
        );

        Ok(Arc::new(AgentRuntime {
            llm,
            toolsets: self.toolsets,
            registry: RwLock::new(registry),
            sessions: SessionManager::new(self.idle_timeout),
            semaphore: Arc::new(Semaphore::new(self.tool_concurrency)),
            system_prompt: self.system_prompt,
            defaults: self.defaults,
            status_cache_path: self.status_cache_path,
            needs_refresh: AtomicBool::new(seeded_from_cache),
            refreshing: Arc::new(AtomicBool::new(false)),
        }))
    }
}
