//! Runtime-level integration: toolset lifecycle, the status cache, registry
//! refresh, sessions across asks, and the investigation entry point.

mod common;

use async_trait::async_trait;
use common::{MockLlm, echo_tool};
use opsagent::{
    AgentRuntime, InvestigationSummary, Issue, MessageRole, PrerequisiteCheck, StaticToolset,
    Tool, ToolCallSummary, Toolset, ToolsetStatus,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A toolset whose prerequisite check is scripted and counted.
struct FlakyToolset {
    name: String,
    tools: Vec<Arc<dyn Tool>>,
    healthy: AtomicBool,
    checks: AtomicUsize,
    status: Mutex<ToolsetStatus>,
}

impl FlakyToolset {
    fn new(name: &str, tools: Vec<Arc<dyn Tool>>, healthy: bool) -> Self {
        Self {
            name: name.to_string(),
            tools,
            healthy: AtomicBool::new(healthy),
            checks: AtomicUsize::new(0),
            status: Mutex::new(ToolsetStatus::Disabled),
        }
    }
}

#[async_trait]
impl Toolset for FlakyToolset {
    fn name(&self) -> &str {
        &self.name
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }

    async fn check_prerequisites(&self) -> PrerequisiteCheck {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            PrerequisiteCheck::passed()
        } else {
            PrerequisiteCheck::failed("backend unreachable")
        }
    }

    fn status(&self) -> ToolsetStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: ToolsetStatus) {
        *self.status.lock().unwrap() = status;
    }
}

#[tokio::test]
async fn test_failed_prerequisites_exclude_toolset() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(FlakyToolset::new(
        "good",
        vec![echo_tool(invocations.clone())],
        true,
    ));
    let broken = Arc::new(FlakyToolset::new(
        "broken",
        vec![common::sleep_tool("slow", std::time::Duration::from_millis(1))],
        false,
    ));

    let runtime = AgentRuntime::builder()
        .llm(Arc::new(MockLlm::new()))
        .toolset(healthy.clone())
        .toolset(broken.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(healthy.status(), ToolsetStatus::Enabled);
    assert_eq!(broken.status(), ToolsetStatus::Failed);

    let registry = runtime.registry();
    assert!(registry.lookup("echo").is_some());
    assert!(registry.lookup("slow").is_none());
}

#[tokio::test]
async fn test_run_agent_dispatches_tools_and_commits_session() {
    let llm = Arc::new(MockLlm::new());
    llm.push_tool_call("call_1", "echo", r#"{"text":"k"}"#);
    llm.push_text("got k");
    llm.push_text("still here");

    let invocations = Arc::new(AtomicUsize::new(0));
    let toolset = StaticToolset::new("echoes", vec![echo_tool(invocations.clone())]);

    let runtime = AgentRuntime::builder()
        .llm(llm.clone())
        .toolset(Arc::new(toolset))
        .build()
        .await
        .unwrap();

    let result = runtime
        .run_agent(Some("session-1"), "please echo k", None)
        .await
        .unwrap();
    assert_eq!(result.result.as_deref(), Some("got k"));
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // A second ask on the same session sees the whole first exchange.
    let result = runtime
        .run_agent(Some("session-1"), "are you there?", None)
        .await
        .unwrap();
    assert_eq!(result.result.as_deref(), Some("still here"));

    let third_request = llm.request_messages(2);
    let contents: Vec<_> = third_request.iter().map(|m| m.content_str()).collect();
    assert!(contents.contains(&"please echo k"));
    assert!(contents.contains(&"got k"));
    assert!(contents.contains(&"are you there?"));
    // Exactly one system prompt, at the front.
    assert_eq!(third_request[0].role, MessageRole::System);
    assert_eq!(
        third_request
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_status_cache_skips_checks_and_refresh_corrects() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("toolset_status.json");

    // Seed the cache claiming the toolset is enabled.
    std::fs::write(
        &cache_path,
        r#"{"flaky": {"status": "enabled", "last_checked_unix": 1700000000}}"#,
    )
    .unwrap();

    // The toolset would fail its check, but the cache short-circuits it.
    let toolset = Arc::new(FlakyToolset::new(
        "flaky",
        vec![echo_tool(Arc::new(AtomicUsize::new(0)))],
        false,
    ));

    let runtime = AgentRuntime::builder()
        .llm(Arc::new(MockLlm::new()))
        .toolset(toolset.clone())
        .status_cache(&cache_path)
        .build()
        .await
        .unwrap();

    assert_eq!(toolset.checks.load(Ordering::SeqCst), 0);
    assert_eq!(toolset.status(), ToolsetStatus::Enabled);
    assert!(runtime.registry().lookup("echo").is_some());

    // An explicit refresh re-runs the check and swaps the registry.
    runtime.refresh_toolsets().await;
    assert_eq!(toolset.checks.load(Ordering::SeqCst), 1);
    assert_eq!(toolset.status(), ToolsetStatus::Failed);
    assert!(runtime.registry().lookup("echo").is_none());

    // The cache on disk now reflects reality.
    let saved = std::fs::read_to_string(&cache_path).unwrap();
    assert!(saved.contains("failed"));
}

#[tokio::test]
async fn test_runtime_without_cache_checks_at_build() {
    let toolset = Arc::new(FlakyToolset::new(
        "direct",
        vec![echo_tool(Arc::new(AtomicUsize::new(0)))],
        true,
    ));

    let _runtime = AgentRuntime::builder()
        .llm(Arc::new(MockLlm::new()))
        .toolset(toolset.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(toolset.checks.load(Ordering::SeqCst), 1);
    assert_eq!(toolset.status(), ToolsetStatus::Enabled);
}

#[tokio::test]
async fn test_in_flight_run_keeps_registry_snapshot() {
    // Swapping the registry does not change what an existing executor sees.
    let llm = Arc::new(MockLlm::new());
    let toolset = Arc::new(FlakyToolset::new(
        "flappy",
        vec![echo_tool(Arc::new(AtomicUsize::new(0)))],
        true,
    ));

    let runtime = AgentRuntime::builder()
        .llm(llm)
        .toolset(toolset.clone())
        .build()
        .await
        .unwrap();

    let snapshot = runtime.registry();
    toolset.healthy.store(false, Ordering::SeqCst);
    runtime.refresh_toolsets().await;

    assert!(snapshot.lookup("echo").is_some());
    assert!(runtime.registry().lookup("echo").is_none());
}

#[tokio::test]
async fn test_investigate_issue_composes_prompt() {
    let llm = Arc::new(MockLlm::new());
    llm.push_text("Root cause: OOM killer. Evidence: kubelet logs.");

    let runtime = AgentRuntime::builder()
        .llm(llm.clone())
        .build()
        .await
        .unwrap();

    let issue = Issue {
        id: "alert-42".to_string(),
        name: "KubePodCrashLooping".to_string(),
        source_type: "prometheus".to_string(),
        description: "Pod api-7f9c restarts every 30s".to_string(),
        raw: None,
    };

    let result = runtime
        .investigate_issue(
            &issue,
            Some("Check the OOM score first."),
            &["Root cause".to_string(), "Evidence".to_string()],
            None,
        )
        .await
        .unwrap();

    assert!(result.result.as_deref().unwrap().contains("Root cause"));

    let request = llm.request_messages(0);
    assert_eq!(request[0].role, MessageRole::System);
    assert!(request[0].content_str().contains("- Root cause"));
    assert!(request[0].content_str().contains("- Evidence"));
    assert!(request[1].content_str().contains("KubePodCrashLooping"));
    assert!(request[1].content_str().contains("Check the OOM score first."));
}

#[tokio::test]
async fn test_issue_chat_embeds_prior_findings() {
    let llm = Arc::new(MockLlm::new());
    llm.push_text("The 14:02 deploy raised the heap limit past the cgroup cap.");

    let runtime = AgentRuntime::builder().llm(llm.clone()).build().await.unwrap();

    let investigation = InvestigationSummary {
        analysis: "Pod api-7f9c was OOM killed.".to_string(),
        tools: vec![ToolCallSummary {
            name: "kubectl_describe".to_string(),
            description: "kubectl describe pod api-7f9c".to_string(),
            output: "Last State: OOMKilled".to_string(),
        }],
    };

    let result = runtime
        .issue_chat(&investigation, &[], "which deploy caused it?", None)
        .await
        .unwrap();
    assert!(result.result.as_deref().unwrap().contains("14:02"));

    let request = llm.request_messages(0);
    assert_eq!(request[0].role, MessageRole::System);
    assert!(request[0].content_str().contains("Pod api-7f9c was OOM killed."));
    assert!(request[0].content_str().contains("Last State: OOMKilled"));
    assert_eq!(request[1].content_str(), "which deploy caused it?");
}

#[tokio::test]
async fn test_runtime_requires_llm() {
    let err = AgentRuntime::builder().build().await.unwrap_err();
    assert!(matches!(err, opsagent::Error::Config(_)));
}
