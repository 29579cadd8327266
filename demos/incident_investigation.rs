//! An alert investigation with a small fake Kubernetes toolset.
//!
//! The tools here return canned data so the demo runs against any model
//! without a cluster. Swap in real tools by implementing the same traits.
//!
//! ```bash
//! export OPSAGENT_BASE_URL="http://localhost:11434/v1"
//! export OPSAGENT_MODEL="llama3:8b"
//! cargo run --example incident_investigation
//! ```

use opsagent::{
    AgentRuntime, Issue, OpenAiClient, ParameterType, StaticToolset, StructuredToolResult, Tool,
    function_tool,
};
use std::sync::Arc;

fn fake_kubernetes_tools() -> Vec<Arc<dyn Tool>> {
    let get_pods = function_tool("kubectl_get_pods", "List pods in a namespace")
        .param("namespace", ParameterType::String)
        .one_liner("kubectl get pods -n {namespace}")
        .build(|_| async {
            Ok(StructuredToolResult::success(
                "NAME        READY  STATUS             RESTARTS\n\
                 api-7f9c    0/1    CrashLoopBackOff   14\n\
                 api-2b81    1/1    Running            0",
            ))
        });

    let describe = function_tool("kubectl_describe_pod", "Describe one pod")
        .param("namespace", ParameterType::String)
        .param("pod", ParameterType::String)
        .one_liner("kubectl describe pod {pod} -n {namespace}")
        .build(|params| async move {
            let pod = params["pod"].as_str().unwrap_or("unknown");
            Ok(StructuredToolResult::success(format!(
                "Name: {pod}\nLast State: Terminated\nReason: OOMKilled\nExit Code: 137\n\
                 Limits: memory 256Mi"
            )))
        });

    vec![Arc::new(get_pods), Arc::new(describe)]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let llm = Arc::new(OpenAiClient::builder().build()?);
    let toolset = Arc::new(StaticToolset::new("kubernetes/demo", fake_kubernetes_tools()));

    let runtime = AgentRuntime::builder()
        .llm(llm)
        .toolset(toolset)
        .build()
        .await?;

    let issue = Issue {
        id: "demo-1".to_string(),
        name: "KubePodCrashLooping".to_string(),
        source_type: "prometheus".to_string(),
        description: "Pod api-7f9c in namespace prod has restarted 14 times in 10 minutes"
            .to_string(),
        raw: None,
    };

    let result = runtime
        .investigate_issue(
            &issue,
            None,
            &["Root cause".to_string(), "Remediation".to_string()],
            None,
        )
        .await?;

    for call in &result.tool_calls {
        println!("ran: {}", call.description);
    }
    println!("\n{}", result.result.unwrap_or_default());
    Ok(())
}
