//! Cancellation and deadline behavior: aborted turns leave no partial
//! messages behind.

mod common;

use common::{MockLlm, executor_for, sleep_tool};
use opsagent::{
    AgentLoop, ChatMessage, Error, MessageRole, ParameterType, RunOptions, StructuredToolResult,
    Tool, function_tool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn base_messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are a helpful assistant"),
        ChatMessage::user("investigate"),
    ]
}

/// A tool that announces when it starts, then hangs until dropped.
fn hanging_tool(name: &str, started: Arc<Notify>) -> Arc<dyn Tool> {
    Arc::new(
        function_tool(name, "Hang forever")
            .optional_param("arg", ParameterType::String)
            .build(move |_| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(StructuredToolResult::success("never"))
                }
            }),
    )
}

#[tokio::test]
async fn test_cancel_during_dispatch_discards_partial_iteration() {
    // S6: iteration 1 completes; the caller cancels during iteration 2's
    // dispatch. The returned history holds iteration 1 but nothing from the
    // aborted turn.
    let llm = Arc::new(MockLlm::new());
    llm.push_tool_call("call_1", "quick", "{}");
    llm.push_tool_call("call_2", "hang", "{}");

    let started = Arc::new(Notify::new());
    let agent = AgentLoop::new(
        llm.clone(),
        executor_for(vec![
            sleep_tool("quick", Duration::from_millis(1)),
            hanging_tool("hang", started.clone()),
        ]),
    );
    let cancel = agent.cancellation_token();

    let run = tokio::spawn(async move { agent.run(base_messages()).await });

    // Wait for iteration 2's tool to actually start, then cancel.
    started.notified().await;
    cancel.cancel();

    let err = run.await.unwrap().unwrap_err();
    let Error::Cancelled { messages } = err else {
        panic!("expected Cancelled, got {err:?}");
    };

    // system, user, assistant(call_1), tool(call_1), and nothing from
    // iteration 2.
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].tool_calls[0].id, "call_1");
    assert_eq!(messages[3].role, MessageRole::Tool);
    assert!(
        messages
            .iter()
            .all(|m| m.tool_call_id.as_deref() != Some("call_2"))
    );
}

#[tokio::test]
async fn test_cancel_before_first_completion() {
    let llm = Arc::new(MockLlm::new());
    llm.push_text("unused");

    // A pre-cancelled token aborts at the first suspension point.
    let agent = AgentLoop::new(llm.clone(), common::empty_executor());
    agent.cancellation_token().cancel();

    let err = agent.run(base_messages()).await.unwrap_err();
    let Error::Cancelled { messages } = err else {
        panic!("expected Cancelled, got {err:?}");
    };
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn test_deadline_uses_the_cancellation_path() {
    let llm = Arc::new(MockLlm::new());
    llm.push_tool_call("call_1", "hang", "{}");

    let started = Arc::new(Notify::new());
    let options = RunOptions::builder()
        .deadline(Duration::from_millis(80))
        .build()
        .unwrap();
    let agent = AgentLoop::with_options(
        llm.clone(),
        executor_for(vec![hanging_tool("hang", started.clone())]),
        options,
    );

    let err = agent.run(base_messages()).await.unwrap_err();
    let Error::Cancelled { messages } = err else {
        panic!("expected Cancelled, got {err:?}");
    };
    // The hanging dispatch never committed.
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn test_cancelled_error_carries_last_committed_history() {
    // Cancel during the second completion call (not dispatch): committed
    // history still includes all of iteration 1.
    let llm = Arc::new(MockLlm::new());
    llm.push_tool_call("call_1", "quick", "{}");
    // No second turn scripted: the mock would answer with a permanent error,
    // so cancel first.

    let agent = AgentLoop::new(
        llm.clone(),
        executor_for(vec![sleep_tool("quick", Duration::from_millis(30))]),
    );
    let cancel = agent.cancellation_token();

    let run = tokio::spawn(async move { agent.run(base_messages()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
}
