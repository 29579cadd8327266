//! Minimal usage: one runtime, no toolsets, one ask.
//!
//! Run against any OpenAI-compatible endpoint:
//!
//! ```bash
//! export OPSAGENT_BASE_URL="http://localhost:11434/v1"
//! export OPSAGENT_MODEL="llama3:8b"
//! cargo run --example simple_ask
//! ```

use opsagent::{AgentRuntime, OpenAiClient};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let llm = Arc::new(OpenAiClient::builder().build()?);
    let runtime = AgentRuntime::builder().llm(llm).build().await?;

    let result = runtime
        .run_agent(None, "In one sentence, what does an SRE do?", None)
        .await?;

    println!("{}", result.result.unwrap_or_default());
    println!(
        "({} prompt + {} completion tokens)",
        result.prompt_tokens, result.completion_tokens
    );
    Ok(())
}
