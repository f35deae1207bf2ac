//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tiller_engine::event::AgentEvent;
use tiller_engine::run::{AgentRun, RunSession};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn session() -> (tempfile::TempDir, RunSession) {
    let base = tempfile::tempdir().unwrap();
    let session = RunSession::create(base.path(), "agent-1").unwrap();
    (base, session)
}

/// Drain a run into (events, accumulated content, first error message).
pub async fn drain(run: &mut AgentRun) -> (Vec<AgentEvent>, String, Option<String>) {
    let mut events = Vec::new();
    let mut content = String::new();
    let mut error = None;
    while let Some(event) = tokio::time::timeout(WAIT, run.next_event())
        .await
        .expect("run did not finish in time")
    {
        match &event {
            AgentEvent::Content { content: c, .. } => content.push_str(c),
            AgentEvent::Error { message, .. } => {
                if error.is_none() {
                    error = Some(message.clone());
                }
            }
            _ => {}
        }
        events.push(event);
    }
    (events, content, error)
}

/// Compact event-kind labels for order assertions.
pub fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            AgentEvent::LlmCall { .. } => "llm_call",
            AgentEvent::Content { .. } => "content",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Tool { .. } => "tool",
            AgentEvent::ToolResponse { .. } => "tool_response",
            AgentEvent::Approval { .. } => "approval",
            AgentEvent::Error { .. } => "error",
        })
        .collect()
}

/// A tool that counts its executions.
pub fn counting_tool(
    name: &str,
) -> (Arc<tiller_engine::FuncTool>, Arc<std::sync::atomic::AtomicUsize>) {
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let seen = counter.clone();
    let tool = Arc::new(tiller_engine::FuncTool::new(
        name,
        "count invocations",
        serde_json::json!({"type": "object"}),
        move |_args| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(tiller_engine::ToolResult::text("counted"))
        },
    ));
    (tool, counter)
}
