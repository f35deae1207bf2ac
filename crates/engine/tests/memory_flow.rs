//! Memory compartments driven through the model-facing tools.

mod common;

use tiller_context::MemoryScope;
use tiller_engine::memory_tools::memory_toolset;
use tiller_engine::testing::{reply, reply_with_calls, tool_call, MockModel};
use tiller_engine::{Agent, AgentEvent};

use common::{drain, session};

fn agent_with_memory(model: std::sync::Arc<MockModel>) -> Agent {
    let mut agent = Agent::new("agent-1", model);
    for tool in memory_toolset() {
        agent = agent.with_tool(tool);
    }
    agent
}

#[tokio::test]
async fn saved_run_memory_reaches_the_next_prompt() {
    let (_base, session) = session();
    let model = MockModel::new(vec![
        reply_with_calls(
            "",
            vec![tool_call(
                "tc_1",
                "save_memory",
                r#"{"scope":"run","description":"goal","content":"ship the release"}"#,
            )],
        ),
        reply("remembered"),
    ]);
    let mut run = agent_with_memory(model.clone()).start(&session, "remember").unwrap();
    let (_, _, error) = drain(&mut run).await;
    assert!(error.is_none());

    // The store holds the entry, and the follow-up model call saw it in
    // the system message.
    assert_eq!(session.memory.get(MemoryScope::Run).len(), 1);
    let second = &model.requests()[1];
    let system = second.messages[0].content().unwrap();
    assert!(system.contains("ship the release"));

    // A fresh run on the same session also sees it (run memory is
    // auto-injected).
    let model = MockModel::new(vec![reply("hello")]);
    let mut run = agent_with_memory(model.clone()).start(&session, "hi").unwrap();
    drain(&mut run).await;
    assert!(model.requests()[0].messages[0]
        .content()
        .unwrap()
        .contains("ship the release"));
}

#[tokio::test]
async fn session_memory_requires_an_explicit_get() {
    let (_base, session) = session();
    session
        .memory
        .save(MemoryScope::Session, "secret", "tuesday password", "run-0")
        .unwrap();

    let model = MockModel::new(vec![
        reply_with_calls(
            "",
            vec![tool_call("tc_1", "get_memory", r#"{"scope":"session"}"#)],
        ),
        reply("got it"),
    ]);
    let mut run = agent_with_memory(model.clone()).start(&session, "recall").unwrap();
    let (events, _, error) = drain(&mut run).await;
    assert!(error.is_none());

    // Not in the system prompt…
    assert!(!model.requests()[0].messages[0]
        .content()
        .unwrap()
        .contains("tuesday password"));
    // …but returned by the tool.
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResponse { content, .. } if content.contains("tuesday password")
    )));
}

#[tokio::test]
async fn clear_memory_empties_the_compartment() {
    let (_base, session) = session();
    session
        .memory
        .save(MemoryScope::Plan, "step", "collect underpants", "run-0")
        .unwrap();

    let model = MockModel::new(vec![
        reply_with_calls(
            "",
            vec![tool_call("tc_1", "clear_memory", r#"{"scope":"plan"}"#)],
        ),
        reply("cleared"),
    ]);
    let mut run = agent_with_memory(model).start(&session, "wipe plan").unwrap();
    let (_, _, error) = drain(&mut run).await;
    assert!(error.is_none());
    assert!(session.memory.get(MemoryScope::Plan).is_empty());
}

#[tokio::test]
async fn full_compartment_tells_the_model_to_clear() {
    let (_base, session) = session();
    // Pre-fill close to the cap so the save overflows.
    let big = "x".repeat(9_990);
    session
        .memory
        .save(MemoryScope::Run, "filler", &big, "run-0")
        .unwrap();

    let model = MockModel::new(vec![
        reply_with_calls(
            "",
            vec![tool_call(
                "tc_1",
                "save_memory",
                r#"{"scope":"run","description":"more","content":"this does not fit at all"}"#,
            )],
        ),
        reply("will clear first"),
    ]);
    let mut run = agent_with_memory(model).start(&session, "save more").unwrap();
    let (events, _, error) = drain(&mut run).await;
    assert!(error.is_none());

    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResponse { content, .. } if content.contains("clear")
    )));
    // The oversized entry was not stored.
    assert_eq!(session.memory.get(MemoryScope::Run).len(), 1);
}
