//! Sub-agents — child runs exposed to the parent model as tools.
//!
//! The child shares the parent's workspace, history, memory, trace, and
//! cancellation token, and inherits streaming. Its events are re-emitted
//! through the parent's event queue before the parent's own next emission.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tiller_domain::{Error, Result, ToolDefinition};

use crate::event::AgentEvent;
use crate::model::Model;
use crate::run::{Agent, RunOptions};
use crate::tool::{Tool, ToolCtx, ToolResult};

/// Definition of a child agent: what the parent model sees as a tool, and
/// what the child run is built from.
#[derive(Clone)]
pub struct SubAgentDef {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub model: Arc<dyn Model>,
    pub tools: Vec<Arc<dyn Tool>>,
    /// Model-call cap for each child run.
    pub max_llm_calls: usize,
}

impl SubAgentDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
        model: Arc<dyn Model>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: instructions.into(),
            model,
            tools: Vec::new(),
            max_llm_calls: RunOptions::default().max_llm_calls,
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }
}

/// Run one child turn to completion, forwarding every child event to the
/// parent's queue. Returns the child's accumulated content.
pub(crate) async fn run_sub_agent(def: &SubAgentDef, ctx: &ToolCtx, task: &str) -> Result<String> {
    let mut agent = Agent::new(def.name.clone(), def.model.clone())
        .with_description(def.description.clone())
        .with_instructions(def.instructions.clone())
        .with_options(RunOptions {
            streaming: ctx.streaming,
            max_llm_calls: def.max_llm_calls,
            ..RunOptions::default()
        });
    for tool in &def.tools {
        agent = agent.with_tool(tool.clone());
    }

    // A child token: the parent's cancel cascades down, the child's stop
    // does not propagate up.
    let mut run = agent.start_child(&ctx.session, task, ctx.trace.clone(), ctx.cancel.child())?;

    let mut content = String::new();
    let mut error: Option<String> = None;
    while let Some(event) = run.next_event().await {
        match &event {
            AgentEvent::Content { content: c, .. } => content.push_str(c),
            AgentEvent::Error { message, .. } => error = Some(message.clone()),
            _ => {}
        }
        ctx.emit(event);
    }

    match error {
        Some(message) => Err(Error::Other(format!(
            "sub-agent {} failed: {message}",
            def.name
        ))),
        None => Ok(content),
    }
}

/// The tool wrapper installed for each sub-agent.
pub struct AgentTool {
    def: SubAgentDef,
}

impl AgentTool {
    pub fn new(def: SubAgentDef) -> Self {
        Self { def }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.def.name.clone(),
            self.def.description.clone(),
            json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "The task to delegate to this agent."
                    }
                },
                "required": ["task"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("missing 'task' argument".into()))?;

        let content = run_sub_agent(&self.def, ctx, task).await?;
        Ok(ToolResult::text(content))
    }
}
