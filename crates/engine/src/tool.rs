//! The tool contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tiller_context::MemoryStore;
use tiller_domain::{Result, ToolDefinition};
use tiller_sessions::ConversationHistory;
use tiller_workspace::{Document, FileRefEntry, Workspace};

use crate::cancel::CancelToken;
use crate::event::AgentEvent;
use crate::run::RunSession;
use crate::trace::TraceWriter;

/// One piece of tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub content: String,
}

/// What a tool execution produced.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    /// The tool ran but wants the model to see a failure.
    pub error: bool,
    /// Documents to attach to the turn, tagged with this call's ID.
    pub documents: Vec<Document>,
    /// File refs to carry into subsequent prompts.
    pub file_refs: Vec<FileRefEntry>,
    /// End the run after this round instead of calling the model again.
    pub terminal: bool,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".into(),
                content: content.into(),
            }],
            ..Default::default()
        }
    }

    pub fn error_text(content: impl Into<String>) -> Self {
        let mut result = Self::text(content);
        result.error = true;
        result
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.documents.push(document);
        self
    }

    pub fn with_file_ref(mut self, file_ref: FileRefEntry) -> Self {
        self.file_refs.push(file_ref);
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// The textual response recorded in the tool message.
    pub fn rendered(&self) -> String {
        self.content
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Per-invocation context handed to a tool: the run's identity, the shared
/// session, and the event sender for progress activity.
#[derive(Clone)]
pub struct ToolCtx {
    pub run_id: String,
    pub agent_name: String,
    pub tool_call_id: String,
    pub session: RunSession,
    pub cancel: CancelToken,
    pub(crate) trace: Option<Arc<TraceWriter>>,
    pub(crate) streaming: bool,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl ToolCtx {
    pub(crate) fn new(
        run_id: String,
        agent_name: String,
        tool_call_id: String,
        session: RunSession,
        cancel: CancelToken,
        trace: Option<Arc<TraceWriter>>,
        streaming: bool,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            run_id,
            agent_name,
            tool_call_id,
            session,
            cancel,
            trace,
            streaming,
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn workspace(&self) -> Arc<Workspace> {
        self.session.workspace.clone()
    }

    pub fn history(&self) -> Arc<ConversationHistory> {
        self.session.history.clone()
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        self.session.memory.clone()
    }

    /// Emit an event through the run's event queue (progress activity,
    /// forwarded sub-agent events).
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Gate execution behind a human approval.
    fn requires_approval(&self) -> bool {
        false
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult>;
}

/// Adapter for closure-backed tools.
pub struct FuncTool {
    definition: ToolDefinition,
    requires_approval: bool,
    func: Box<dyn Fn(serde_json::Value) -> Result<ToolResult> + Send + Sync>,
}

impl FuncTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        func: impl Fn(serde_json::Value) -> Result<ToolResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            definition: ToolDefinition::new(name, description, parameters),
            requires_approval: false,
            func: Box::new(func),
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

#[async_trait]
impl Tool for FuncTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    async fn execute(&self, args: serde_json::Value, _ctx: &ToolCtx) -> Result<ToolResult> {
        (self.func)(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_joins_content_parts() {
        let mut result = ToolResult::text("first");
        result.content.push(ToolContent {
            content_type: "text".into(),
            content: "second".into(),
        });
        assert_eq!(result.rendered(), "first\nsecond");
    }

    #[test]
    fn error_text_sets_the_flag() {
        let result = ToolResult::error_text("boom");
        assert!(result.error);
        assert_eq!(result.rendered(), "boom");
    }

    #[test]
    fn terminal_builder_flag() {
        let result = ToolResult::text("done").terminal();
        assert!(result.terminal);
    }
}
