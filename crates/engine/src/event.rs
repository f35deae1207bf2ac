//! Events emitted to callers during a run.

use serde::Serialize;

use tiller_workspace::Document;

/// Identity fields carried by every event.
#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub run_id: String,
    pub agent_name: String,
    pub session_id: String,
}

/// Events observable by the caller draining a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// A model call is starting.
    #[serde(rename = "llm_call")]
    LlmCall {
        #[serde(flatten)]
        meta: EventMeta,
        message: String,
    },

    /// Assistant text — a streaming delta or a whole response.
    #[serde(rename = "content")]
    Content {
        #[serde(flatten)]
        meta: EventMeta,
        content: String,
    },

    /// Model scratchpad text.
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(flatten)]
        meta: EventMeta,
        content: String,
    },

    /// A tool is being invoked.
    #[serde(rename = "tool")]
    Tool {
        #[serde(flatten)]
        meta: EventMeta,
        event_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: String,
    },

    /// A tool call resolved, with the documents it produced.
    #[serde(rename = "tool_response")]
    ToolResponse {
        #[serde(flatten)]
        meta: EventMeta,
        tool_call_id: String,
        tool_name: String,
        content: String,
        documents: Vec<Document>,
    },

    /// A tool is waiting for human approval.
    #[serde(rename = "approval")]
    Approval {
        #[serde(flatten)]
        meta: EventMeta,
        approval_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: String,
    },

    /// The run failed.
    #[serde(rename = "error")]
    Error {
        #[serde(flatten)]
        meta: EventMeta,
        message: String,
    },
}

impl AgentEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            AgentEvent::LlmCall { meta, .. }
            | AgentEvent::Content { meta, .. }
            | AgentEvent::Thinking { meta, .. }
            | AgentEvent::Tool { meta, .. }
            | AgentEvent::ToolResponse { meta, .. }
            | AgentEvent::Approval { meta, .. }
            | AgentEvent::Error { meta, .. } => meta,
        }
    }
}
