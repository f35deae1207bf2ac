//! One request/response cycle.
//!
//! A turn is created when the caller starts a run, mutated only by the run
//! that owns it, and sealed when the final assistant message arrives. Sealed
//! turns are appended to history and persisted; a turn without a reply is
//! in-flight and never rehydrated.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tiller_domain::{AssistantMessage, Message, Usage};
use tiller_workspace::{Document, FileRefEntry};

/// A named text fragment injected into the system or user template for one
/// turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub content: String,
}

/// A document produced during the turn, tagged with the tool call that
/// produced it. An empty `tool_id` means the document belongs to every tool
/// response of the round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedDocument {
    #[serde(flatten)]
    pub document: Document,
    #[serde(default)]
    pub tool_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    #[serde(default)]
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Message>,
    /// Assistant and tool messages, in the order they were observed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// The final assistant message. `None` while the turn is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<AssistantMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<AttachedDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_refs: Vec<FileRefEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_file: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Usage::is_empty")]
    pub usage: Usage,
}

impl Turn {
    pub fn new(
        turn_id: impl Into<String>,
        user_message: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        let user_message = user_message.into();
        Self {
            turn_id: turn_id.into(),
            request: Some(Message::user(user_message.clone())),
            user_message,
            messages: Vec::new(),
            reply: None,
            documents: Vec::new(),
            file_refs: Vec::new(),
            system_tags: Vec::new(),
            user_tags: Vec::new(),
            trace_file: None,
            timestamp: Utc::now(),
            agent_name: agent_name.into(),
            hidden: false,
            usage: Usage::default(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.reply.is_some()
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn add_document(&mut self, document: Document, tool_id: impl Into<String>) {
        self.documents.push(AttachedDocument {
            document,
            tool_id: tool_id.into(),
        });
    }

    pub fn add_file_refs(&mut self, refs: impl IntoIterator<Item = FileRefEntry>) {
        self.file_refs.extend(refs);
    }

    pub fn add_system_tag(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.system_tags.push(Tag {
            name: name.into(),
            content: content.into(),
        });
    }

    pub fn add_user_tag(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.user_tags.push(Tag {
            name: name.into(),
            content: content.into(),
        });
    }

    /// Documents belonging to one tool response: matching `tool_id`, plus
    /// documents with an empty `tool_id` (attached to every response).
    pub fn documents_for_call(&self, tool_call_id: &str) -> Vec<Document> {
        self.documents
            .iter()
            .filter(|d| d.tool_id.is_empty() || d.tool_id == tool_call_id)
            .map(|d| d.document.clone())
            .collect()
    }

    /// The form written to disk: ephemeral file refs never persist.
    pub fn persisted(&self) -> Turn {
        let mut turn = self.clone();
        turn.file_refs.retain(|r| !r.ephemeral);
        turn
    }
}
