//! Scripted model and tool helpers for tests and examples.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use tiller_domain::{AssistantMessage, Error, Result, ToolCall};

use crate::model::{BoxStream, Model, ModelRequest, StreamItem};
use crate::tool::{FuncTool, ToolResult};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// A whole assistant message.
    Message(AssistantMessage),
    /// Chunks followed by a canonical final message (streaming runs).
    Chunked {
        chunks: Vec<AssistantMessage>,
        final_message: AssistantMessage,
    },
    /// A model failure.
    Fail(String),
}

/// A model that replays a fixed script and records every request.
pub struct MockModel {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModel {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// How many times the model was invoked.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request the model saw, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    fn next(&self, req: ModelRequest) -> Result<Scripted> {
        self.requests.lock().push(req);
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Model("mock script exhausted".into()))
    }
}

#[async_trait]
impl Model for MockModel {
    async fn call(&self, req: ModelRequest) -> Result<AssistantMessage> {
        match self.next(req)? {
            Scripted::Message(message) => Ok(message),
            Scripted::Chunked { final_message, .. } => Ok(final_message),
            Scripted::Fail(message) => Err(Error::Model(message)),
        }
    }

    async fn stream(&self, req: ModelRequest) -> Result<BoxStream<'static, Result<StreamItem>>> {
        let items: Vec<Result<StreamItem>> = match self.next(req)? {
            Scripted::Message(message) => vec![Ok(StreamItem::Final(message))],
            Scripted::Chunked {
                chunks,
                final_message,
            } => chunks
                .into_iter()
                .map(|c| Ok(StreamItem::Chunk(c)))
                .chain([Ok(StreamItem::Final(final_message))])
                .collect(),
            Scripted::Fail(message) => vec![Err(Error::Model(message))],
        };
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// A plain text reply.
pub fn reply(text: impl Into<String>) -> Scripted {
    Scripted::Message(AssistantMessage::text(text))
}

/// A reply carrying tool calls.
pub fn reply_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Scripted {
    Scripted::Message(AssistantMessage {
        content: text.into(),
        tool_calls: calls,
        ..Default::default()
    })
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: arguments.into(),
    }
}

/// An `echo(text)` tool that returns its input.
pub fn echo_tool() -> Arc<FuncTool> {
    Arc::new(FuncTool::new(
        "echo",
        "Repeat the given text.",
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        }),
        |args| {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(ToolResult::text(text))
        },
    ))
}
