//! The model contract.
//!
//! Concrete transports live outside this crate. A model is anything that
//! takes messages and tool definitions and returns an assistant message —
//! either whole, or as a stream of chunk messages followed by one canonical
//! final message.

use std::pin::Pin;

use async_trait::async_trait;

use tiller_domain::{AssistantMessage, Message, Result, ToolDefinition};

use crate::cancel::CancelToken;

/// A boxed async stream, used for streamed model responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One model invocation.
#[derive(Clone)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Implementations are expected to return promptly once this trips.
    pub cancel: CancelToken,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            messages,
            tools,
            cancel: CancelToken::new(),
        }
    }
}

/// An item of a streamed response. Chunks may carry partial content,
/// partial thinking, and/or a subset of tool calls; `Final` carries the
/// canonical whole message.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Chunk(AssistantMessage),
    Final(AssistantMessage),
}

#[async_trait]
pub trait Model: Send + Sync {
    /// One blocking call, returning the full assistant message.
    async fn call(&self, req: ModelRequest) -> Result<AssistantMessage>;

    /// Streamed call. The default implementation falls back to [`call`] and
    /// yields a single `Final` item, so non-streaming models work under a
    /// streaming run unchanged.
    ///
    /// [`call`]: Model::call
    async fn stream(&self, req: ModelRequest) -> Result<BoxStream<'static, Result<StreamItem>>> {
        let message = self.call(req).await?;
        Ok(Box::pin(futures_util::stream::iter([Ok(StreamItem::Final(
            message,
        ))])))
    }
}
