//! Shared domain types for tiller — the message model, tool call format,
//! usage counters, and the error taxonomy every crate speaks.

pub mod error;
pub mod message;
pub mod tool;
pub mod usage;

pub use error::{Error, Result};
pub use message::{
    AssistantMessage, Message, ResourceMessage, SystemMessage, ToolMessage, UserMessage,
};
pub use tool::{ToolCall, ToolDefinition};
pub use usage::Usage;
