//! Interceptors — transformers applied around model and tool calls.
//!
//! Chains run in registration order for both the before and after hooks.
//! The trace interceptor is always appended last so it observes the final
//! request and response. A hook error is fatal to the run.

use async_trait::async_trait;

use tiller_domain::{AssistantMessage, Result, ToolCall};

use crate::model::ModelRequest;
use crate::tool::ToolResult;

#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Transform (or reject) the model request before it is sent.
    async fn before_call(&self, _req: &mut ModelRequest) -> Result<()> {
        Ok(())
    }

    /// Transform (or reject) the model response.
    async fn after_call(&self, _resp: &mut AssistantMessage) -> Result<()> {
        Ok(())
    }

    /// Transform (or reject) tool arguments before execution.
    async fn before_tool_call(
        &self,
        _call: &ToolCall,
        _args: &mut serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    /// Transform (or reject) a tool result.
    async fn after_tool_call(&self, _call: &ToolCall, _result: &mut ToolResult) -> Result<()> {
        Ok(())
    }
}
