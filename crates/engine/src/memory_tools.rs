//! The three memory tools exposed to the model.
//!
//! `save_memory` / `get_memory` / `clear_memory` operate on the session's
//! compartment store. A full compartment surfaces as a tool error telling
//! the model to clear before saving again.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tiller_context::MemoryScope;
use tiller_domain::{Error, Result, ToolDefinition};

use crate::tool::{Tool, ToolCtx, ToolResult};

fn scope_from(args: &serde_json::Value) -> Result<MemoryScope> {
    let raw = args
        .get("scope")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput("missing 'scope'".into()))?;
    MemoryScope::parse(raw)
        .ok_or_else(|| Error::InvalidInput(format!("unknown scope: {raw} (run|session|plan)")))
}

fn scope_schema() -> serde_json::Value {
    json!({
        "type": "string",
        "enum": ["run", "session", "plan"],
        "description": "The memory compartment."
    })
}

pub struct SaveMemoryTool;

#[async_trait]
impl Tool for SaveMemoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "save_memory",
            "Save a fact to a memory compartment. Only run memory is injected \
             into the prompt automatically.",
            json!({
                "type": "object",
                "properties": {
                    "scope": scope_schema(),
                    "description": { "type": "string", "description": "Short label for the fact." },
                    "content": { "type": "string", "description": "The fact to remember." }
                },
                "required": ["scope", "description", "content"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let scope = scope_from(&args)?;
        let description = args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("missing 'content'".into()))?;

        match ctx
            .memory()
            .save(scope, description, content, ctx.run_id.clone())
        {
            Ok(entry) => Ok(ToolResult::text(format!(
                "saved to {} memory: {}",
                scope.as_str(),
                entry.id
            ))),
            // Compartment-full is conversation, not a run failure.
            Err(e) => Ok(ToolResult::error_text(e.to_string())),
        }
    }
}

pub struct GetMemoryTool;

#[async_trait]
impl Tool for GetMemoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_memory",
            "Read every entry in a memory compartment.",
            json!({
                "type": "object",
                "properties": { "scope": scope_schema() },
                "required": ["scope"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let scope = scope_from(&args)?;
        let entries = ctx.memory().get(scope);
        if entries.is_empty() {
            return Ok(ToolResult::text(format!(
                "no {} memories",
                scope.as_str()
            )));
        }
        let mut out = String::new();
        for entry in entries {
            out.push_str(&format!("- {}: {}\n", entry.description, entry.content));
        }
        Ok(ToolResult::text(out.trim_end()))
    }
}

pub struct ClearMemoryTool;

#[async_trait]
impl Tool for ClearMemoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "clear_memory",
            "Remove every entry in a memory compartment.",
            json!({
                "type": "object",
                "properties": { "scope": scope_schema() },
                "required": ["scope"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let scope = scope_from(&args)?;
        let removed = ctx.memory().clear(scope)?;
        Ok(ToolResult::text(format!(
            "cleared {removed} entries from {} memory",
            scope.as_str()
        )))
    }
}

/// The full memory toolset, ready to hand to an agent.
pub fn memory_toolset() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SaveMemoryTool),
        Arc::new(GetMemoryTool),
        Arc::new(ClearMemoryTool),
    ]
}
