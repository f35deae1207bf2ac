//! Per-turn trace files.
//!
//! When tracing is enabled, every model request/response and tool
//! invocation of a turn is appended to `_private/turns/<turnID>/trace.txt`.
//! Sub-agents share the parent's writer, and a sub-agent finishing does not
//! close it — the file is append-only with no close step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use tiller_domain::{AssistantMessage, Message, Result, ToolCall};

use crate::interceptor::Interceptor;
use crate::model::ModelRequest;
use crate::tool::ToolResult;

pub struct TraceWriter {
    path: PathBuf,
}

impl TraceWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, section: &str, body: &str) {
        use std::io::Write;
        let entry = format!(
            "=== {} {}\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            section,
            body.trim_end()
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append trace");
        }
    }

    pub fn record_request(&self, agent: &str, messages: &[Message]) {
        let rendered: String = messages
            .iter()
            .map(render_message)
            .collect::<Vec<_>>()
            .join("\n");
        self.append(&format!("request agent={agent}"), &rendered);
    }

    pub fn record_response(&self, agent: &str, response: &AssistantMessage) {
        let mut body = response.content.clone();
        for call in &response.tool_calls {
            body.push_str(&format!("\n[tool_call {} {}({})]", call.id, call.name, call.arguments));
        }
        self.append(&format!("response agent={agent}"), &body);
    }

    pub fn record_tool(&self, call: &ToolCall, output: &str, is_error: bool) {
        let status = if is_error { "error" } else { "ok" };
        self.append(
            &format!("tool {} id={} status={status}", call.name, call.id),
            output,
        );
    }

    pub fn record_error(&self, message: &str) {
        self.append("error", message);
    }
}

fn render_message(message: &Message) -> String {
    match message {
        Message::System(m) => format!("[system] {}", m.content),
        Message::User(m) => format!("[user] {}", m.content),
        Message::Assistant(m) => format!("[assistant] {}", m.content),
        Message::Tool(m) => format!("[tool {}] {}", m.tool_name, m.content),
        Message::Resource(m) => format!("[resource {}]", m.filename),
    }
}

/// Appended last in the interceptor chain so it sees the final payloads.
pub struct TraceInterceptor {
    writer: Arc<TraceWriter>,
    agent_name: String,
}

impl TraceInterceptor {
    pub fn new(writer: Arc<TraceWriter>, agent_name: impl Into<String>) -> Self {
        Self {
            writer,
            agent_name: agent_name.into(),
        }
    }
}

#[async_trait]
impl Interceptor for TraceInterceptor {
    fn name(&self) -> &str {
        "trace"
    }

    async fn before_call(&self, req: &mut ModelRequest) -> Result<()> {
        self.writer.record_request(&self.agent_name, &req.messages);
        Ok(())
    }

    async fn after_call(&self, resp: &mut AssistantMessage) -> Result<()> {
        self.writer.record_response(&self.agent_name, resp);
        Ok(())
    }

    async fn after_tool_call(&self, call: &ToolCall, result: &mut ToolResult) -> Result<()> {
        self.writer.record_tool(call, &result.rendered(), result.error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TraceWriter::create(dir.path().join("000001/trace.txt")).unwrap();

        writer.record_request("agent-1", &[Message::user("hi")]);
        writer.record_response("agent-1", &AssistantMessage::text("hello"));
        writer.record_error("boom");

        let raw = std::fs::read_to_string(writer.path()).unwrap();
        let req_pos = raw.find("request agent=agent-1").unwrap();
        let resp_pos = raw.find("response agent=agent-1").unwrap();
        let err_pos = raw.find("=== ").unwrap();
        assert!(req_pos < resp_pos);
        assert!(err_pos <= req_pos);
        assert!(raw.contains("[user] hi"));
        assert!(raw.contains("boom"));
    }
}
