//! The agent context — standing state plus the prompt assembler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tiller_domain::{
    AssistantMessage, Error, Message, ResourceMessage, Result, ToolDefinition, Usage,
};
use tiller_sessions::{ConversationHistory, Turn};
use tiller_workspace::jsonio::{read_json_or_default, write_json_atomic};
use tiller_workspace::{FileRefEntry, Workspace};

use crate::memory::{MemoryScope, MemoryStore};
use crate::skills::{self, Skill};
use crate::templates::{self, DEFAULT_SYSTEM_TEMPLATE, DEFAULT_USER_TEMPLATE};

const CONTEXT_FILE: &str = "context.json";
const MEMORY_FILE: &str = "memory.json";

/// Metadata persisted to `_private/context.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContextMeta {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    turn_counter: u64,
    #[serde(default)]
    memory_dir: String,
    #[serde(default)]
    flags: HashMap<String, bool>,
}

/// Standing state for one agent: identity, templates, skills, the current
/// turn, the workspace, and the conversation history.
pub struct AgentContext {
    id: String,
    name: String,
    description: String,
    instructions: String,
    output_instructions: String,
    summary: String,
    system_template: String,
    user_template: String,
    skills: Vec<Skill>,
    flags: HashMap<String, bool>,
    workspace: Arc<Workspace>,
    history: Arc<ConversationHistory>,
    memory: Arc<MemoryStore>,
    /// Shared between every context on the same workspace (parent and
    /// sub-agents), so turn IDs stay unique within one history.
    turn_counter: Arc<Mutex<u64>>,
    current_turn: Mutex<Option<Turn>>,
}

impl AgentContext {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        workspace: Arc<Workspace>,
        history: Arc<ConversationHistory>,
    ) -> Result<Self> {
        let memory = Arc::new(MemoryStore::open(
            workspace.private_dir().join(MEMORY_FILE),
        )?);
        Ok(Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            output_instructions: String::new(),
            summary: String::new(),
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
            skills: Vec::new(),
            flags: HashMap::new(),
            workspace,
            history,
            memory,
            turn_counter: Arc::new(Mutex::new(0)),
            current_turn: Mutex::new(None),
        })
    }

    /// Rehydrate a context from a workspace root written by an earlier
    /// session: layout, metadata, history, and memory store.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let workspace = Arc::new(Workspace::open(root.as_ref())?);
        let meta: ContextMeta =
            read_json_or_default(&workspace.private_dir().join(CONTEXT_FILE))?;
        if !meta.memory_dir.is_empty() {
            workspace.set_memory_dir(&meta.memory_dir)?;
        }
        let history = Arc::new(ConversationHistory::open(&workspace)?);

        let mut ctx = Self::new(meta.id, meta.name, workspace, history)?;
        ctx.description = meta.description;
        ctx.summary = meta.summary;
        ctx.flags = meta.flags;
        *ctx.turn_counter.lock() = meta.turn_counter;
        Ok(ctx)
    }

    /// Write `context.json`.
    pub fn save(&self) -> Result<()> {
        let meta = ContextMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            summary: self.summary.clone(),
            turn_counter: *self.turn_counter.lock(),
            memory_dir: self.workspace.memory_dir().unwrap_or_default(),
            flags: self.flags.clone(),
        };
        write_json_atomic(&self.workspace.private_dir().join(CONTEXT_FILE), &meta)
    }

    // ── Configuration ──────────────────────────────────────────────

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_output_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.output_instructions = instructions.into();
        self
    }

    pub fn with_system_template(mut self, template: impl Into<String>) -> Self {
        self.system_template = template.into();
        self
    }

    pub fn with_user_template(mut self, template: impl Into<String>) -> Self {
        self.user_template = template.into();
        self
    }

    pub fn with_skills(mut self, skills: Vec<Skill>) -> Self {
        self.skills = skills;
        self
    }

    /// Share an existing memory store instead of the one opened from the
    /// workspace. A child agent passes its parent's store so both see the
    /// same compartments.
    pub fn with_memory_store(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    /// Share a turn counter. Contexts running over the same workspace must
    /// allocate from one counter or turn IDs collide.
    pub fn with_turn_counter(mut self, counter: Arc<Mutex<u64>>) -> Self {
        self.turn_counter = counter;
        self
    }

    pub fn turn_counter(&self) -> Arc<Mutex<u64>> {
        self.turn_counter.clone()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workspace(&self) -> Arc<Workspace> {
        self.workspace.clone()
    }

    pub fn history(&self) -> Arc<ConversationHistory> {
        self.history.clone()
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }

    // ── Turn lifecycle ─────────────────────────────────────────────

    /// Open a turn: allocate the next ID, stamp the timestamp, install it
    /// as current. Returns the new turn ID.
    pub fn start_turn(&self, user_message: &str) -> Result<String> {
        let turn_id = {
            let mut counter = self.turn_counter.lock();
            *counter += 1;
            format!("{:06}", *counter)
        };
        let turn = Turn::new(turn_id.as_str(), user_message, self.name.as_str());
        *self.current_turn.lock() = Some(turn);
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "failed to persist context metadata");
        }
        Ok(turn_id)
    }

    /// Seal the current turn with the final assistant message and append it
    /// to history (which persists it). Returns the sealed turn.
    pub fn end_turn(&self, reply: AssistantMessage, usage: Usage) -> Result<Turn> {
        let mut slot = self.current_turn.lock();
        let mut turn = slot
            .take()
            .ok_or_else(|| Error::Other("no turn in progress".into()))?;
        turn.reply = Some(reply);
        turn.usage = usage;
        self.history.append(turn.clone());
        Ok(turn)
    }

    pub fn has_turn(&self) -> bool {
        self.current_turn.lock().is_some()
    }

    /// Run a closure against the current turn. Returns None when no turn is
    /// open.
    pub fn with_turn<R>(&self, f: impl FnOnce(&mut Turn) -> R) -> Option<R> {
        self.current_turn.lock().as_mut().map(f)
    }

    pub fn turn_snapshot(&self) -> Option<Turn> {
        self.current_turn.lock().clone()
    }

    // ── Prompt assembly ────────────────────────────────────────────

    /// Build the ordered message list for one model call: system message,
    /// compaction summaries, history, documents manifest, user message,
    /// attached document bodies, then the in-flight turn's own messages.
    pub fn build_prompt(
        &self,
        tools: &[ToolDefinition],
        include_history: bool,
    ) -> Result<Vec<Message>> {
        let turn = self
            .turn_snapshot()
            .ok_or_else(|| Error::Other("no turn in progress".into()))?;

        let mut messages = Vec::new();

        // 1. System message.
        messages.push(Message::system(self.render_system(tools, &turn)?));

        // 2. Compaction summaries, chronological.
        for summary in self.history.summaries() {
            messages.push(Message::user(format!(
                "[Summary for {}]: {}",
                summary.date.format("%Y-%m-%d"),
                summary.summary
            )));
        }

        // 3. History.
        if include_history {
            messages.extend(self.history.messages());
        }

        // 4. Documents manifest.
        if let Some(manifest) = render_manifest(&turn) {
            messages.push(Message::user(manifest));
        }

        // 5. Current user message.
        messages.push(Message::user(self.render_user(&turn)?));

        // 6. Attached document bodies and prompt-included file refs.
        messages.extend(self.resource_messages(&turn));

        // 7. The turn's accumulated assistant/tool messages.
        messages.extend(turn.messages.iter().cloned());

        Ok(messages)
    }

    fn render_system(&self, tools: &[ToolDefinition], turn: &Turn) -> Result<String> {
        let tools_section = if tools.is_empty() {
            String::new()
        } else {
            let mut s = String::from("Tools:\n");
            for tool in tools {
                s.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            }
            s.trim_end().to_string()
        };

        let documents_section = self.render_memory_files();
        let memories_section = self.render_run_memories();
        let tags_section = render_tags(&turn.system_tags);

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("role", self.description.clone());
        vars.insert("instructions", self.instructions.clone());
        vars.insert("output_instructions", self.output_instructions.clone());
        vars.insert("tools", tools_section);
        vars.insert("skills", skills::render_index(&self.skills));
        vars.insert("documents", documents_section);
        vars.insert("memories", memories_section);
        vars.insert("system_tags", tags_section);

        templates::render(&self.system_template, &vars)
    }

    fn render_user(&self, turn: &Turn) -> Result<String> {
        let refs_section = if turn.file_refs.is_empty() {
            String::new()
        } else {
            let mut s = String::from("Files:\n");
            for r in &turn.file_refs {
                s.push_str(&format!("- {}\n", r.path));
            }
            s.trim_end().to_string()
        };

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("message", turn.user_message.clone());
        vars.insert("user_tags", render_tags(&turn.user_tags));
        vars.insert("file_refs", refs_section);

        templates::render(&self.user_template, &vars)
    }

    /// Memory files as `<document>` blocks, paths relative to `llm/`.
    /// Unreadable files are skipped with a warning — one broken file must
    /// not break the turn.
    fn render_memory_files(&self) -> String {
        let files = match self.workspace.memory_files() {
            Ok(Some(files)) if !files.is_empty() => files,
            Ok(_) => return String::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list memory files");
                return String::new();
            }
        };

        let mut out = String::new();
        for doc in files {
            match doc.text() {
                Ok(text) => {
                    out.push_str(&format!(
                        "<document name=\"{}\">\n{}\n</document>\n",
                        doc.file_path(),
                        text.trim_end()
                    ));
                }
                Err(e) => {
                    tracing::warn!(path = doc.file_path(), error = %e, "skipping unreadable memory file");
                }
            }
        }
        out.trim_end().to_string()
    }

    fn render_run_memories(&self) -> String {
        let entries = self.memory.get(MemoryScope::Run);
        if entries.is_empty() {
            return String::new();
        }
        let mut out = String::from("Memory:\n");
        for entry in entries {
            out.push_str(&format!("- {}: {}\n", entry.description, entry.content));
        }
        out.trim_end().to_string()
    }

    fn resource_messages(&self, turn: &Turn) -> Vec<Message> {
        let mut out = Vec::new();

        for attached in &turn.documents {
            let doc = &attached.document;
            match doc.bytes() {
                Ok(body) => out.push(Message::Resource(ResourceMessage {
                    filename: doc.filename().to_string(),
                    uri: Some(doc.file_path().to_string()),
                    mime_type: Some(doc.mime_type().to_string()),
                    body: Some(body),
                })),
                Err(e) => {
                    tracing::warn!(id = doc.id(), error = %e, "skipping unreadable document");
                }
            }
        }

        for file_ref in turn.file_refs.iter().filter(|r| r.include_in_prompt) {
            out.extend(self.file_ref_resource(file_ref));
        }

        out
    }

    fn file_ref_resource(&self, file_ref: &FileRefEntry) -> Option<Message> {
        let doc = match self.workspace.get_document(&file_ref.path) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(path = %file_ref.path, error = %e, "skipping unreadable file ref");
                return None;
            }
        };
        let body = match doc.bytes() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(path = %file_ref.path, error = %e, "skipping unreadable file ref");
                return None;
            }
        };
        // The ref's MIME overrides the document's when provided.
        let mime = file_ref
            .mime_type
            .clone()
            .unwrap_or_else(|| doc.mime_type().to_string());
        Some(Message::Resource(ResourceMessage {
            filename: doc.filename().to_string(),
            uri: Some(doc.file_path().to_string()),
            mime_type: Some(mime),
            body: Some(body),
        }))
    }
}

fn render_tags(tags: &[tiller_sessions::Tag]) -> String {
    let mut out = String::new();
    for tag in tags {
        out.push_str(&format!("<{}>\n{}\n</{}>\n", tag.name, tag.content, tag.name));
    }
    out.trim_end().to_string()
}

/// The documents-manifest message. None when the turn has neither attached
/// documents nor file refs.
fn render_manifest(turn: &Turn) -> Option<String> {
    if turn.documents.is_empty() && turn.file_refs.is_empty() {
        return None;
    }

    let mut out = String::from("Attached documents:\n");
    for attached in &turn.documents {
        let doc = &attached.document;
        out.push_str(&format!(
            "- {} ({}, {})\n",
            doc.file_path(),
            doc.filename(),
            doc.mime_type()
        ));
    }
    if !turn.file_refs.is_empty() {
        out.push_str("File references:\n");
        for r in &turn.file_refs {
            out.push_str(&format!("- {}\n", r.path));
        }
    }
    Some(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_workspace::Document;

    fn make_context() -> (tempfile::TempDir, AgentContext) {
        let base = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::create(base.path(), "agent-1").unwrap());
        let history = Arc::new(ConversationHistory::open(&workspace).unwrap());
        let ctx = AgentContext::new("ctx-1", "agent-1", workspace, history)
            .unwrap()
            .with_description("You are a test agent.")
            .with_instructions("Answer briefly.");
        (base, ctx)
    }

    fn message_kinds(messages: &[Message]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| match m {
                Message::System(_) => "system",
                Message::User(_) => "user",
                Message::Assistant(_) => "assistant",
                Message::Tool(_) => "tool",
                Message::Resource(_) => "resource",
            })
            .collect()
    }

    #[test]
    fn turn_ids_are_monotonic_zero_padded() {
        let (_base, ctx) = make_context();
        assert_eq!(ctx.start_turn("one").unwrap(), "000001");
        ctx.end_turn(AssistantMessage::text("ok"), Usage::default())
            .unwrap();
        assert_eq!(ctx.start_turn("two").unwrap(), "000002");
    }

    #[test]
    fn build_prompt_orders_sections() {
        let (_base, ctx) = make_context();
        // Seed one completed turn so history is non-empty.
        ctx.start_turn("earlier").unwrap();
        ctx.end_turn(AssistantMessage::text("done"), Usage::default())
            .unwrap();

        ctx.start_turn("now").unwrap();
        ctx.with_turn(|t| {
            t.add_document(Document::from_bytes("a.txt", b"body".to_vec(), ""), "");
            t.add_message(Message::assistant("thinking"));
            t.add_message(Message::tool_response("tc_1", "echo", "out"));
        });

        let messages = ctx.build_prompt(&[], true).unwrap();
        assert_eq!(
            message_kinds(&messages),
            vec![
                "system",     // 1. rendered system template
                "user",       // 3. history: request
                "assistant",  //    history: reply
                "user",       // 4. manifest
                "user",       // 5. current user message
                "resource",   // 6. attached document body
                "assistant",  // 7. in-turn messages
                "tool",
            ]
        );
        assert!(messages[0].content().unwrap().contains("You are a test agent."));
        assert!(messages[3].content().unwrap().contains("a.txt"));
        assert_eq!(messages[4].content(), Some("now"));
    }

    #[test]
    fn build_prompt_puts_summaries_before_history() {
        let (_base, ctx) = make_context();
        ctx.history().apply_compaction(
            &[],
            tiller_workspace::CompactionSummary {
                date: "2026-07-01".parse().unwrap(),
                summary: "old work".into(),
                turn_count: 3,
            },
        );
        ctx.start_turn("hi").unwrap();

        let messages = ctx.build_prompt(&[], true).unwrap();
        assert_eq!(
            messages[1].content(),
            Some("[Summary for 2026-07-01]: old work")
        );
    }

    #[test]
    fn build_prompt_omits_manifest_without_attachments() {
        let (_base, ctx) = make_context();
        ctx.start_turn("plain").unwrap();
        let messages = ctx.build_prompt(&[], false).unwrap();
        assert_eq!(message_kinds(&messages), vec!["system", "user"]);
    }

    #[test]
    fn system_message_lists_tools_and_tags() {
        let (_base, ctx) = make_context();
        ctx.start_turn("hi").unwrap();
        ctx.with_turn(|t| t.add_system_tag("policy", "be nice"));

        let tools = vec![ToolDefinition::new(
            "echo",
            "repeat the input",
            serde_json::json!({"type": "object"}),
        )];
        let messages = ctx.build_prompt(&tools, false).unwrap();
        let system = messages[0].content().unwrap();
        assert!(system.contains("- echo: repeat the input"));
        assert!(system.contains("<policy>\nbe nice\n</policy>"));
    }

    #[test]
    fn memory_files_render_as_document_blocks() {
        let (_base, ctx) = make_context();
        ctx.workspace().set_memory_dir("memory").unwrap();
        ctx.workspace()
            .upload_document("memory/facts.md", b"user likes tea", "")
            .unwrap();
        ctx.start_turn("hi").unwrap();

        let messages = ctx.build_prompt(&[], false).unwrap();
        let system = messages[0].content().unwrap();
        assert!(system.contains("<document name=\"memory/facts.md\">"));
        assert!(system.contains("user likes tea"));
    }

    #[test]
    fn run_memory_is_injected_other_scopes_are_not() {
        let (_base, ctx) = make_context();
        ctx.memory()
            .save(MemoryScope::Run, "goal", "finish the report", "run-1")
            .unwrap();
        ctx.memory()
            .save(MemoryScope::Session, "secret", "not in prompt", "run-1")
            .unwrap();
        ctx.start_turn("hi").unwrap();

        let system = ctx.build_prompt(&[], false).unwrap()[0]
            .content()
            .unwrap()
            .to_string();
        assert!(system.contains("finish the report"));
        assert!(!system.contains("not in prompt"));
    }

    #[test]
    fn include_in_prompt_ref_attaches_body_with_mime_override() {
        let (_base, ctx) = make_context();
        ctx.workspace()
            .upload_document("output/data.txt", b"payload", "")
            .unwrap();
        ctx.start_turn("hi").unwrap();
        ctx.with_turn(|t| {
            t.add_file_refs([FileRefEntry::new("output/data.txt")
                .with_mime("application/json")
                .include_in_prompt()])
        });

        let messages = ctx.build_prompt(&[], false).unwrap();
        let resource = messages.last().unwrap();
        match resource {
            Message::Resource(r) => {
                assert_eq!(r.mime_type.as_deref(), Some("application/json"));
                assert_eq!(r.body.as_deref(), Some(b"payload".as_ref()));
            }
            other => panic!("expected resource message, got {other:?}"),
        }
    }

    #[test]
    fn unreadable_file_ref_is_skipped_not_fatal() {
        let (_base, ctx) = make_context();
        ctx.start_turn("hi").unwrap();
        ctx.with_turn(|t| {
            t.add_file_refs([FileRefEntry::new("output/missing.txt").include_in_prompt()])
        });

        let messages = ctx.build_prompt(&[], false).unwrap();
        assert!(!message_kinds(&messages).contains(&"resource"));
    }

    #[test]
    fn template_error_surfaces() {
        let (_base, ctx) = make_context();
        let ctx = ctx.with_system_template("{{unknown_slot}}");
        ctx.start_turn("hi").unwrap();
        let err = ctx.build_prompt(&[], false).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn load_rehydrates_metadata_and_documents() {
        let base = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::create(base.path(), "agent-1").unwrap());
        let root = workspace.root().to_path_buf();
        workspace
            .upload_document("uploads/a.txt", b"hello", "")
            .unwrap();
        let history = Arc::new(ConversationHistory::open(&workspace).unwrap());
        let ctx = AgentContext::new("ctx-1", "agent-1", workspace, history).unwrap();
        ctx.start_turn("hi").unwrap();
        ctx.end_turn(AssistantMessage::text("ok"), Usage::default())
            .unwrap();
        drop(ctx);

        let loaded = AgentContext::load(&root).unwrap();
        assert_eq!(loaded.id(), "ctx-1");
        assert_eq!(loaded.history().len(), 1);
        let docs = loaded.workspace().documents().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text().unwrap(), "hello");
        // The counter continues where it left off.
        assert_eq!(loaded.start_turn("next").unwrap(), "000002");
    }
}
