//! Prompt assembly and standing state for one agent.
//!
//! `AgentContext` owns the current turn and the conversation history, and
//! projects durable state — memory files, uploaded documents, compaction
//! summaries, history — into the ordered message list sent to the model on
//! every call.

mod context;
pub mod memory;
pub mod skills;
pub mod templates;

pub use context::AgentContext;
pub use memory::{MemoryEntry, MemoryScope, MemoryStore};
pub use skills::Skill;
