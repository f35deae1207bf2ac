//! Conversation state — turns and their append-only history.

pub mod history;
pub mod turn;

pub use history::ConversationHistory;
pub use turn::{AttachedDocument, Tag, Turn};
