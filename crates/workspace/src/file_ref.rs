use serde::{Deserialize, Serialize};

/// A reference to a workspace file that a tool wants carried into the next
/// turn's prompt.
///
/// Ephemeral refs are consumed once and never written into turn records;
/// the turn serializer filters them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRefEntry {
    /// Path relative to the workspace's model-visible directory.
    pub path: String,
    /// Overrides the referenced document's MIME type when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Load the content and attach it to the next prompt.
    #[serde(default)]
    pub include_in_prompt: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub user_upload: bool,
}

impl FileRefEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: None,
            include_in_prompt: false,
            ephemeral: false,
            user_upload: false,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn include_in_prompt(mut self) -> Self {
        self.include_in_prompt = true;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}
