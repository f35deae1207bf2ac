//! Workspace layout and document CRUD.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use walkdir::WalkDir;

use tiller_domain::{Error, Result};

use crate::document::{store_for_root, Document, LocalStore};
use crate::{mime, paths};

/// Subdirectory names of the on-disk layout.
pub(crate) const LLM_DIR: &str = "llm";
pub(crate) const UPLOADS_DIR: &str = "uploads";
pub(crate) const OUTPUT_DIR: &str = "output";
pub(crate) const PRIVATE_DIR: &str = "_private";
pub(crate) const TURNS_DIR: &str = "turns";
pub(crate) const ARCHIVE_DIR: &str = "archive";
pub(crate) const ARCHIVE_STAGING_PREFIX: &str = ".archive-tmp-";

/// The on-disk root for one agent session.
///
/// `llm/` is the only subtree the model may see; `_private/` holds turn
/// records, summaries, and archives.
pub struct Workspace {
    root: PathBuf,
    memory_dir: RwLock<Option<String>>,
    store: Arc<LocalStore>,
    /// Caller-supplied MIME types, keyed by normalized path. Extension
    /// detection covers everything else.
    mime_overrides: RwLock<HashMap<String, String>>,
}

impl Workspace {
    /// Create a fresh workspace under `base_dir`, named
    /// `<timestamp>-<agent_id>` so roots stay unique across time. Collisions
    /// within the same second get a numeric suffix.
    pub fn create(base_dir: impl AsRef<Path>, agent_id: &str) -> Result<Self> {
        let base = base_dir.as_ref();
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let mut root = base.join(format!("{stamp}-{agent_id}"));
        let mut attempt = 1;
        while root.exists() {
            attempt += 1;
            root = base.join(format!("{stamp}-{agent_id}-{attempt}"));
        }
        Self::open(root)
    }

    /// Attach to an exact root path, creating the layout when missing and
    /// purging any archive staging directory left by a crash.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [
            root.join(LLM_DIR),
            root.join(LLM_DIR).join(UPLOADS_DIR),
            root.join(LLM_DIR).join(OUTPUT_DIR),
            root.join(PRIVATE_DIR),
            root.join(PRIVATE_DIR).join(TURNS_DIR),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let ws = Self {
            store: store_for_root(&root.join(LLM_DIR)),
            root,
            memory_dir: RwLock::new(None),
            mime_overrides: RwLock::new(HashMap::new()),
        };
        ws.purge_stale_staging();
        Ok(ws)
    }

    // ── Directories ────────────────────────────────────────────────

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn llm_dir(&self) -> PathBuf {
        self.root.join(LLM_DIR)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.llm_dir().join(UPLOADS_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.llm_dir().join(OUTPUT_DIR)
    }

    pub fn private_dir(&self) -> PathBuf {
        self.root.join(PRIVATE_DIR)
    }

    pub fn turns_dir(&self) -> PathBuf {
        self.private_dir().join(TURNS_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.private_dir().join(ARCHIVE_DIR)
    }

    /// The store serving documents below `llm/`.
    pub fn store(&self) -> Arc<LocalStore> {
        self.store.clone()
    }

    // ── Memory directory ───────────────────────────────────────────

    /// Set the memory subtree, relative to `llm/`. An empty string clears it.
    pub fn set_memory_dir(&self, dir: &str) -> Result<()> {
        if dir.is_empty() {
            *self.memory_dir.write() = None;
            return Ok(());
        }
        let normalized = paths::normalize(dir)?;
        std::fs::create_dir_all(self.llm_dir().join(&normalized))?;
        *self.memory_dir.write() = Some(normalized);
        Ok(())
    }

    pub fn memory_dir(&self) -> Option<String> {
        self.memory_dir.read().clone()
    }

    /// Documents under the memory subtree, or None when no memory dir is
    /// configured. Served through the registered store so IDs stay stable.
    pub fn memory_files(&self) -> Result<Option<Vec<Document>>> {
        match self.memory_dir() {
            None => Ok(None),
            Some(dir) => Ok(Some(self.list_documents(Some(&dir))?)),
        }
    }

    // ── Document CRUD ──────────────────────────────────────────────

    /// Write `bytes` under `llm/<path>`, creating parents. Returns the
    /// normalized path. MIME is auto-detected when empty.
    pub fn upload_document(&self, path: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
        let rel = paths::normalize(path)?;
        let abs = self.llm_dir().join(&rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&abs, bytes)?;
        if !mime_type.is_empty() {
            self.mime_overrides
                .write()
                .insert(rel.clone(), mime_type.to_string());
        }
        Ok(rel)
    }

    /// Fetch one document by its `llm/`-relative path.
    pub fn get_document(&self, path: &str) -> Result<Document> {
        let rel = paths::normalize(path)?;
        let abs = self.llm_dir().join(&rel);
        if !abs.is_file() {
            return Err(Error::Other(format!("document not found: {rel}")));
        }
        let mime = self.mime_for(&rel);
        Ok(Document::from_store(self.store.clone(), rel, mime))
    }

    pub fn remove_document(&self, path: &str) -> Result<()> {
        let rel = paths::normalize(path)?;
        std::fs::remove_file(self.llm_dir().join(&rel))?;
        self.mime_overrides.write().remove(&rel);
        Ok(())
    }

    /// All documents under `llm/`, sorted by path.
    pub fn documents(&self) -> Result<Vec<Document>> {
        self.list_documents(None)
    }

    /// Documents under `llm/uploads/`, sorted by path.
    pub fn upload_documents(&self) -> Result<Vec<Document>> {
        self.list_documents(Some(UPLOADS_DIR))
    }

    fn list_documents(&self, subdir: Option<&str>) -> Result<Vec<Document>> {
        let llm = self.llm_dir();
        let walk_root = match subdir {
            Some(sub) => llm.join(sub),
            None => llm.clone(),
        };
        if !walk_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut rel_paths = Vec::new();
        for entry in WalkDir::new(&walk_root).follow_links(false) {
            let entry = entry.map_err(|e| Error::Other(format!("walking workspace: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&llm)
                .map_err(|e| Error::Other(format!("path outside llm dir: {e}")))?;
            rel_paths.push(rel.to_string_lossy().replace('\\', "/"));
        }
        rel_paths.sort();

        Ok(rel_paths
            .into_iter()
            .map(|rel| {
                let mime = self.mime_for(&rel);
                Document::from_store(self.store.clone(), rel, mime)
            })
            .collect())
    }

    fn mime_for(&self, rel: &str) -> String {
        self.mime_overrides
            .read()
            .get(rel)
            .cloned()
            .unwrap_or_else(|| mime::detect(rel).to_string())
    }

    // ── Child-process environment ──────────────────────────────────

    /// Directory paths for injecting into child processes.
    /// `AGENT_MEMORY_DIR` is omitted when no memory dir is set.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(
            "AGENT_WORKSPACE_DIR".to_string(),
            self.root.to_string_lossy().into_owned(),
        );
        vars.insert(
            "AGENT_LLM_DIR".to_string(),
            self.llm_dir().to_string_lossy().into_owned(),
        );
        vars.insert(
            "AGENT_UPLOADS_DIR".to_string(),
            self.uploads_dir().to_string_lossy().into_owned(),
        );
        vars.insert(
            "AGENT_OUTPUT_DIR".to_string(),
            self.output_dir().to_string_lossy().into_owned(),
        );
        if let Some(dir) = self.memory_dir() {
            vars.insert(
                "AGENT_MEMORY_DIR".to_string(),
                self.llm_dir().join(dir).to_string_lossy().into_owned(),
            );
        }
        vars
    }
}
