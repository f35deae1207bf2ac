//! Documents and their backing stores.
//!
//! A `Document` is a value-semantics handle: identity, relative path, MIME
//! type, and content that is either inlined or read lazily from a
//! `LocalStore` rooted at the workspace's model-visible directory. Stores
//! are registered once per absolute root and shared process-wide; the
//! registry is a pure cache, and the workspace threads its own handle
//! through explicitly.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use tiller_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LocalStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reads documents below a fixed absolute root directory.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the full content of a store-relative path.
    pub fn read(&self, rel_path: &str) -> Result<Vec<u8>> {
        let rel = crate::paths::normalize(rel_path)?;
        std::fs::read(self.root.join(rel)).map_err(Error::Io)
    }

    /// File size in bytes, when the file exists.
    pub fn size(&self, rel_path: &str) -> Option<u64> {
        let rel = crate::paths::normalize(rel_path).ok()?;
        std::fs::metadata(self.root.join(rel)).ok().map(|m| m.len())
    }
}

static STORES: Lazy<RwLock<HashMap<PathBuf, Arc<LocalStore>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Store handle for an absolute root. Registration is idempotent: the first
/// caller creates the store, later callers share it.
pub fn store_for_root(root: &Path) -> Arc<LocalStore> {
    if let Some(store) = STORES.read().get(root) {
        return store.clone();
    }
    let mut stores = STORES.write();
    stores
        .entry(root.to_path_buf())
        .or_insert_with(|| Arc::new(LocalStore::new(root)))
        .clone()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
enum DocumentSource {
    /// Content held in memory.
    Inline(Arc<Vec<u8>>),
    /// Content read lazily from a registered store.
    Store(Arc<LocalStore>),
    /// Loaded from a persisted record; no backing store attached yet.
    Detached,
}

/// A document the model may see. Immutable after construction except for
/// its ID.
#[derive(Clone)]
pub struct Document {
    id: String,
    filename: String,
    file_path: String,
    mime_type: String,
    size: u64,
    source: DocumentSource,
}

impl Document {
    /// An in-memory document. The ID defaults to the filename.
    pub fn from_bytes(
        filename: impl Into<String>,
        bytes: Vec<u8>,
        mime_type: impl Into<String>,
    ) -> Self {
        let filename = filename.into();
        let mime = non_empty_or(mime_type.into(), || {
            crate::mime::detect(&filename).to_string()
        });
        Self {
            id: filename.clone(),
            file_path: filename.clone(),
            filename,
            mime_type: mime,
            size: bytes.len() as u64,
            source: DocumentSource::Inline(Arc::new(bytes)),
        }
    }

    /// A store-backed document. The ID is the store-relative path, which is
    /// stable across reloads.
    pub fn from_store(
        store: Arc<LocalStore>,
        rel_path: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let rel_path = rel_path.into();
        let filename = rel_path
            .rsplit('/')
            .next()
            .unwrap_or(rel_path.as_str())
            .to_string();
        let mime = non_empty_or(mime_type.into(), || {
            crate::mime::detect(&rel_path).to_string()
        });
        let size = store.size(&rel_path).unwrap_or(0);
        Self {
            id: rel_path.clone(),
            file_path: rel_path,
            filename,
            mime_type: mime,
            size,
            source: DocumentSource::Store(store),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The only mutation a document permits.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Full content. Store-backed documents read from disk on each call.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match &self.source {
            DocumentSource::Inline(bytes) => Ok(bytes.as_ref().clone()),
            DocumentSource::Store(store) => store.read(&self.file_path),
            DocumentSource::Detached => Err(Error::Other(format!(
                "document {} has no backing store",
                self.id
            ))),
        }
    }

    /// Content as UTF-8 text (lossy).
    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.bytes()?).into_owned())
    }

    /// Attach a backing store to a document loaded from a persisted record.
    /// Refreshes the size from disk when the file is present.
    pub fn attach_store(&mut self, store: Arc<LocalStore>) {
        if let Some(size) = store.size(&self.file_path) {
            self.size = size;
        }
        self.source = DocumentSource::Store(store);
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("file_path", &self.file_path)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish()
    }
}

// ── Wire form ──────────────────────────────────────────────────────
// Documents persist as {id, filename, file_path, mime_type}; content is
// never embedded in turn records — it is re-read through the store on load.

#[derive(Serialize, Deserialize)]
struct DocumentRecord {
    id: String,
    filename: String,
    file_path: String,
    mime_type: String,
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        DocumentRecord {
            id: self.id.clone(),
            filename: self.filename.clone(),
            file_path: self.file_path.clone(),
            mime_type: self.mime_type.clone(),
        }
        .serialize(ser)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let rec = DocumentRecord::deserialize(de)?;
        if rec.file_path.is_empty() {
            return Err(D::Error::custom("document record missing file_path"));
        }
        Ok(Document {
            id: rec.id,
            filename: rec.filename,
            file_path: rec.file_path,
            mime_type: rec.mime_type,
            size: 0,
            source: DocumentSource::Detached,
        })
    }
}

fn non_empty_or(value: String, fallback: impl FnOnce() -> String) -> String {
    if value.is_empty() {
        fallback()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_document_bytes_and_text() {
        let doc = Document::from_bytes("notes.txt", b"hello".to_vec(), "");
        assert_eq!(doc.id(), "notes.txt");
        assert_eq!(doc.mime_type(), "text/plain");
        assert_eq!(doc.size(), 5);
        assert_eq!(doc.bytes().unwrap(), b"hello");
        assert_eq!(doc.text().unwrap(), "hello");
    }

    #[test]
    fn store_backed_document_reads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/a.txt"), b"lazy").unwrap();

        let store = Arc::new(LocalStore::new(dir.path()));
        let doc = Document::from_store(store, "uploads/a.txt", "");
        assert_eq!(doc.id(), "uploads/a.txt");
        assert_eq!(doc.filename(), "a.txt");
        assert_eq!(doc.size(), 4);
        assert_eq!(doc.text().unwrap(), "lazy");
    }

    #[test]
    fn registry_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = store_for_root(dir.path());
        let b = store_for_root(dir.path());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn serialized_form_carries_no_content() {
        let doc = Document::from_bytes("a.txt", b"secret".to_vec(), "");
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains(r#""file_path":"a.txt""#));
    }

    #[test]
    fn detached_document_reattaches_to_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"body").unwrap();

        let doc = Document::from_bytes("a.txt", b"body".to_vec(), "");
        let json = serde_json::to_string(&doc).unwrap();
        let mut back: Document = serde_json::from_str(&json).unwrap();
        assert!(back.bytes().is_err());

        back.attach_store(Arc::new(LocalStore::new(dir.path())));
        assert_eq!(back.bytes().unwrap(), b"body");
        assert_eq!(back.size(), 4);
    }

    #[test]
    fn set_id_is_the_only_mutation() {
        let mut doc = Document::from_bytes("a.txt", vec![], "");
        doc.set_id("custom-id");
        assert_eq!(doc.id(), "custom-id");
        assert_eq!(doc.file_path(), "a.txt");
    }
}
