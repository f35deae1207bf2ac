//! Compartmentalized model memory.
//!
//! Three compartments — `run`, `session`, `plan` — exposed to the model
//! through the save/get/clear memory tools. Only `run` memory is injected
//! into the prompt automatically; the others require an explicit read.
//! Persistence is one JSON file keyed by compartment, written atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tiller_domain::{Error, Result};
use tiller_workspace::jsonio::{read_json_or_default, write_json_atomic};

/// Per-compartment size cap, in characters of stored content.
pub const DEFAULT_COMPARTMENT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    Run,
    Session,
    Plan,
}

impl MemoryScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(Self::Run),
            "session" => Some(Self::Session),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Session => "session",
            Self::Plan => "plan",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub description: String,
    pub content: String,
    pub scope: MemoryScope,
    #[serde(default)]
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
}

type Compartments = BTreeMap<MemoryScope, Vec<MemoryEntry>>;

/// Thread-safe compartment store with full-file atomic persistence.
pub struct MemoryStore {
    path: Option<PathBuf>,
    limit: usize,
    inner: Mutex<Compartments>,
}

impl MemoryStore {
    /// An in-memory store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            limit: DEFAULT_COMPARTMENT_LIMIT,
            inner: Mutex::new(Compartments::new()),
        }
    }

    /// Open (or create) the store backed by the given JSON file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let compartments: Compartments = read_json_or_default(&path)?;
        Ok(Self {
            path: Some(path),
            limit: DEFAULT_COMPARTMENT_LIMIT,
            inner: Mutex::new(compartments),
        })
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Save an entry. Fails when the compartment would exceed its size cap,
    /// telling the model to clear before saving again.
    pub fn save(
        &self,
        scope: MemoryScope,
        description: impl Into<String>,
        content: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<MemoryEntry> {
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            content: content.into(),
            scope,
            run_id: run_id.into(),
            timestamp: Utc::now(),
        };

        let mut inner = self.inner.lock();
        let compartment = inner.entry(scope).or_default();
        let used: usize = compartment.iter().map(|e| e.content.len()).sum();
        if used + entry.content.len() > self.limit {
            return Err(Error::InvalidInput(format!(
                "{} memory is full ({used}/{} chars used); clear it before saving",
                scope.as_str(),
                self.limit
            )));
        }
        compartment.push(entry.clone());
        self.persist(&inner)?;
        Ok(entry)
    }

    pub fn get(&self, scope: MemoryScope) -> Vec<MemoryEntry> {
        self.inner.lock().get(&scope).cloned().unwrap_or_default()
    }

    /// Remove every entry in a compartment. Returns the removed count.
    pub fn clear(&self, scope: MemoryScope) -> Result<usize> {
        let mut inner = self.inner.lock();
        let removed = inner.remove(&scope).map(|v| v.len()).unwrap_or(0);
        self.persist(&inner)?;
        Ok(removed)
    }

    fn persist(&self, compartments: &Compartments) -> Result<()> {
        if let Some(path) = &self.path {
            write_json_atomic(path, compartments)?;
        }
        Ok(())
    }
}
