//! Turn archiving and compaction summaries.
//!
//! Archiving moves turn directories in two phases of same-filesystem
//! renames: sources are staged into `_private/.archive-tmp-<day>/`, then
//! moved into the final `archive/YYYY-MM/YYYY-MM-DD/` directory, and the
//! staging directory is removed. A crash between the phases leaves a
//! staging directory that `Workspace::open` purges on the next start.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use tiller_domain::Result;

use crate::jsonio::{read_json_or_default, write_json_atomic};
use crate::workspace::{Workspace, ARCHIVE_STAGING_PREFIX};

/// One compacted day of conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionSummary {
    pub date: NaiveDate,
    pub summary: String,
    pub turn_count: usize,
}

/// One archived turn, recorded in the month index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveIndexEntry {
    pub turn_id: String,
    pub date: NaiveDate,
    pub user_message: String,
    pub summary: String,
}

impl Workspace {
    /// Atomically move the given turn directories into
    /// `_private/archive/YYYY-MM/YYYY-MM-DD/`. Missing sources are
    /// tolerated, so re-archiving an already-archived day is a no-op.
    /// Returns the number of directories moved.
    pub fn archive_turns(&self, turn_ids: &[String], date: NaiveDate) -> Result<usize> {
        let day = date.format("%Y-%m-%d").to_string();
        let month = date.format("%Y-%m").to_string();
        let staging = self
            .private_dir()
            .join(format!("{ARCHIVE_STAGING_PREFIX}{day}"));
        let final_dir = self.archive_dir().join(&month).join(&day);

        // Phase 1: stage every source that still exists.
        std::fs::create_dir_all(&staging)?;
        let mut staged = Vec::new();
        for id in turn_ids {
            let src = self.turns_dir().join(id);
            if !src.exists() {
                continue;
            }
            let dst = staging.join(id);
            std::fs::rename(&src, &dst)?;
            staged.push(id.clone());
        }

        // Phase 2: move staged entries into the month/day directory.
        std::fs::create_dir_all(&final_dir)?;
        for id in &staged {
            std::fs::rename(staging.join(id), final_dir.join(id))?;
        }
        std::fs::remove_dir_all(&staging)?;

        tracing::info!(
            day = %day,
            moved = staged.len(),
            "archived turn directories"
        );
        Ok(staged.len())
    }

    /// Remove archive staging directories left behind by a crash.
    pub(crate) fn purge_stale_staging(&self) {
        let Ok(entries) = std::fs::read_dir(self.private_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(ARCHIVE_STAGING_PREFIX) {
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!(dir = %name, error = %e, "failed to purge archive staging");
                } else {
                    tracing::warn!(dir = %name, "purged stale archive staging directory");
                }
            }
        }
    }

    // ── Summaries ──────────────────────────────────────────────────

    pub fn save_summaries(&self, summaries: &[CompactionSummary]) -> Result<()> {
        write_json_atomic(&self.private_dir().join("summaries.json"), summaries)
    }

    pub fn load_summaries(&self) -> Result<Vec<CompactionSummary>> {
        read_json_or_default(&self.private_dir().join("summaries.json"))
    }

    // ── Archive index ──────────────────────────────────────────────

    /// `month` is `YYYY-MM`; one index file per calendar month.
    pub fn save_archive_index(&self, month: &str, entries: &[ArchiveIndexEntry]) -> Result<()> {
        let dir = self.archive_dir().join(month);
        std::fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join("index.json"), entries)
    }

    pub fn load_archive_index(&self, month: &str) -> Result<Vec<ArchiveIndexEntry>> {
        read_json_or_default(&self.archive_dir().join(month).join("index.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn workspace_with_turns(ids: &[&str]) -> (tempfile::TempDir, Workspace) {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::create(base.path(), "agent-1").unwrap();
        for id in ids {
            let dir = ws.turns_dir().join(id);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("turn.json"), format!("{{\"id\":\"{id}\"}}")).unwrap();
        }
        (base, ws)
    }

    #[test]
    fn archive_moves_turn_directories() {
        let (_base, ws) = workspace_with_turns(&["000001", "000002"]);
        let moved = ws
            .archive_turns(&["000001".into(), "000002".into()], date("2026-07-11"))
            .unwrap();
        assert_eq!(moved, 2);

        let day_dir = ws.archive_dir().join("2026-07").join("2026-07-11");
        assert!(day_dir.join("000001/turn.json").is_file());
        assert!(day_dir.join("000002/turn.json").is_file());
        assert!(!ws.turns_dir().join("000001").exists());
        // No staging left behind.
        let staged: Vec<_> = std::fs::read_dir(ws.private_dir())
            .unwrap()
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(ARCHIVE_STAGING_PREFIX)
            })
            .collect();
        assert!(staged.is_empty());
    }

    #[test]
    fn archive_is_idempotent() {
        let (_base, ws) = workspace_with_turns(&["000001"]);
        let ids = vec!["000001".to_string()];
        assert_eq!(ws.archive_turns(&ids, date("2026-07-11")).unwrap(), 1);
        // Second invocation finds no sources and moves nothing.
        assert_eq!(ws.archive_turns(&ids, date("2026-07-11")).unwrap(), 0);
        assert!(ws
            .archive_dir()
            .join("2026-07/2026-07-11/000001/turn.json")
            .is_file());
    }

    #[test]
    fn open_purges_stale_staging() {
        let (_base, ws) = workspace_with_turns(&[]);
        let stale = ws
            .private_dir()
            .join(format!("{ARCHIVE_STAGING_PREFIX}2026-01-01"));
        std::fs::create_dir_all(stale.join("000009")).unwrap();
        let root = ws.root().to_path_buf();
        drop(ws);

        let reopened = Workspace::open(&root).unwrap();
        assert!(!stale.exists());
        drop(reopened);
    }

    #[test]
    fn summaries_round_trip() {
        let (_base, ws) = workspace_with_turns(&[]);
        assert!(ws.load_summaries().unwrap().is_empty());

        let summaries = vec![CompactionSummary {
            date: date("2026-07-01"),
            summary: "worked on the parser".into(),
            turn_count: 4,
        }];
        ws.save_summaries(&summaries).unwrap();
        assert_eq!(ws.load_summaries().unwrap(), summaries);
    }

    #[test]
    fn archive_index_round_trip_per_month() {
        let (_base, ws) = workspace_with_turns(&[]);
        let entries = vec![ArchiveIndexEntry {
            turn_id: "000001".into(),
            date: date("2026-07-11"),
            user_message: "hello".into(),
            summary: "greeting".into(),
        }];
        ws.save_archive_index("2026-07", &entries).unwrap();
        assert_eq!(ws.load_archive_index("2026-07").unwrap(), entries);
        assert!(ws.load_archive_index("2026-08").unwrap().is_empty());
    }
}
