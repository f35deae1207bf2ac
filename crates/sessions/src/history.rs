//! Ordered, thread-safe conversation history with per-turn persistence.
//!
//! Every sealed turn is written eagerly to
//! `_private/turns/<turnID>/turn.json` (pretty JSON). The write is
//! best-effort: a failure is logged and the turn lives on in memory.
//! `load` walks the turn directories in lexicographic order, skipping
//! corrupt records and turns that never got a reply.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::RwLock;

use tiller_domain::{Message, Result};
use tiller_workspace::{CompactionSummary, LocalStore, Workspace};

use crate::turn::Turn;

const TURN_FILE: &str = "turn.json";
const TRACE_FILE: &str = "trace.txt";

struct Inner {
    turns: Vec<Turn>,
    summaries: Vec<CompactionSummary>,
}

/// Completed turns plus daily compaction summaries.
pub struct ConversationHistory {
    turns_dir: Option<PathBuf>,
    store: Option<Arc<LocalStore>>,
    inner: RwLock<Inner>,
}

impl ConversationHistory {
    /// An in-memory history with no persistence (tests, throwaway runs).
    pub fn in_memory() -> Self {
        Self {
            turns_dir: None,
            store: None,
            inner: RwLock::new(Inner {
                turns: Vec::new(),
                summaries: Vec::new(),
            }),
        }
    }

    /// Open the history persisted in a workspace, rehydrating turns and
    /// summaries from disk.
    pub fn open(workspace: &Workspace) -> Result<Self> {
        let turns_dir = workspace.turns_dir();
        let store = workspace.store();
        let turns = load_turns(&turns_dir, &store);
        let summaries = workspace.load_summaries()?;
        Ok(Self {
            turns_dir: Some(turns_dir),
            store: Some(store),
            inner: RwLock::new(Inner { turns, summaries }),
        })
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Append a sealed turn and persist its record. Persistence failures
    /// are logged, never propagated.
    pub fn append(&self, turn: Turn) {
        if let Some(dir) = &self.turns_dir {
            let persisted = turn.persisted();
            if let Err(e) = write_turn(dir, &persisted) {
                tracing::warn!(
                    turn_id = %turn.turn_id,
                    error = %e,
                    "failed to persist turn record"
                );
            }
        }
        self.inner.write().turns.push(turn);
    }

    /// Remove compacted turns and install their summary in chronological
    /// order.
    pub fn apply_compaction(&self, turn_ids: &[String], summary: CompactionSummary) {
        let mut inner = self.inner.write();
        inner.turns.retain(|t| !turn_ids.contains(&t.turn_id));
        let pos = inner
            .summaries
            .iter()
            .position(|s| s.date > summary.date)
            .unwrap_or(inner.summaries.len());
        inner.summaries.insert(pos, summary);
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Flatten the history for the prompt: each non-hidden turn's request
    /// followed by its reply. A missing request is synthesized from the
    /// user message; turns with neither are skipped.
    pub fn messages(&self) -> Vec<Message> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for turn in inner.turns.iter().filter(|t| !t.hidden) {
            match (&turn.request, turn.user_message.is_empty()) {
                (Some(req), _) => out.push(req.clone()),
                (None, false) => out.push(Message::user(turn.user_message.clone())),
                (None, true) => continue,
            }
            if let Some(reply) = &turn.reply {
                out.push(Message::Assistant(reply.clone()));
            }
        }
        out
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.inner.read().turns.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().turns.is_empty()
    }

    pub fn last(&self, n: usize) -> Vec<Turn> {
        let inner = self.inner.read();
        let start = inner.turns.len().saturating_sub(n);
        inner.turns[start..].to_vec()
    }

    pub fn filter_by_agent(&self, agent_name: &str) -> Vec<Turn> {
        self.inner
            .read()
            .turns
            .iter()
            .filter(|t| t.agent_name == agent_name)
            .cloned()
            .collect()
    }

    pub fn exclude_hidden(&self) -> Vec<Turn> {
        self.inner
            .read()
            .turns
            .iter()
            .filter(|t| !t.hidden)
            .cloned()
            .collect()
    }

    pub fn find_by_trace_file(&self, path: &Path) -> Option<Turn> {
        self.inner
            .read()
            .turns
            .iter()
            .find(|t| t.trace_file.as_deref() == Some(path))
            .cloned()
    }

    pub fn summaries(&self) -> Vec<CompactionSummary> {
        self.inner.read().summaries.clone()
    }

    /// Distinct past days that still have turns, are older than
    /// `keep_recent_days`, and have no summary yet. Chronological.
    pub fn days_to_compact(&self, keep_recent_days: u32, today: NaiveDate) -> Vec<NaiveDate> {
        let inner = self.inner.read();
        let cutoff = today - chrono::Duration::days(i64::from(keep_recent_days));
        let mut days: Vec<NaiveDate> = inner
            .turns
            .iter()
            .map(|t| t.date())
            .filter(|d| *d < cutoff)
            .filter(|d| !inner.summaries.iter().any(|s| s.date == *d))
            .collect();
        days.sort();
        days.dedup();
        days
    }

    pub fn turns_for_day(&self, day: NaiveDate) -> Vec<Turn> {
        self.inner
            .read()
            .turns
            .iter()
            .filter(|t| t.date() == day)
            .cloned()
            .collect()
    }
}

// ── Persistence ────────────────────────────────────────────────────

fn write_turn(turns_dir: &Path, turn: &Turn) -> Result<()> {
    let dir = turns_dir.join(&turn.turn_id);
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(turn)?;
    std::fs::write(dir.join(TURN_FILE), json)?;
    Ok(())
}

fn load_turns(turns_dir: &Path, store: &Arc<LocalStore>) -> Vec<Turn> {
    let Ok(entries) = std::fs::read_dir(turns_dir) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.path())
        .collect();
    dirs.sort();

    let mut turns = Vec::new();
    for dir in dirs {
        let path = dir.join(TURN_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable turn record");
                continue;
            }
        };
        let mut turn: Turn = match serde_json::from_str(&raw) {
            Ok(turn) => turn,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping corrupt turn record");
                continue;
            }
        };
        // An in-flight turn (no reply) is never rehydrated.
        if !turn.is_sealed() {
            tracing::warn!(turn_id = %turn.turn_id, "skipping in-flight turn record");
            continue;
        }
        let trace = dir.join(TRACE_FILE);
        turn.trace_file = trace.is_file().then_some(trace);
        for attached in &mut turn.documents {
            attached.document.attach_store(store.clone());
        }
        turns.push(turn);
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_domain::AssistantMessage;
    use tiller_workspace::FileRefEntry;

    fn sealed(turn_id: &str, user: &str, reply: &str) -> Turn {
        let mut t = Turn::new(turn_id, user, "agent-1");
        t.reply = Some(AssistantMessage::text(reply));
        t
    }

    fn open_workspace() -> (tempfile::TempDir, Workspace) {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::create(base.path(), "agent-1").unwrap();
        (base, ws)
    }

    #[test]
    fn messages_emit_request_then_reply() {
        let history = ConversationHistory::in_memory();
        history.append(sealed("000001", "hello", "hi"));
        history.append(sealed("000002", "more", "sure"));

        let msgs = history.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].content(), Some("hello"));
        assert_eq!(msgs[1].content(), Some("hi"));
        assert_eq!(msgs[2].content(), Some("more"));
        assert_eq!(msgs[3].content(), Some("sure"));
    }

    #[test]
    fn messages_skip_hidden_turns() {
        let history = ConversationHistory::in_memory();
        history.append(sealed("000001", "visible", "yes"));
        let mut hidden = sealed("000002", "secret", "ok");
        hidden.hidden = true;
        history.append(hidden);

        let msgs = history.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content(), Some("visible"));
    }

    #[test]
    fn messages_synthesize_missing_request() {
        let history = ConversationHistory::in_memory();
        let mut t = sealed("000001", "typed text", "reply");
        t.request = None;
        history.append(t);

        let msgs = history.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content(), Some("typed text"));
    }

    #[test]
    fn round_trips_through_disk() {
        let (_base, ws) = open_workspace();
        let history = ConversationHistory::open(&ws).unwrap();
        history.append(sealed("000001", "hello", "hi"));
        history.append(sealed("000002", "again", "yo"));
        let before = history.messages();

        let reloaded = ConversationHistory::open(&ws).unwrap();
        assert_eq!(reloaded.len(), 2);
        let after = reloaded.messages();
        assert_eq!(
            before.iter().map(|m| m.content()).collect::<Vec<_>>(),
            after.iter().map(|m| m.content()).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn load_skips_corrupt_and_inflight_records() {
        let (_base, ws) = open_workspace();
        let history = ConversationHistory::open(&ws).unwrap();
        history.append(sealed("000001", "good", "fine"));

        // Corrupt record.
        let corrupt = ws.turns_dir().join("000002");
        std::fs::create_dir_all(&corrupt).unwrap();
        std::fs::write(corrupt.join(TURN_FILE), "{not json").unwrap();

        // In-flight record (no reply).
        let inflight = Turn::new("000003", "pending", "agent-1");
        let dir = ws.turns_dir().join("000003");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(TURN_FILE),
            serde_json::to_string_pretty(&inflight).unwrap(),
        )
        .unwrap();

        let reloaded = ConversationHistory::open(&ws).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.turns()[0].turn_id, "000001");
    }

    #[test]
    fn load_rehydrates_trace_path() {
        let (_base, ws) = open_workspace();
        let history = ConversationHistory::open(&ws).unwrap();
        history.append(sealed("000001", "traced", "ok"));
        let trace = ws.turns_dir().join("000001").join(TRACE_FILE);
        std::fs::write(&trace, "request/response log").unwrap();

        let reloaded = ConversationHistory::open(&ws).unwrap();
        let turn = reloaded.find_by_trace_file(&trace).unwrap();
        assert_eq!(turn.turn_id, "000001");
    }

    #[test]
    fn ephemeral_refs_do_not_survive_reload() {
        let (_base, ws) = open_workspace();
        let history = ConversationHistory::open(&ws).unwrap();
        let mut turn = sealed("000001", "refs", "ok");
        turn.add_file_refs([
            FileRefEntry::new("output/kept.txt"),
            FileRefEntry::new("output/gone.txt").ephemeral(),
        ]);
        history.append(turn);

        let reloaded = ConversationHistory::open(&ws).unwrap();
        let refs = &reloaded.turns()[0].file_refs;
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].path, "output/kept.txt");
    }

    #[test]
    fn last_and_filter_queries() {
        let history = ConversationHistory::in_memory();
        history.append(sealed("000001", "a", "1"));
        history.append(sealed("000002", "b", "2"));
        let mut other = sealed("000003", "c", "3");
        other.agent_name = "agent-2".into();
        history.append(other);

        assert_eq!(history.last(2).len(), 2);
        assert_eq!(history.last(10).len(), 3);
        assert_eq!(history.filter_by_agent("agent-2").len(), 1);
        assert_eq!(history.filter_by_agent("agent-1").len(), 2);
    }

    #[test]
    fn days_to_compact_excludes_recent_and_summarized() {
        let history = ConversationHistory::in_memory();
        let today: NaiveDate = "2026-07-21".parse().unwrap();

        let mut old = sealed("000001", "old", "x");
        old.timestamp = "2026-07-01T10:00:00Z".parse().unwrap();
        history.append(old);
        let mut summarized = sealed("000002", "done", "y");
        summarized.timestamp = "2026-06-20T10:00:00Z".parse().unwrap();
        history.append(summarized);
        let mut recent = sealed("000003", "new", "z");
        recent.timestamp = "2026-07-20T10:00:00Z".parse().unwrap();
        history.append(recent);

        history.apply_compaction(
            &[],
            CompactionSummary {
                date: "2026-06-20".parse().unwrap(),
                summary: "already summarized".into(),
                turn_count: 1,
            },
        );

        let days = history.days_to_compact(7, today);
        assert_eq!(days, vec!["2026-07-01".parse::<NaiveDate>().unwrap()]);
    }

    #[test]
    fn apply_compaction_removes_turns_and_orders_summaries() {
        let history = ConversationHistory::in_memory();
        history.append(sealed("000001", "a", "1"));
        history.append(sealed("000002", "b", "2"));

        history.apply_compaction(
            &["000001".into()],
            CompactionSummary {
                date: "2026-07-02".parse().unwrap(),
                summary: "later day".into(),
                turn_count: 1,
            },
        );
        history.apply_compaction(
            &[],
            CompactionSummary {
                date: "2026-07-01".parse().unwrap(),
                summary: "earlier day".into(),
                turn_count: 1,
            },
        );

        assert_eq!(history.len(), 1);
        let summaries = history.summaries();
        assert_eq!(summaries[0].date, "2026-07-01".parse::<NaiveDate>().unwrap());
        assert_eq!(summaries[1].date, "2026-07-02".parse::<NaiveDate>().unwrap());
    }
}
