//! History compaction — replace old conversation days with summaries.
//!
//! Each eligible day is summarized by the model (no tools), then archived:
//! the summary lands in `summaries.json`, an index entry per turn lands in
//! the month index, the turn directories move atomically into the archive,
//! and the turns leave in-memory history. A model or filesystem failure
//! aborts the current day cleanly — the atomic archive never leaves a day
//! half-moved.

use chrono::{DateTime, Local, Timelike};

use tiller_domain::{Message, Result};
use tiller_sessions::Turn;
use tiller_workspace::{ArchiveIndexEntry, CompactionSummary};

use crate::model::{Model, ModelRequest};
use crate::run::RunSession;

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Days younger than this never compact.
    pub keep_recent_days: u32,
    /// Compaction only runs at or after this local hour.
    pub compaction_hour: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            keep_recent_days: 7,
            compaction_hour: 3,
        }
    }
}

/// Compact every eligible past day. Returns the total turns archived.
pub async fn compact_history(
    session: &RunSession,
    model: &dyn Model,
    config: &CompactionConfig,
) -> Result<usize> {
    compact_history_at(session, model, config, Local::now()).await
}

/// Test seam: compaction with an explicit clock.
pub async fn compact_history_at(
    session: &RunSession,
    model: &dyn Model,
    config: &CompactionConfig,
    now: DateTime<Local>,
) -> Result<usize> {
    if now.hour() < config.compaction_hour {
        return Ok(0);
    }

    let days = session
        .history
        .days_to_compact(config.keep_recent_days, now.date_naive());

    let mut archived = 0;
    for day in days {
        let turns = session.history.turns_for_day(day);
        if turns.is_empty() {
            continue;
        }

        let prompt = summary_prompt(&turns, &day.format("%Y-%m-%d").to_string());
        let response = model
            .call(ModelRequest::new(vec![Message::user(prompt)], Vec::new()))
            .await?;
        let summary = response.content;

        let turn_ids: Vec<String> = turns.iter().map(|t| t.turn_id.clone()).collect();

        // Summary first, then the index, then the atomic move, then the
        // in-memory removal — a failure at any point leaves prior days
        // intact and this day un-archived.
        let mut summaries = session.workspace.load_summaries()?;
        let compaction = CompactionSummary {
            date: day,
            summary: summary.clone(),
            turn_count: turns.len(),
        };
        summaries.push(compaction.clone());
        summaries.sort_by_key(|s| s.date);
        session.workspace.save_summaries(&summaries)?;

        let month = day.format("%Y-%m").to_string();
        let mut index = session.workspace.load_archive_index(&month)?;
        for turn in &turns {
            index.push(ArchiveIndexEntry {
                turn_id: turn.turn_id.clone(),
                date: day,
                user_message: turn.user_message.clone(),
                summary: turn
                    .reply
                    .as_ref()
                    .map(|r| truncate(&r.content, 200))
                    .unwrap_or_default(),
            });
        }
        session.workspace.save_archive_index(&month, &index)?;

        session.workspace.archive_turns(&turn_ids, day)?;
        session.history.apply_compaction(&turn_ids, compaction);

        tracing::info!(
            day = %day,
            turns = turn_ids.len(),
            summary_len = summary.len(),
            "compacted conversation day"
        );
        archived += turn_ids.len();
    }

    Ok(archived)
}

/// The summarization prompt sent to the model for one day of turns.
pub fn summary_prompt(turns: &[Turn], date: &str) -> String {
    let mut conversation = String::new();
    for turn in turns {
        conversation.push_str("User: ");
        conversation.push_str(&clip(&turn.user_message));
        conversation.push('\n');
        for message in &turn.messages {
            match message {
                Message::Tool(m) => {
                    conversation.push_str("Tool: ");
                    conversation.push_str(&clip(&m.content));
                    conversation.push('\n');
                }
                Message::Assistant(m) if !m.content.is_empty() => {
                    conversation.push_str("Assistant: ");
                    conversation.push_str(&clip(&m.content));
                    conversation.push('\n');
                }
                _ => {}
            }
        }
        if let Some(reply) = &turn.reply {
            conversation.push_str("Assistant: ");
            conversation.push_str(&clip(&reply.content));
            conversation.push('\n');
        }
    }

    format!(
        "You are a conversation summarizer. Summarize the conversation from \
         {date} into a concise summary that preserves:\n\
         1. The goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\n\
         Be concise but preserve all actionable context. Write in present \
         tense. Omit greetings and pleasantries.\n\n\
         CONVERSATION:\n{conversation}"
    )
}

/// Keep long tool outputs from swamping the summary prompt.
fn clip(text: &str) -> String {
    if text.len() <= 2000 {
        return text.to_string();
    }
    let head = truncate(text, 1000);
    let tail_start = floor_char_boundary(text, text.len() - 500);
    format!("{head} [...] {}", &text[tail_start..])
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let end = floor_char_boundary(text, max);
    format!("{}...", &text[..end])
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_domain::AssistantMessage;

    #[test]
    fn prompt_includes_turn_content_and_date() {
        let mut turn = Turn::new("000001", "fix the bug", "agent-1");
        turn.add_message(Message::tool_response("tc_1", "grep", "found it"));
        turn.reply = Some(AssistantMessage::text("fixed"));

        let prompt = summary_prompt(&[turn], "2026-07-01");
        assert!(prompt.contains("2026-07-01"));
        assert!(prompt.contains("User: fix the bug"));
        assert!(prompt.contains("Tool: found it"));
        assert!(prompt.contains("Assistant: fixed"));
    }

    #[test]
    fn clip_shortens_long_content() {
        let long = "x".repeat(5000);
        let clipped = clip(&long);
        assert!(clipped.len() < 2000);
        assert!(clipped.contains(" [...] "));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let out = truncate(s, 2);
        assert!(out.starts_with('h'));
        assert!(out.ends_with("..."));
    }
}
