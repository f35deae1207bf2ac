//! Day-granular compaction against the scripted model.

mod common;

use chrono::{Duration as ChronoDuration, Local, Utc};

use tiller_domain::AssistantMessage;
use tiller_engine::testing::{reply, MockModel};
use tiller_engine::{compaction, CompactionConfig};
use tiller_sessions::Turn;

use common::session;

fn aged_turn(id: &str, days_ago: i64) -> Turn {
    let mut turn = Turn::new(id, format!("message {id}"), "agent-1");
    turn.timestamp = Utc::now() - ChronoDuration::days(days_ago);
    turn.reply = Some(AssistantMessage::text(format!("reply {id}")));
    turn
}

#[tokio::test]
async fn old_day_is_archived_and_summarized() {
    let (_base, session) = session();
    for i in 1..=10 {
        session.history.append(aged_turn(&format!("{i:06}"), 20));
    }
    let day = (Utc::now() - ChronoDuration::days(20)).date_naive();

    let model = MockModel::new(vec![reply("summary of that day")]);
    let config = CompactionConfig {
        keep_recent_days: 7,
        compaction_hour: 0,
    };
    let archived = compaction::compact_history(&session, model.as_ref(), &config)
        .await
        .unwrap();

    assert_eq!(archived, 10);
    assert_eq!(session.history.len(), 0);

    // Turn directories moved into the archive.
    let day_dir = session
        .workspace
        .archive_dir()
        .join(day.format("%Y-%m").to_string())
        .join(day.format("%Y-%m-%d").to_string());
    for i in 1..=10 {
        assert!(day_dir.join(format!("{i:06}/turn.json")).is_file());
        assert!(!session
            .workspace
            .turns_dir()
            .join(format!("{i:06}"))
            .exists());
    }

    // One summary in summaries.json and in memory.
    let summaries = session.workspace.load_summaries().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].date, day);
    assert_eq!(summaries[0].turn_count, 10);
    assert_eq!(summaries[0].summary, "summary of that day");

    // The month index lists every archived turn.
    let index = session
        .workspace
        .load_archive_index(&day.format("%Y-%m").to_string())
        .unwrap();
    assert_eq!(index.len(), 10);
    assert_eq!(index[0].user_message, "message 000001");

    // The next prompt carries the summary before any turns.
    let ctx = tiller_context::AgentContext::new(
        "ctx",
        "agent-1",
        session.workspace.clone(),
        session.history.clone(),
    )
    .unwrap();
    ctx.start_turn("hello again").unwrap();
    let messages = ctx.build_prompt(&[], true).unwrap();
    let summary_messages: Vec<_> = messages
        .iter()
        .filter_map(|m| m.content())
        .filter(|c| c.starts_with("[Summary for "))
        .collect();
    assert_eq!(summary_messages.len(), 1);
    assert!(summary_messages[0]
        .starts_with(&format!("[Summary for {}]", day.format("%Y-%m-%d"))));
}

#[tokio::test]
async fn recent_days_are_left_alone() {
    let (_base, session) = session();
    session.history.append(aged_turn("000001", 2));

    let model = MockModel::new(vec![]);
    let config = CompactionConfig {
        keep_recent_days: 7,
        compaction_hour: 0,
    };
    let archived = compaction::compact_history(&session, model.as_ref(), &config)
        .await
        .unwrap();

    assert_eq!(archived, 0);
    assert_eq!(session.history.len(), 1);
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn compaction_waits_for_the_configured_hour() {
    let (_base, session) = session();
    session.history.append(aged_turn("000001", 20));

    let model = MockModel::new(vec![reply("unused")]);
    // An hour later than any possible current hour: always too early.
    let config = CompactionConfig {
        keep_recent_days: 7,
        compaction_hour: 24,
    };
    let archived =
        compaction::compact_history_at(&session, model.as_ref(), &config, Local::now())
            .await
            .unwrap();

    assert_eq!(archived, 0);
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn rerunning_compaction_is_idempotent() {
    let (_base, session) = session();
    for i in 1..=3 {
        session.history.append(aged_turn(&format!("{i:06}"), 15));
    }
    let config = CompactionConfig {
        keep_recent_days: 7,
        compaction_hour: 0,
    };

    let model = MockModel::new(vec![reply("first pass")]);
    let first = compaction::compact_history(&session, model.as_ref(), &config)
        .await
        .unwrap();
    assert_eq!(first, 3);

    // The day now has a summary and no turns; a second pass is a no-op.
    let model = MockModel::new(vec![reply("should not be used")]);
    let second = compaction::compact_history(&session, model.as_ref(), &config)
        .await
        .unwrap();
    assert_eq!(second, 0);
    assert_eq!(model.call_count(), 0);
    assert_eq!(session.workspace.load_summaries().unwrap().len(), 1);
}
