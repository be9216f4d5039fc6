//! Durable-event journal backing at-least-once delivery.
//!
//! Durable events are appended as JSON lines before delivery and acked once
//! a consumer finishes handling them. After a crash, `replay` returns the
//! unacked tail so the runtime can re-publish it; the session store's
//! event-id dedup makes redelivery idempotent.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

use super::event::Event;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Publish { event: Event },
    Ack { id: String },
}

/// Append-only JSONL journal for durable events.
pub struct EventJournal {
    path: PathBuf,
    // Serializes appends so records never interleave mid-line.
    write_lock: Mutex<()>,
}

impl EventJournal {
    /// Create a journal at `path`. The file is created on first append.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Journal file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append a published event.
    pub async fn append(&self, event: &Event) -> Result<()> {
        self.write_record(&JournalRecord::Publish {
            event: event.clone(),
        })
        .await
    }

    /// Record that an event was fully processed.
    pub async fn ack(&self, event_id: &str) -> Result<()> {
        self.write_record(&JournalRecord::Ack {
            id: event_id.to_string(),
        })
        .await
    }

    /// Return unacked events in append order, then compact the file down
    /// to just those events so the journal does not grow without bound.
    pub async fn replay(&self) -> Result<Vec<Event>> {
        let _guard = self.write_lock.lock().await;

        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut events: Vec<Event> = Vec::new();
        let mut acked: HashSet<String> = HashSet::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(JournalRecord::Publish { event }) => events.push(event),
                Ok(JournalRecord::Ack { id }) => {
                    acked.insert(id);
                }
                Err(e) => {
                    // A torn final line after a crash is expected; anything
                    // else is worth surfacing in the logs.
                    warn!(error = %e, "Skipping unreadable journal line");
                }
            }
        }

        events.retain(|e| !acked.contains(&e.id));

        // Compact: rewrite the journal with only the surviving events.
        let mut compacted = String::new();
        for event in &events {
            let record = JournalRecord::Publish {
                event: event.clone(),
            };
            compacted.push_str(&serde_json::to_string(&record)?);
            compacted.push('\n');
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, compacted).await?;

        Ok(events)
    }

    async fn write_record(&self, record: &JournalRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::{Event, TimerSource};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_replay_empty_when_no_file() {
        let dir = tempdir().unwrap();
        let journal = EventJournal::new(dir.path().join("missing.jsonl"));
        assert!(journal.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_then_replay() {
        let dir = tempdir().unwrap();
        let journal = EventJournal::new(dir.path().join("journal.jsonl"));

        let event = Event::inbound("s1", "hello");
        journal.append(&event).await.unwrap();

        let replayed = journal.replay().await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, event.id);
    }

    #[tokio::test]
    async fn test_acked_events_are_not_replayed() {
        let dir = tempdir().unwrap();
        let journal = EventJournal::new(dir.path().join("journal.jsonl"));

        let first = Event::inbound("s1", "one");
        let second = Event::inbound("s1", "two");
        journal.append(&first).await.unwrap();
        journal.append(&second).await.unwrap();
        journal.ack(&first.id).await.unwrap();

        let replayed = journal.replay().await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, second.id);
    }

    #[tokio::test]
    async fn test_replay_compacts_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = EventJournal::new(path.clone());

        let first = Event::inbound("s1", "one");
        let second = Event::inbound("s1", "two");
        journal.append(&first).await.unwrap();
        journal.append(&second).await.unwrap();
        journal.ack(&first.id).await.unwrap();
        journal.replay().await.unwrap();

        // After compaction only the unacked publish record remains.
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(&second.id));
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = EventJournal::new(path.clone());

        let event = Event::inbound("s1", "survivor");
        journal.append(&event).await.unwrap();

        // Simulate a crash mid-write.
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("{\"op\":\"publish\",\"event\":{\"id\":\"tr");
        tokio::fs::write(&path, content).await.unwrap();

        let replayed = journal.replay().await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, event.id);
    }

    #[tokio::test]
    async fn test_replay_preserves_append_order() {
        let dir = tempdir().unwrap();
        let journal = EventJournal::new(dir.path().join("journal.jsonl"));

        let mut ids = Vec::new();
        for i in 0..5 {
            let event = Event::inbound("s1", &format!("msg {}", i));
            ids.push(event.id.clone());
            journal.append(&event).await.unwrap();
        }

        let replayed = journal.replay().await.unwrap();
        let replayed_ids: Vec<String> = replayed.into_iter().map(|e| e.id).collect();
        assert_eq!(replayed_ids, ids);
    }

    #[tokio::test]
    async fn test_timer_event_roundtrips_if_written() {
        // The bus filters volatile kinds; the journal itself is agnostic.
        let dir = tempdir().unwrap();
        let journal = EventJournal::new(dir.path().join("journal.jsonl"));
        let event = Event::timer(Some("s1"), TimerSource::StaleCheck);
        journal.append(&event).await.unwrap();
        let replayed = journal.replay().await.unwrap();
        assert_eq!(replayed[0], event);
    }
}
