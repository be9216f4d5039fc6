//! Event Bus Module
//!
//! The `EventBus` is the central nervous system of the runtime: a typed
//! publish/subscribe channel that decouples producers (channel adapters,
//! provider completions, tool completions, timers) from the dispatcher.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Channel   │────>│   EventBus  │────>│  Dispatcher │
//! │   adapter   │     │  (Inbound)  │     │             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   ▲ │
//!        │ Outbound          │ ▼ ProviderResult / ToolResult
//! ┌──────┴──────┐     ┌─────────────┐
//! │   EventBus  │<────│  Scheduler  │ Timer
//! └─────────────┘     └─────────────┘
//! ```
//!
//! Each subscriber registers a kind set and receives matching events over
//! its own bounded queue, FIFO by sequence number. A queue that stays full
//! past the bounded enqueue wait fails the publish with a `Backpressure`
//! error rather than silently dropping the event.
//!
//! # Example
//!
//! ```
//! use yoctoclaw::bus::{Event, EventBus, EventKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new();
//!     let (_id, mut rx) = bus.subscribe(&[EventKind::Inbound]).await;
//!
//!     bus.publish(Event::inbound("cli:stdin", "hello")).await.unwrap();
//!
//!     let received = rx.recv().await.unwrap();
//!     assert_eq!(received.kind(), EventKind::Inbound);
//! }
//! ```

pub mod event;
mod journal;

pub use event::{
    DeliveryStatus, Event, EventKind, EventPayload, MediaAttachment, MediaType, TimerSource,
};
pub use journal::EventJournal;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::{Result, YoctoError};

/// Default buffer size for subscriber queues
const DEFAULT_BUFFER_SIZE: usize = 128;
/// Default bounded enqueue wait before `publish` reports backpressure
const DEFAULT_ENQUEUE_WAIT: Duration = Duration::from_millis(250);

/// Handle returned from [`EventBus::subscribe`], used to unsubscribe.
pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    kinds: HashSet<EventKind>,
    tx: mpsc::Sender<Event>,
}

/// Typed publish/subscribe event bus.
///
/// Cloning shares the underlying subscriber table, sequence counter, and
/// journal, so producers can each hold their own handle.
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_subscriber_id: Arc<AtomicU64>,
    seq: Arc<AtomicU64>,
    buffer_size: usize,
    enqueue_wait: Duration,
    journal: Option<Arc<EventJournal>>,
}

impl EventBus {
    /// Create a bus with default buffer size and enqueue wait, no journal.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a bus with a custom subscriber queue size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
            seq: Arc::new(AtomicU64::new(0)),
            buffer_size,
            enqueue_wait: DEFAULT_ENQUEUE_WAIT,
            journal: None,
        }
    }

    /// Set the bounded wait `publish` spends on a full subscriber queue
    /// before giving up with `Backpressure`.
    pub fn with_enqueue_wait(mut self, wait: Duration) -> Self {
        self.enqueue_wait = wait;
        self
    }

    /// Attach a durable-event journal. Durable events are appended before
    /// delivery; consumers call [`EventBus::ack`] once a handler completes,
    /// and [`EventBus::replay`] returns unacked events after a restart.
    pub fn with_journal(mut self, path: PathBuf) -> Self {
        self.journal = Some(Arc::new(EventJournal::new(path)));
        self
    }

    /// Register a subscriber for the given event kinds.
    ///
    /// Returns the subscriber id and the receiving end of its queue.
    /// Delivery order for events sharing a session key is FIFO by
    /// sequence number.
    pub async fn subscribe(&self, kinds: &[EventKind]) -> (SubscriberId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.subscribers.write().await;
        subscribers.push(Subscriber {
            id,
            kinds: kinds.iter().copied().collect(),
            tx,
        });
        (id, rx)
    }

    /// Remove a subscriber. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| s.id != id);
    }

    /// Publish an event to every subscriber interested in its kind.
    ///
    /// Blocks at most the configured enqueue wait per subscriber; a queue
    /// still full after that fails the whole publish with
    /// [`YoctoError::Backpressure`] and the caller decides whether to retry
    /// or discard. Subscribers whose receiver was dropped are pruned
    /// silently.
    pub async fn publish(&self, mut event: Event) -> Result<()> {
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        if event.kind().is_durable() {
            if let Some(journal) = &self.journal {
                journal.append(&event).await?;
            }
        }

        let targets = self.matching_senders(event.kind()).await;
        let mut dead = Vec::new();
        let mut backpressured = false;

        for (id, tx) in targets {
            match tx.send_timeout(event.clone(), self.enqueue_wait).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    backpressured = true;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    dead.push(id);
                }
            }
        }

        self.prune(&dead).await;

        if backpressured {
            return Err(YoctoError::Backpressure);
        }
        Ok(())
    }

    /// Publish without waiting: a full subscriber queue immediately fails
    /// with `Backpressure`. Used by timer producers that would rather skip
    /// a tick than stall their loop.
    pub async fn try_publish(&self, mut event: Event) -> Result<()> {
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        if event.kind().is_durable() {
            if let Some(journal) = &self.journal {
                journal.append(&event).await?;
            }
        }

        let targets = self.matching_senders(event.kind()).await;
        let mut dead = Vec::new();
        let mut backpressured = false;

        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    backpressured = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(id);
                }
            }
        }

        self.prune(&dead).await;

        if backpressured {
            return Err(YoctoError::Backpressure);
        }
        Ok(())
    }

    /// Mark a durable event as fully processed. No-op without a journal.
    pub async fn ack(&self, event_id: &str) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.ack(event_id).await?;
        }
        Ok(())
    }

    /// Return journaled events that were never acked, in publish order.
    /// Empty without a journal. Redelivery is at-least-once; consumers
    /// dedup by event id.
    pub async fn replay(&self) -> Result<Vec<Event>> {
        match &self.journal {
            Some(journal) => journal.replay().await,
            None => Ok(Vec::new()),
        }
    }

    /// Number of currently registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn matching_senders(&self, kind: EventKind) -> Vec<(SubscriberId, mpsc::Sender<Event>)> {
        let subscribers = self.subscribers.read().await;
        subscribers
            .iter()
            .filter(|s| s.kinds.contains(&kind))
            .map(|s| (s.id, s.tx.clone()))
            .collect()
    }

    async fn prune(&self, dead: &[SubscriberId]) {
        if dead.is_empty() {
            return;
        }
        debug!(count = dead.len(), "Pruning closed subscribers");
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !dead.contains(&s.id));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            next_subscriber_id: Arc::clone(&self.next_subscriber_id),
            seq: Arc::clone(&self.seq),
            buffer_size: self.buffer_size,
            enqueue_wait: self.enqueue_wait,
            journal: self.journal.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(&[EventKind::Inbound]).await;

        bus.publish(Event::inbound("s1", "hello")).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), EventKind::Inbound);
        assert_eq!(received.session_key.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_publish_skips_unrelated_subscriber() {
        let bus = EventBus::new();
        let (_a, mut inbound_rx) = bus.subscribe(&[EventKind::Inbound]).await;
        let (_b, mut timer_rx) = bus.subscribe(&[EventKind::Timer]).await;

        bus.publish(Event::inbound("s1", "hello")).await.unwrap();

        assert!(inbound_rx.recv().await.is_some());
        assert!(timer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_subscribers() {
        let bus = EventBus::new();
        let (_a, mut rx1) = bus.subscribe(&[EventKind::Outbound]).await;
        let (_b, mut rx2) = bus.subscribe(&[EventKind::Outbound]).await;

        bus.publish(Event::outbound("s1", "bye", DeliveryStatus::Ok))
            .await
            .unwrap();

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(&[EventKind::Inbound]).await;

        for i in 0..5 {
            bus.publish(Event::inbound("s1", &format!("msg {}", i)))
                .await
                .unwrap();
        }

        let mut last_seq = 0;
        for _ in 0..5 {
            let event = rx.recv().await.unwrap();
            assert!(event.seq > last_seq, "sequence must strictly increase");
            last_seq = event.seq;
        }
    }

    #[tokio::test]
    async fn test_fifo_per_session_key() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(&[EventKind::Inbound]).await;

        for i in 0..10 {
            bus.publish(Event::inbound("s1", &format!("msg {}", i)))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::Inbound { ref text, .. } => {
                    assert_eq!(text, &format!("msg {}", i));
                }
                _ => panic!("expected inbound"),
            }
        }
    }

    #[tokio::test]
    async fn test_try_publish_backpressure_on_full_queue() {
        let bus = EventBus::with_buffer_size(2);
        let (_id, _rx) = bus.subscribe(&[EventKind::Inbound]).await;

        bus.try_publish(Event::inbound("s", "1")).await.unwrap();
        bus.try_publish(Event::inbound("s", "2")).await.unwrap();

        let result = bus.try_publish(Event::inbound("s", "3")).await;
        assert!(matches!(result, Err(YoctoError::Backpressure)));
    }

    #[tokio::test]
    async fn test_publish_backpressure_after_bounded_wait() {
        let bus =
            EventBus::with_buffer_size(1).with_enqueue_wait(Duration::from_millis(20));
        let (_id, _rx) = bus.subscribe(&[EventKind::Inbound]).await;

        bus.publish(Event::inbound("s", "1")).await.unwrap();
        let result = bus.publish(Event::inbound("s", "2")).await;
        assert!(matches!(result, Err(YoctoError::Backpressure)));
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(Event::inbound("s", "nobody listening"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe(&[EventKind::Inbound]).await;
        bus.unsubscribe(id).await;

        bus.publish(Event::inbound("s", "gone")).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe(&[EventKind::Inbound]).await;
        drop(rx);

        bus.publish(Event::inbound("s", "hello")).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_journal_replay_returns_unacked_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        let bus = EventBus::new().with_journal(path.clone());
        let (_id, _rx) = bus.subscribe(&[EventKind::Inbound]).await;

        let first = Event::inbound("s1", "acked");
        let second = Event::inbound("s1", "lost");
        let first_id = first.id.clone();

        bus.publish(first).await.unwrap();
        bus.publish(second).await.unwrap();
        bus.ack(&first_id).await.unwrap();

        // Simulate a restart with a fresh bus over the same journal file.
        let recovered = EventBus::new().with_journal(path);
        let replayed = recovered.replay().await.unwrap();
        assert_eq!(replayed.len(), 1);
        match &replayed[0].payload {
            EventPayload::Inbound { text, .. } => assert_eq!(text, "lost"),
            _ => panic!("expected inbound"),
        }
    }

    #[tokio::test]
    async fn test_timer_events_are_not_journaled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        let bus = EventBus::new().with_journal(path.clone());
        bus.publish(Event::timer(None, TimerSource::Heartbeat))
            .await
            .unwrap();

        let recovered = EventBus::new().with_journal(path);
        assert!(recovered.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bus_clone_shares_subscribers() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();

        let (_id, mut rx) = bus1.subscribe(&[EventKind::Inbound]).await;
        bus2.publish(Event::inbound("s", "via clone")).await.unwrap();
        assert!(rx.recv().await.is_some());
    }
}
