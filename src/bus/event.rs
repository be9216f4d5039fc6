//! Event types for the YoctoClaw event bus
//!
//! Every unit of work in the runtime travels as an [`Event`]: channel input,
//! provider completions, tool results, timer ticks, and outgoing replies.
//! Events carry a unique id for deduplication and a bus-assigned sequence
//! number that orders events sharing a session key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::providers::ProviderOutcome;
use crate::skills::ToolOutcome;

/// Discriminant for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A message arriving from a channel adapter
    Inbound,
    /// Completion (or failure) of a provider call
    ProviderResult,
    /// Completion (or failure) of a tool/command invocation
    ToolResult,
    /// A scheduler tick (cron, heartbeat, or staleness probe)
    Timer,
    /// A reply headed back to a channel adapter
    Outbound,
    /// Request to abort the session's in-flight turn
    Cancel,
}

impl EventKind {
    /// Whether events of this kind are journaled for at-least-once
    /// redelivery after a crash. Timer and Cancel events are volatile:
    /// a missed tick or cancel is simply regenerated, never replayed.
    pub fn is_durable(self) -> bool {
        matches!(
            self,
            EventKind::Inbound
                | EventKind::ProviderResult
                | EventKind::ToolResult
                | EventKind::Outbound
        )
    }
}

/// Delivery status attached to outbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Turn concluded normally
    Ok,
    /// Turn failed; the text is an error notice
    Error,
    /// Turn was cancelled on request
    Cancelled,
}

/// Types of media a channel can attach to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Audio,
    Video,
    Document,
}

/// A media attachment referenced by an inbound message.
///
/// Attachments travel by reference (URL or filename), never as raw bytes:
/// inbound events are journaled as JSON lines and must stay small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub media_type: MediaType,
    /// URL to the media, if hosted remotely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Original filename, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MediaAttachment {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            url: None,
            filename: None,
        }
    }

    /// Set the remote URL (builder pattern).
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Set the original filename (builder pattern).
    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }
}

/// Origin of a timer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TimerSource {
    /// A cron entry fired; `payload` is injected as a silent user turn
    Cron { job: String, payload: String },
    /// Global liveness tick carrying no session key
    Heartbeat,
    /// Per-session staleness probe fanned out from a heartbeat tick
    StaleCheck,
}

/// Typed event payload. The variant determines the [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Inbound {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<MediaAttachment>,
    },
    ProviderResult {
        step_id: String,
        outcome: ProviderOutcome,
    },
    ToolResult {
        step_id: String,
        outcome: ToolOutcome,
    },
    Timer {
        timer: TimerSource,
    },
    Outbound {
        text: String,
        status: DeliveryStatus,
    },
    Cancel,
}

/// The unit carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id, used for idempotent replay detection
    pub id: String,
    /// Session this event belongs to; `None` for global timers
    pub session_key: Option<String>,
    /// Monotonic sequence number, stamped by the bus at publish time
    pub seq: u64,
    /// Typed payload
    pub payload: EventPayload,
    /// When the event was created
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create an event with a fresh UUID id. The sequence number is zero
    /// until the bus stamps it during publish.
    pub fn new(session_key: Option<&str>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_key: session_key.map(str::to_string),
            seq: 0,
            payload,
            created_at: Utc::now(),
        }
    }

    /// An inbound channel message for a session.
    ///
    /// # Example
    /// ```
    /// use yoctoclaw::bus::{Event, EventKind};
    ///
    /// let event = Event::inbound("cli:stdin", "hello");
    /// assert_eq!(event.kind(), EventKind::Inbound);
    /// assert_eq!(event.session_key.as_deref(), Some("cli:stdin"));
    /// ```
    pub fn inbound(session_key: &str, text: &str) -> Self {
        Self::new(
            Some(session_key),
            EventPayload::Inbound {
                text: text.to_string(),
                attachments: Vec::new(),
            },
        )
    }

    /// An inbound channel message carrying media attachments.
    pub fn inbound_with_attachments(
        session_key: &str,
        text: &str,
        attachments: Vec<MediaAttachment>,
    ) -> Self {
        Self::new(
            Some(session_key),
            EventPayload::Inbound {
                text: text.to_string(),
                attachments,
            },
        )
    }

    /// A provider completion correlated to a step.
    pub fn provider_result(session_key: &str, step_id: &str, outcome: ProviderOutcome) -> Self {
        Self::new(
            Some(session_key),
            EventPayload::ProviderResult {
                step_id: step_id.to_string(),
                outcome,
            },
        )
    }

    /// A tool completion correlated to a step.
    pub fn tool_result(session_key: &str, step_id: &str, outcome: ToolOutcome) -> Self {
        Self::new(
            Some(session_key),
            EventPayload::ToolResult {
                step_id: step_id.to_string(),
                outcome,
            },
        )
    }

    /// A timer tick. Session key is `None` for global sources.
    pub fn timer(session_key: Option<&str>, timer: TimerSource) -> Self {
        Self::new(session_key, EventPayload::Timer { timer })
    }

    /// An outgoing reply for a channel adapter.
    pub fn outbound(session_key: &str, text: &str, status: DeliveryStatus) -> Self {
        Self::new(
            Some(session_key),
            EventPayload::Outbound {
                text: text.to_string(),
                status,
            },
        )
    }

    /// A cancel request for the session's in-flight turn.
    pub fn cancel(session_key: &str) -> Self {
        Self::new(Some(session_key), EventPayload::Cancel)
    }

    /// The kind implied by the payload variant.
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Inbound { .. } => EventKind::Inbound,
            EventPayload::ProviderResult { .. } => EventKind::ProviderResult,
            EventPayload::ToolResult { .. } => EventKind::ToolResult,
            EventPayload::Timer { .. } => EventKind::Timer,
            EventPayload::Outbound { .. } => EventKind::Outbound,
            EventPayload::Cancel => EventKind::Cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_unique() {
        let a = Event::inbound("s1", "hi");
        let b = Event::inbound("s1", "hi");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_kind_from_payload() {
        assert_eq!(Event::inbound("s", "x").kind(), EventKind::Inbound);
        assert_eq!(
            Event::outbound("s", "x", DeliveryStatus::Ok).kind(),
            EventKind::Outbound
        );
        assert_eq!(
            Event::timer(None, TimerSource::Heartbeat).kind(),
            EventKind::Timer
        );
        assert_eq!(Event::cancel("s").kind(), EventKind::Cancel);
    }

    #[test]
    fn test_durability_classification() {
        assert!(EventKind::Inbound.is_durable());
        assert!(EventKind::ProviderResult.is_durable());
        assert!(EventKind::ToolResult.is_durable());
        assert!(EventKind::Outbound.is_durable());
        assert!(!EventKind::Timer.is_durable());
        assert!(!EventKind::Cancel.is_durable());
    }

    #[test]
    fn test_global_timer_has_no_session_key() {
        let event = Event::timer(None, TimerSource::Heartbeat);
        assert!(event.session_key.is_none());
    }

    #[test]
    fn test_cron_timer_carries_payload() {
        let event = Event::timer(
            Some("telegram:42"),
            TimerSource::Cron {
                job: "daily-digest".into(),
                payload: "summarize my inbox".into(),
            },
        );
        match event.payload {
            EventPayload::Timer {
                timer: TimerSource::Cron { ref job, ref payload },
            } => {
                assert_eq!(job, "daily-digest");
                assert_eq!(payload, "summarize my inbox");
            }
            _ => panic!("expected cron timer payload"),
        }
    }

    #[test]
    fn test_inbound_with_attachments() {
        let attachment = MediaAttachment::new(MediaType::Image)
            .with_url("https://example.com/cat.png")
            .with_filename("cat.png");
        let event = Event::inbound_with_attachments("s1", "look at this", vec![attachment]);

        match &event.payload {
            EventPayload::Inbound { text, attachments } => {
                assert_eq!(text, "look at this");
                assert_eq!(attachments.len(), 1);
                assert_eq!(attachments[0].media_type, MediaType::Image);
                assert_eq!(attachments[0].filename.as_deref(), Some("cat.png"));
            }
            _ => panic!("expected inbound"),
        }

        // Attachments survive the journal roundtrip.
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_inbound_without_attachments_serializes_compactly() {
        let json = serde_json::to_string(&Event::inbound("s1", "hi")).unwrap();
        assert!(!json.contains("attachments"));
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = Event::inbound("cli:stdin", "hello");
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_outbound_status_serializes_snake_case() {
        let json = serde_json::to_string(&DeliveryStatus::Cancelled).unwrap();
        assert_eq!(json, r#""cancelled""#);
    }
}
