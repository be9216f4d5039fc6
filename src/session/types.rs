//! Session types for YoctoClaw
//!
//! The data model for durable conversation state: a `Session` owns an
//! ordered log of `Turn`s, each turn an ordered log of `Step`s (provider or
//! tool invocations). Invariants enforced here:
//!
//! - at most one turn is open per session at any time
//! - a turn cannot conclude while an unresolved step exists
//! - step retries are bounded by the caller's configured maximum

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, YoctoError};
use crate::providers::{ChatMessage, ChatRole};

/// How many processed event ids a session remembers for replay dedup.
const PROCESSED_LOG_CAP: usize = 512;

/// Per-session state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No turn in flight
    Idle,
    /// A provider call is pending
    AwaitingProvider,
    /// A tool invocation is pending
    AwaitingTool,
    /// The last turn failed; the next inbound event starts fresh
    Failed,
}

/// What a step invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ProviderCall,
    ToolCall,
}

/// Step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

/// A single provider or tool invocation within a turn.
///
/// The step id doubles as the correlation id matching the step to its
/// eventual `ProviderResult`/`ToolResult` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    /// Provider name or command name
    pub target: String,
    /// Prompt text or command arguments
    pub input: String,
    pub output: Option<String>,
    pub status: StepStatus,
    pub retries: u32,
}

impl Step {
    /// A pending provider call.
    pub fn provider_call(target: &str, input: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: StepKind::ProviderCall,
            target: target.to_string(),
            input: input.to_string(),
            output: None,
            status: StepStatus::Pending,
            retries: 0,
        }
    }

    /// A pending tool/command invocation.
    pub fn tool_call(target: &str, input: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: StepKind::ToolCall,
            target: target.to_string(),
            input: input.to_string(),
            output: None,
            status: StepStatus::Pending,
            retries: 0,
        }
    }

    /// Whether the step has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status != StepStatus::Pending
    }

    /// Mark the step succeeded with its output.
    pub fn succeed(&mut self, output: &str) {
        self.output = Some(output.to_string());
        self.status = StepStatus::Succeeded;
    }

    /// Mark the step terminally failed.
    pub fn fail(&mut self, reason: &str) {
        self.output = Some(reason.to_string());
        self.status = StepStatus::Failed;
    }
}

/// Terminal result of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TurnResult {
    Reply { text: String },
    Error { message: String },
    Cancelled,
}

/// One request/response cycle within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    /// Id of the event that started this turn
    pub origin_event_id: String,
    /// The text that started the turn (user input or cron payload)
    pub prompt: String,
    pub steps: Vec<Step>,
    pub result: Option<TurnResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Turn {
    fn new(origin_event_id: &str, prompt: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin_event_id: origin_event_id.to_string(),
            prompt: prompt.to_string(),
            steps: Vec::new(),
            result: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Whether the turn has not yet reached a terminal result.
    pub fn is_open(&self) -> bool {
        self.result.is_none()
    }

    /// Find a step by its correlation id.
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Append a step. The previous step, if any, must already be terminal:
    /// steps within a turn are strictly ordered.
    pub fn push_step(&mut self, step: Step) -> Result<()> {
        if let Some(last) = self.steps.last() {
            if !last.is_terminal() {
                return Err(YoctoError::Session(format!(
                    "cannot append step to turn {}: step {} is still pending",
                    self.id, last.id
                )));
            }
        }
        self.steps.push(step);
        Ok(())
    }

    /// Conclude the turn. Fails if any step is unresolved.
    pub fn conclude(&mut self, result: TurnResult) -> Result<()> {
        if let Some(pending) = self.steps.iter().find(|s| !s.is_terminal()) {
            return Err(YoctoError::Session(format!(
                "cannot conclude turn {}: step {} is unresolved",
                self.id, pending.id
            )));
        }
        self.result = Some(result);
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

/// Durable, keyed conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub status: SessionStatus,
    pub turns: Vec<Turn>,
    /// Monotonic mutation counter, used to order events and detect stale replays
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Most recent processed event ids, bounded to [`PROCESSED_LOG_CAP`]
    #[serde(default)]
    processed_events: VecDeque<String>,
}

impl Session {
    /// Create a new idle session.
    ///
    /// # Example
    /// ```
    /// use yoctoclaw::session::{Session, SessionStatus};
    ///
    /// let session = Session::new("telegram:42");
    /// assert_eq!(session.status, SessionStatus::Idle);
    /// assert!(session.turns.is_empty());
    /// ```
    pub fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            status: SessionStatus::Idle,
            turns: Vec::new(),
            seq: 0,
            created_at: now,
            last_activity: now,
            processed_events: VecDeque::new(),
        }
    }

    /// The currently open turn, if any.
    pub fn open_turn(&self) -> Option<&Turn> {
        self.turns.last().filter(|t| t.is_open())
    }

    /// Mutable access to the currently open turn.
    pub fn open_turn_mut(&mut self) -> Option<&mut Turn> {
        self.turns.last_mut().filter(|t| t.is_open())
    }

    /// Begin a fresh turn. Fails if another turn is still open: at most one
    /// turn may be in a non-terminal state per session.
    pub fn begin_turn(&mut self, origin_event_id: &str, prompt: &str) -> Result<&mut Turn> {
        if let Some(open) = self.open_turn() {
            return Err(YoctoError::Session(format!(
                "session {} already has open turn {}",
                self.key, open.id
            )));
        }
        self.turns.push(Turn::new(origin_event_id, prompt));
        Ok(self.turns.last_mut().expect("turn just pushed"))
    }

    /// Whether the session is waiting on a provider or tool result.
    pub fn is_awaiting(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::AwaitingProvider | SessionStatus::AwaitingTool
        )
    }

    /// Whether an event id was already processed against this session.
    pub fn has_processed(&self, event_id: &str) -> bool {
        self.processed_events.iter().any(|id| id == event_id)
    }

    /// Record a processed event id, evicting the oldest past the cap.
    pub fn record_processed(&mut self, event_id: &str) {
        self.processed_events.push_back(event_id.to_string());
        while self.processed_events.len() > PROCESSED_LOG_CAP {
            self.processed_events.pop_front();
        }
    }

    /// Bump the last-activity timestamp. Called by state transitions that
    /// represent real progress; staleness probes deliberately do not touch it.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Project the turn/step log into provider chat messages: each turn's
    /// prompt as a user message, tool outputs as tool messages, and the
    /// concluded reply as an assistant message.
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut out = Vec::new();
        for turn in &self.turns {
            out.push(ChatMessage {
                role: ChatRole::User,
                content: turn.prompt.clone(),
            });
            for step in &turn.steps {
                if step.kind == StepKind::ToolCall {
                    if let Some(output) = &step.output {
                        out.push(ChatMessage {
                            role: ChatRole::Tool,
                            content: output.clone(),
                        });
                    }
                }
            }
            if let Some(TurnResult::Reply { text }) = &turn.result {
                out.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content: text.clone(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_new() {
        let session = Session::new("test");
        assert_eq!(session.key, "test");
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.seq, 0);
        assert!(session.open_turn().is_none());
    }

    #[test]
    fn test_begin_turn_rejects_second_open_turn() {
        let mut session = Session::new("test");
        session.begin_turn("evt-1", "first").unwrap();

        let err = session.begin_turn("evt-2", "second").unwrap_err();
        assert!(matches!(err, YoctoError::Session(_)));
        assert_eq!(session.turns.len(), 1);
    }

    #[test]
    fn test_begin_turn_after_conclusion() {
        let mut session = Session::new("test");
        session.begin_turn("evt-1", "first").unwrap();
        session
            .open_turn_mut()
            .unwrap()
            .conclude(TurnResult::Reply {
                text: "done".into(),
            })
            .unwrap();

        session.begin_turn("evt-2", "second").unwrap();
        assert_eq!(session.turns.len(), 2);
    }

    #[test]
    fn test_turn_cannot_conclude_with_pending_step() {
        let mut session = Session::new("test");
        let turn = session.begin_turn("evt-1", "hi").unwrap();
        turn.push_step(Step::provider_call("echo", "hi")).unwrap();

        let err = turn
            .conclude(TurnResult::Reply { text: "x".into() })
            .unwrap_err();
        assert!(matches!(err, YoctoError::Session(_)));
        assert!(turn.is_open());
    }

    #[test]
    fn test_push_step_requires_previous_terminal() {
        let mut session = Session::new("test");
        let turn = session.begin_turn("evt-1", "hi").unwrap();
        turn.push_step(Step::provider_call("echo", "hi")).unwrap();

        let err = turn.push_step(Step::tool_call("hello", "World")).unwrap_err();
        assert!(matches!(err, YoctoError::Session(_)));
        assert_eq!(turn.steps.len(), 1);
    }

    #[test]
    fn test_step_lifecycle() {
        let mut step = Step::provider_call("echo", "hi");
        assert_eq!(step.status, StepStatus::Pending);
        assert!(!step.is_terminal());

        step.succeed("hello back");
        assert_eq!(step.status, StepStatus::Succeeded);
        assert!(step.is_terminal());
        assert_eq!(step.output.as_deref(), Some("hello back"));
    }

    #[test]
    fn test_step_correlation_lookup() {
        let mut session = Session::new("test");
        let turn = session.begin_turn("evt-1", "hi").unwrap();
        let step = Step::provider_call("echo", "hi");
        let step_id = step.id.clone();
        turn.push_step(step).unwrap();

        assert!(turn.step_mut(&step_id).is_some());
        assert!(turn.step_mut("unknown").is_none());
    }

    #[test]
    fn test_processed_event_dedup() {
        let mut session = Session::new("test");
        assert!(!session.has_processed("evt-1"));

        session.record_processed("evt-1");
        assert!(session.has_processed("evt-1"));
        assert!(!session.has_processed("evt-2"));
    }

    #[test]
    fn test_processed_log_is_bounded() {
        let mut session = Session::new("test");
        for i in 0..600 {
            session.record_processed(&format!("evt-{}", i));
        }
        // Oldest entries were evicted, newest retained.
        assert!(!session.has_processed("evt-0"));
        assert!(session.has_processed("evt-599"));
    }

    #[test]
    fn test_history_projection() {
        let mut session = Session::new("test");
        let turn = session.begin_turn("evt-1", "what time is it").unwrap();
        let mut step = Step::tool_call("clock", "");
        step.succeed("12:00");
        turn.steps.push(step);
        turn.conclude(TurnResult::Reply {
            text: "It is noon.".into(),
        })
        .unwrap();

        let history = session.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[0].content, "what time is it");
        assert_eq!(history[1].role, ChatRole::Tool);
        assert_eq!(history[1].content, "12:00");
        assert_eq!(history[2].role, ChatRole::Assistant);
    }

    #[test]
    fn test_history_skips_failed_turn_reply() {
        let mut session = Session::new("test");
        let turn = session.begin_turn("evt-1", "hi").unwrap();
        turn.conclude(TurnResult::Error {
            message: "boom".into(),
        })
        .unwrap();

        let history = session.history();
        // The prompt is kept; no assistant message for a failed turn.
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, ChatRole::User);
    }

    #[test]
    fn test_session_serialization_roundtrip() {
        let mut session = Session::new("test");
        session.record_processed("evt-1");
        let turn = session.begin_turn("evt-1", "hi").unwrap();
        turn.push_step(Step::provider_call("echo", "hi")).unwrap();

        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
        assert!(back.has_processed("evt-1"));
    }
}
