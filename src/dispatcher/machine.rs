//! Per-session state transitions.
//!
//! Every function here is a pure mutation over one `Session`: it inspects
//! the event, moves the turn/step ledger forward, and returns the side
//! effects the caller must perform after the mutation persists. Per event
//! that is at most one outbound publish and at most one downstream call,
//! so a session can never fan out more work than the turn it owns.

use crate::bus::DeliveryStatus;
use crate::error::Result;
use crate::providers::ProviderOutcome;
use crate::session::{Session, SessionStatus, Step, StepKind, TurnResult};
use crate::skills::{SkillRegistry, ToolOutcome};

/// An outgoing message the dispatcher should publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundNote {
    pub text: String,
    pub status: DeliveryStatus,
}

/// A downstream call the dispatcher should spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRequest {
    /// Call the provider for the step. `attempt` is the retry ordinal used
    /// to compute backoff; 0 is the first dispatch and waits nothing.
    Provider { step_id: String, attempt: u32 },
    /// Invoke a registry command for the step.
    Tool {
        step_id: String,
        command: String,
        args: String,
    },
}

/// Side effects of one transition, executed after the session persists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    pub outbound: Option<OutboundNote>,
    pub call: Option<CallRequest>,
}

impl Effects {
    /// No side effects (stale or ignorable event).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn outbound(text: &str, status: DeliveryStatus) -> Self {
        Self {
            outbound: Some(OutboundNote {
                text: text.to_string(),
                status,
            }),
            call: None,
        }
    }

    pub fn call(call: CallRequest) -> Self {
        Self {
            outbound: None,
            call: Some(call),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_none() && self.call.is_none()
    }
}

/// How an inbound text routes.
enum Route {
    Command { name: String, args: String },
    Provider,
}

/// A leading `/<name>` that resolves in the registry routes to that
/// command; everything else goes to the provider. A registered command
/// always wins over the free-text reading of the same message.
fn route_text(text: &str, registry: &SkillRegistry) -> Route {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix('/') {
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        if registry.has(name) {
            return Route::Command {
                name: name.to_string(),
                args: args.to_string(),
            };
        }
    }
    Route::Provider
}

/// Inbound message (or cron payload acting as a silent user turn): begin a
/// fresh turn and dispatch its first step.
///
/// The caller guarantees no turn is currently awaiting a result; an open
/// turn here is an invariant violation and surfaces as a session error.
pub fn on_inbound(
    session: &mut Session,
    event_id: &str,
    text: &str,
    registry: &SkillRegistry,
    provider_name: &str,
) -> Result<Effects> {
    let route = route_text(text, registry);
    let turn = session.begin_turn(event_id, text)?;

    match route {
        Route::Command { name, args } => {
            let step = Step::tool_call(&name, &args);
            let step_id = step.id.clone();
            turn.push_step(step)?;
            session.status = SessionStatus::AwaitingTool;
            session.touch();
            Ok(Effects::call(CallRequest::Tool {
                step_id,
                command: name,
                args,
            }))
        }
        Route::Provider => {
            let step = Step::provider_call(provider_name, text);
            let step_id = step.id.clone();
            turn.push_step(step)?;
            session.status = SessionStatus::AwaitingProvider;
            session.touch();
            Ok(Effects::call(CallRequest::Provider { step_id, attempt: 0 }))
        }
    }
}

/// Provider completion for a pending step.
///
/// A result whose correlation id matches no pending step is stale (the
/// turn was cancelled or timed out first) and is discarded without
/// effects. `max_attempts` bounds the total tries per step; a retryable
/// failure re-dispatches the same step, anything else fails the turn with
/// exactly one outbound error.
pub fn on_provider_result(
    session: &mut Session,
    step_id: &str,
    outcome: ProviderOutcome,
    max_attempts: u32,
) -> Result<Effects> {
    let Some(turn) = session.open_turn_mut() else {
        return Ok(Effects::none());
    };
    let Some(step) = turn.step_mut(step_id) else {
        return Ok(Effects::none());
    };
    if step.is_terminal() {
        return Ok(Effects::none());
    }

    match outcome {
        ProviderOutcome::Reply { text } => {
            step.succeed(&text);
            turn.conclude(TurnResult::Reply { text: text.clone() })?;
            session.status = SessionStatus::Idle;
            session.touch();
            Ok(Effects::outbound(&text, DeliveryStatus::Ok))
        }
        ProviderOutcome::ToolUse { name, arguments } => {
            step.succeed(&format!("tool requested: {}", name));
            let tool_step = Step::tool_call(&name, &arguments);
            let tool_step_id = tool_step.id.clone();
            turn.push_step(tool_step)?;
            session.status = SessionStatus::AwaitingTool;
            session.touch();
            Ok(Effects::call(CallRequest::Tool {
                step_id: tool_step_id,
                command: name,
                args: arguments,
            }))
        }
        ProviderOutcome::Failed { error } => {
            if error.is_retryable() && step.retries + 1 < max_attempts {
                step.retries += 1;
                let attempt = step.retries;
                session.touch();
                Ok(Effects::call(CallRequest::Provider {
                    step_id: step_id.to_string(),
                    attempt,
                }))
            } else {
                step.fail(&error.to_string());
                let message = format!("Sorry, I could not complete that: {}", error);
                turn.conclude(TurnResult::Error {
                    message: message.clone(),
                })?;
                session.status = SessionStatus::Failed;
                session.touch();
                Ok(Effects::outbound(&message, DeliveryStatus::Error))
            }
        }
    }
}

/// Tool completion for a pending step.
///
/// A turn that began with a slash command concludes directly with the tool
/// output; a tool the provider requested feeds its output back through a
/// fresh provider step. Tool failures fail the turn.
pub fn on_tool_result(
    session: &mut Session,
    step_id: &str,
    outcome: ToolOutcome,
    provider_name: &str,
) -> Result<Effects> {
    let Some(turn) = session.open_turn_mut() else {
        return Ok(Effects::none());
    };
    let slash_turn = turn
        .steps
        .first()
        .map(|s| s.kind == StepKind::ToolCall)
        .unwrap_or(false);
    let Some(step) = turn.step_mut(step_id) else {
        return Ok(Effects::none());
    };
    if step.is_terminal() {
        return Ok(Effects::none());
    }
    let target = step.target.clone();

    match outcome {
        ToolOutcome::Success { output } => {
            step.succeed(&output);
            if slash_turn {
                turn.conclude(TurnResult::Reply {
                    text: output.clone(),
                })?;
                session.status = SessionStatus::Idle;
                session.touch();
                Ok(Effects::outbound(&output, DeliveryStatus::Ok))
            } else {
                let next = Step::provider_call(provider_name, &output);
                let next_id = next.id.clone();
                turn.push_step(next)?;
                session.status = SessionStatus::AwaitingProvider;
                session.touch();
                Ok(Effects::call(CallRequest::Provider {
                    step_id: next_id,
                    attempt: 0,
                }))
            }
        }
        ToolOutcome::Failure { kind: _, message } => {
            step.fail(&message);
            let text = format!("Command '{}' failed: {}", target, message);
            turn.conclude(TurnResult::Error {
                message: text.clone(),
            })?;
            session.status = SessionStatus::Failed;
            session.touch();
            Ok(Effects::outbound(&text, DeliveryStatus::Error))
        }
    }
}

/// Explicit cancel. Honored only while a turn is awaiting a result; a
/// cancel for a concluded turn is a no-op. The session returns to Idle so
/// the next inbound starts fresh, and late results for the abandoned steps
/// are discarded by their terminal status.
pub fn on_cancel(session: &mut Session) -> Result<Effects> {
    if !session.is_awaiting() {
        return Ok(Effects::none());
    }
    let Some(turn) = session.open_turn_mut() else {
        return Ok(Effects::none());
    };
    for step in turn.steps.iter_mut() {
        if !step.is_terminal() {
            step.fail("cancelled");
        }
    }
    turn.conclude(TurnResult::Cancelled)?;
    session.status = SessionStatus::Idle;
    session.touch();
    Ok(Effects::outbound(
        "Okay, I stopped working on that.",
        DeliveryStatus::Cancelled,
    ))
}

/// Staleness probe: force-fail a turn stuck awaiting a result.
///
/// The caller decides *whether* the session is stale (elapsed time since
/// last activity); this transition only performs the failure. It does not
/// touch `last_activity`.
pub fn on_stale(session: &mut Session) -> Result<Effects> {
    if !session.is_awaiting() {
        return Ok(Effects::none());
    }
    let Some(turn) = session.open_turn_mut() else {
        return Ok(Effects::none());
    };
    let message = "I timed out waiting for a result. Please try again.";
    for step in turn.steps.iter_mut() {
        if !step.is_terminal() {
            step.fail("timed out");
        }
    }
    turn.conclude(TurnResult::Error {
        message: message.to_string(),
    })?;
    session.status = SessionStatus::Failed;
    Ok(Effects::outbound(message, DeliveryStatus::Error))
}
