//! Dispatcher module - the agent loop
//!
//! The `Dispatcher` consumes bus events and drives the per-session state
//! machine in [`machine`]. An intake task routes each session-keyed event
//! to that session's worker (lazily spawned, own queue), so one session is
//! processed strictly serially in arrival order while different sessions
//! run fully in parallel. Global heartbeat ticks fan out as per-session
//! staleness probes.
//!
//! Provider and tool calls never park a worker: each pending step is
//! dispatched as a spawned task that publishes its `ProviderResult` /
//! `ToolResult` event carrying the step's correlation id, and the worker
//! resumes when that event arrives.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use yoctoclaw::bus::{Event, EventBus};
//! use yoctoclaw::config::Config;
//! use yoctoclaw::dispatcher::Dispatcher;
//! use yoctoclaw::providers::EchoProvider;
//! use yoctoclaw::session::SessionStore;
//! use yoctoclaw::skills::SkillRegistry;
//!
//! let config = Config::default();
//! let bus = EventBus::new();
//! let registry = Arc::new(SkillRegistry::with_builtins()?);
//! let dispatcher = Dispatcher::new(
//!     &config,
//!     SessionStore::new_memory(),
//!     registry,
//!     Arc::new(EchoProvider),
//!     bus.clone(),
//! );
//! dispatcher.start().await?;
//! bus.publish(Event::inbound("cli:stdin", "/hello World")).await?;
//! ```

pub mod machine;

pub use machine::{CallRequest, Effects, OutboundNote};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{Event, EventBus, EventKind, EventPayload, SubscriberId, TimerSource};
use crate::config::{Config, RuntimeConfig};
use crate::error::{Result, YoctoError};
use crate::providers::{ProviderAdapter, ProviderOutcome};
use crate::session::{Applied, SessionStore};
use crate::skills::{SkillRegistry, ToolErrorKind, ToolOutcome};

/// Capacity of each per-session worker queue.
const WORKER_QUEUE_SIZE: usize = 64;

/// Everything a worker or spawned call needs, shared behind one `Arc`.
struct WorkerCtx {
    runtime: RuntimeConfig,
    store: SessionStore,
    registry: Arc<SkillRegistry>,
    provider: Arc<dyn ProviderAdapter>,
    bus: EventBus,
}

/// The event-consuming state machine driver.
pub struct Dispatcher {
    ctx: Arc<WorkerCtx>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    workers: Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>,
    subscriber: Mutex<Option<SubscriberId>>,
}

impl Dispatcher {
    /// Build a dispatcher over the given collaborators. Nothing runs until
    /// [`Dispatcher::start`].
    pub fn new(
        config: &Config,
        store: SessionStore,
        registry: Arc<SkillRegistry>,
        provider: Arc<dyn ProviderAdapter>,
        bus: EventBus,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx: Arc::new(WorkerCtx {
                runtime: config.runtime.clone(),
                store,
                registry,
                provider,
                bus,
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            workers: Arc::new(Mutex::new(HashMap::new())),
            subscriber: Mutex::new(None),
        }
    }

    /// Whether the intake loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The session store this dispatcher mutates.
    pub fn store(&self) -> &SessionStore {
        &self.ctx.store
    }

    /// Subscribe to the bus and start the intake loop in the background.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(YoctoError::Config("dispatcher already running".into()));
        }

        let (id, mut rx) = self
            .ctx
            .bus
            .subscribe(&[
                EventKind::Inbound,
                EventKind::ProviderResult,
                EventKind::ToolResult,
                EventKind::Timer,
                EventKind::Cancel,
            ])
            .await;
        {
            let mut subscriber = self.subscriber.lock().await;
            *subscriber = Some(id);
        }

        let ctx = Arc::clone(&self.ctx);
        let workers = Arc::clone(&self.workers);
        let running = Arc::clone(&self.running);
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // Consume any stale stop signal from a previous run.
        let _ = *shutdown_rx.borrow_and_update();

        tokio::spawn(async move {
            info!("Dispatcher started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => route(&ctx, &workers, &shutdown_tx, event).await,
                            None => {
                                info!("Bus subscription closed");
                                break;
                            }
                        }
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Dispatcher stopped");
        });

        Ok(())
    }

    /// Stop the intake loop and all session workers.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let id = {
            let mut subscriber = self.subscriber.lock().await;
            subscriber.take()
        };
        if let Some(id) = id {
            self.ctx.bus.unsubscribe(id).await;
        }
        let mut workers = self.workers.lock().await;
        workers.clear();
    }
}

/// Route one bus event: session-keyed events go to that session's worker,
/// a global heartbeat fans out as staleness probes, anything else without
/// a session has nowhere to go.
async fn route(
    ctx: &Arc<WorkerCtx>,
    workers: &Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>,
    shutdown_tx: &watch::Sender<bool>,
    event: Event,
) {
    match event.session_key.clone() {
        Some(key) => deliver(ctx, workers, shutdown_tx, &key, event).await,
        None => match event.payload {
            EventPayload::Timer {
                timer: TimerSource::Heartbeat,
            } => fan_out_probes(ctx, workers, shutdown_tx).await,
            _ => debug!(event_id = %event.id, "Dropping event without a session key"),
        },
    }
}

/// Turn a heartbeat tick into one staleness probe per known session.
async fn fan_out_probes(
    ctx: &Arc<WorkerCtx>,
    workers: &Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>,
    shutdown_tx: &watch::Sender<bool>,
) {
    let keys = match ctx.store.keys().await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "Could not list sessions for staleness probing");
            return;
        }
    };
    for key in keys {
        let probe = Event::timer(Some(&key), TimerSource::StaleCheck);
        deliver(ctx, workers, shutdown_tx, &key, probe).await;
    }
}

/// Hand an event to the session's worker, spawning it on first use.
async fn deliver(
    ctx: &Arc<WorkerCtx>,
    workers: &Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>,
    shutdown_tx: &watch::Sender<bool>,
    key: &str,
    event: Event,
) {
    let tx = {
        let mut workers = workers.lock().await;
        workers
            .entry(key.to_string())
            .or_insert_with(|| spawn_worker(Arc::clone(ctx), shutdown_tx.subscribe(), key))
            .clone()
    };

    if let Err(e) = tx.send(event).await {
        // The worker exited (shutdown race); replace it and retry once.
        let event = e.0;
        let tx = {
            let mut workers = workers.lock().await;
            let tx = spawn_worker(Arc::clone(ctx), shutdown_tx.subscribe(), key);
            workers.insert(key.to_string(), tx.clone());
            tx
        };
        if tx.send(event).await.is_err() {
            warn!(session = %key, "Session worker unavailable, event dropped");
        }
    }
}

/// Spawn the per-session worker task and return its queue.
fn spawn_worker(
    ctx: Arc<WorkerCtx>,
    mut shutdown_rx: watch::Receiver<bool>,
    key: &str,
) -> mpsc::Sender<Event> {
    let (tx, mut rx) = mpsc::channel(WORKER_QUEUE_SIZE);
    let key = key.to_string();
    tokio::spawn(async move {
        let _ = *shutdown_rx.borrow_and_update();
        debug!(session = %key, "Session worker started");
        // Inbound events that arrive mid-turn wait here until the turn
        // concludes, preserving the single-active-turn invariant without
        // dropping input.
        let mut deferred: VecDeque<Event> = VecDeque::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    handle_event(&ctx, &key, &mut deferred, event).await;
                }
            }
        }
        debug!(session = %key, "Session worker stopped");
    });
    tx
}

/// Whether the event begins a fresh turn when processed.
fn starts_turn(event: &Event) -> bool {
    matches!(
        event.payload,
        EventPayload::Inbound { .. }
            | EventPayload::Timer {
                timer: TimerSource::Cron { .. },
            }
    )
}

async fn session_is_awaiting(ctx: &WorkerCtx, key: &str) -> bool {
    match ctx.store.get(key).await {
        Ok(Some(session)) => session.is_awaiting(),
        _ => false,
    }
}

/// Process one event for the session, deferring turn-starters that arrive
/// while a turn is active and draining them once it concludes.
async fn handle_event(
    ctx: &Arc<WorkerCtx>,
    key: &str,
    deferred: &mut VecDeque<Event>,
    event: Event,
) {
    if starts_turn(&event) && session_is_awaiting(ctx, key).await {
        debug!(session = %key, event_id = %event.id, "Turn active, deferring inbound");
        deferred.push_back(event);
        return;
    }

    process_event(ctx, key, event).await;

    while !deferred.is_empty() {
        if session_is_awaiting(ctx, key).await {
            break;
        }
        if let Some(next) = deferred.pop_front() {
            process_event(ctx, key, next).await;
        }
    }
}

async fn process_event(ctx: &Arc<WorkerCtx>, key: &str, event: Event) {
    let span = info_span!(
        "event",
        event_id = %event.id,
        session = %key,
        kind = ?event.kind(),
        seq = event.seq,
    );
    async {
        let durable = event.kind().is_durable();
        let event_id = event.id.clone();

        match apply(ctx, key, &event).await {
            Ok(Some(effects)) => execute_effects(ctx, key, effects).await,
            Ok(None) => debug!("Duplicate event discarded"),
            Err(e) => error!(error = %e, "Event processing failed"),
        }

        if durable {
            if let Err(e) = ctx.bus.ack(&event_id).await {
                warn!(error = %e, "Failed to ack durable event");
            }
        }
    }
    .instrument(span)
    .await
}

/// Run the matching state transition under the session's lock.
///
/// Returns `Ok(None)` when the store deduplicated the event id (replay).
async fn apply(ctx: &Arc<WorkerCtx>, key: &str, event: &Event) -> Result<Option<Effects>> {
    let provider_name = ctx.provider.name().to_string();
    let registry = Arc::clone(&ctx.registry);
    let max_attempts = ctx.runtime.max_step_retries;

    let applied = match &event.payload {
        EventPayload::Inbound { text, .. } => {
            ctx.store
                .apply_mutation(key, &event.id, |session| {
                    machine::on_inbound(session, &event.id, text, &registry, &provider_name)
                })
                .await?
        }
        // A cron payload starts a silent user turn.
        EventPayload::Timer {
            timer: TimerSource::Cron { payload, job },
        } => {
            debug!(job = %job, "Cron entry fired for session");
            ctx.store
                .apply_mutation(key, &event.id, |session| {
                    machine::on_inbound(session, &event.id, payload, &registry, &provider_name)
                })
                .await?
        }
        EventPayload::ProviderResult { step_id, outcome } => {
            ctx.store
                .apply_mutation(key, &event.id, |session| {
                    machine::on_provider_result(session, step_id, outcome.clone(), max_attempts)
                })
                .await?
        }
        EventPayload::ToolResult { step_id, outcome } => {
            ctx.store
                .apply_mutation(key, &event.id, |session| {
                    machine::on_tool_result(session, step_id, outcome.clone(), &provider_name)
                })
                .await?
        }
        EventPayload::Timer {
            timer: TimerSource::StaleCheck,
        } => {
            // Snapshot check first so an idle session costs no mutation.
            let Some(snapshot) = ctx.store.get(key).await? else {
                return Ok(Some(Effects::none()));
            };
            let budget = chrono::Duration::seconds(ctx.runtime.stale_turn_secs as i64);
            if !snapshot.is_awaiting() || Utc::now() - snapshot.last_activity <= budget {
                return Ok(Some(Effects::none()));
            }
            warn!(
                stale_secs = ctx.runtime.stale_turn_secs,
                "Turn exceeded staleness budget, forcing failure"
            );
            ctx.store
                .apply_mutation(key, &event.id, machine::on_stale)
                .await?
        }
        EventPayload::Cancel => {
            ctx.store
                .apply_mutation(key, &event.id, machine::on_cancel)
                .await?
        }
        EventPayload::Timer {
            timer: TimerSource::Heartbeat,
        }
        | EventPayload::Outbound { .. } => return Ok(Some(Effects::none())),
    };

    match applied {
        Applied::Mutated(result) => result.map(Some),
        Applied::Duplicate => Ok(None),
    }
}

/// Perform the transition's side effects: at most one outbound publish and
/// at most one spawned downstream call.
async fn execute_effects(ctx: &Arc<WorkerCtx>, key: &str, effects: Effects) {
    if let Some(note) = effects.outbound {
        let event = Event::outbound(key, &note.text, note.status);
        if let Err(e) = ctx.bus.publish(event).await {
            error!(error = %e, "Failed to publish outbound event");
        }
    }

    match effects.call {
        Some(CallRequest::Provider { step_id, attempt }) => {
            spawn_provider_call(ctx, key, step_id, attempt).await;
        }
        Some(CallRequest::Tool {
            step_id,
            command,
            args,
        }) => spawn_tool_call(ctx, key, step_id, command, args),
        None => {}
    }
}

/// Dispatch a provider call as a detached task. Backoff for retries
/// happens inside the task, never parking the worker.
async fn spawn_provider_call(ctx: &Arc<WorkerCtx>, key: &str, step_id: String, attempt: u32) {
    let history = match ctx.store.get(key).await {
        Ok(Some(session)) => session.history(),
        _ => Vec::new(),
    };
    let catalog = ctx.registry.catalog();
    let delay = ctx.runtime.backoff.delay_for(attempt);
    let provider = Arc::clone(&ctx.provider);
    let bus = ctx.bus.clone();
    let key = key.to_string();

    tokio::spawn(async move {
        if !delay.is_zero() {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
        }
        let outcome: ProviderOutcome = provider.send(history, catalog).await.into();
        if let Err(e) = bus.publish(Event::provider_result(&key, &step_id, outcome)).await {
            error!(error = %e, "Failed to publish provider result");
        }
    });
}

/// Dispatch a command invocation as a detached task.
fn spawn_tool_call(
    ctx: &Arc<WorkerCtx>,
    key: &str,
    step_id: String,
    command: String,
    args: String,
) {
    let registry = Arc::clone(&ctx.registry);
    let bus = ctx.bus.clone();
    let key = key.to_string();

    tokio::spawn(async move {
        let outcome = match registry.resolve(&command) {
            Some(handle) => registry.invoke(&handle, &args, &key).await,
            None => ToolOutcome::failure(
                ToolErrorKind::ExecutionError,
                &format!("no command named '{}'", command),
            ),
        };
        if let Err(e) = bus.publish(Event::tool_result(&key, &step_id, outcome)).await {
            error!(error = %e, "Failed to publish tool result");
        }
    });
}
