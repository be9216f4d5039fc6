//! `run` command — wire the full runtime and drive it from stdin.
//!
//! This is the reference channel adapter: stdin lines become Inbound events
//! for one session, outbound events print to stdout. Real deployments hang
//! their own channel adapters off the same bus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};

use yoctoclaw::bus::{DeliveryStatus, Event, EventBus, EventKind, EventPayload};
use yoctoclaw::config::Config;
use yoctoclaw::dispatcher::Dispatcher;
use yoctoclaw::providers::{EchoProvider, ProviderAdapter};
use yoctoclaw::scheduler::{CronTrigger, HeartbeatTrigger};
use yoctoclaw::session::SessionStore;
use yoctoclaw::skills::{builtin_manifests, HelloCommand, SkillLoader, SkillRegistry};

/// Session key for messages typed on stdin.
const STDIN_SESSION: &str = "cli:stdin";

pub async fn cmd_run(data_dir: Option<PathBuf>) -> Result<()> {
    let mut config = Config::load().context("loading configuration")?;
    if let Some(dir) = data_dir {
        config.storage.data_dir = Some(dir.to_string_lossy().to_string());
    }

    let bus = EventBus::with_buffer_size(config.bus.buffer_size)
        .with_enqueue_wait(Duration::from_millis(config.bus.enqueue_wait_ms))
        .with_journal(config.journal_path());
    let store = SessionStore::with_path(config.sessions_dir())?;
    let registry = Arc::new(build_registry(&config)?);
    let provider = resolve_provider(&config)?;
    info!(
        provider = provider.name(),
        commands = registry.len(),
        "Starting runtime"
    );

    let dispatcher = Dispatcher::new(&config, store, Arc::clone(&registry), provider, bus.clone());
    dispatcher.start().await?;

    // Outbound printer: the receive side of the stdin channel. It acks what
    // it prints, so delivered replies are not replayed on the next start.
    // Subscribed before the journal replay so an undelivered reply from the
    // previous run still reaches the terminal.
    let (printer_id, mut outbound_rx) = bus.subscribe(&[EventKind::Outbound]).await;
    let printer_bus = bus.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let event_id = event.id.clone();
            if let EventPayload::Outbound { text, status } = event.payload {
                match status {
                    DeliveryStatus::Ok => println!("{}", text),
                    DeliveryStatus::Error => eprintln!("error: {}", text),
                    DeliveryStatus::Cancelled => println!("{}", text),
                }
            }
            if let Err(e) = printer_bus.ack(&event_id).await {
                warn!(error = %e, "Failed to ack outbound event");
            }
        }
    });

    // Re-publish events that were in flight when the previous process died.
    // The session store dedups by event id, so redelivery is idempotent.
    let inflight = bus.replay().await?;
    if !inflight.is_empty() {
        info!(count = inflight.len(), "Replaying journaled events");
        for event in inflight {
            if let Err(e) = bus.publish(event).await {
                warn!(error = %e, "Failed to replay journaled event");
            }
        }
    }

    let bus_handle = Arc::new(bus.clone());
    let cron = CronTrigger::new(
        &config.scheduler.cron,
        Arc::clone(&bus_handle),
        Some(config.cron_state_path()),
    )?;
    cron.start().await?;
    let heartbeat = HeartbeatTrigger::new(
        Arc::clone(&bus_handle),
        config.scheduler.heartbeat_interval_secs,
    );
    heartbeat.start().await?;

    println!("yoctoclaw ready — type a message, /hello <name>, /cancel, or /quit");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }
                let event = if text == "/cancel" {
                    Event::cancel(STDIN_SESSION)
                } else {
                    Event::inbound(STDIN_SESSION, text)
                };
                if let Err(e) = bus.publish(event).await {
                    error!(error = %e, "Input not accepted, try again");
                }
            }
        }
    }

    info!("Shutting down");
    heartbeat.stop().await;
    cron.stop().await;
    dispatcher.stop().await;
    bus.unsubscribe(printer_id).await;
    printer.abort();
    Ok(())
}

/// Builtin skills plus everything under the configured skills directory.
fn build_registry(config: &Config) -> Result<SkillRegistry> {
    let mut manifests = builtin_manifests();
    manifests.extend(SkillLoader::new(config.skills_dir()).load_all()?);
    let mut registry = SkillRegistry::load(manifests)?;
    registry.bind("hello", Arc::new(HelloCommand))?;
    Ok(registry.with_invoke_timeout(Duration::from_secs(config.runtime.tool_timeout_secs)))
}

fn resolve_provider(config: &Config) -> Result<Arc<dyn ProviderAdapter>> {
    match config.runtime.provider.as_str() {
        "echo" => Ok(Arc::new(EchoProvider)),
        other => bail!("unknown provider '{}' (builtin: echo)", other),
    }
}
