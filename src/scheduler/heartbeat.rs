//! Heartbeat trigger: fixed-interval liveness Timer events.
//!
//! The heartbeat carries no session key. The dispatcher uses it to detect
//! staleness: a turn stuck awaiting a provider or tool past the configured
//! timeout is force-failed on the next tick. Heartbeat events are volatile;
//! a missed tick is simply replaced by the next one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bus::{Event, EventBus, TimerSource};
use crate::error::Result;

/// Consecutive publish failures before the trigger logs a degradation warning.
const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Background service publishing liveness ticks.
pub struct HeartbeatTrigger {
    interval: Duration,
    bus: Arc<EventBus>,
    running: Arc<RwLock<bool>>,
    consecutive_failures: Arc<AtomicU32>,
}

impl HeartbeatTrigger {
    /// Create a trigger firing every `interval_secs` (clamped to >= 1s).
    pub fn new(bus: Arc<EventBus>, interval_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            bus,
            running: Arc::new(RwLock::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Start the tick loop in the background (idempotent).
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Heartbeat trigger already running");
                return Ok(());
            }
            *running = true;
        }

        let interval = self.interval;
        let bus = Arc::clone(&self.bus);
        let running = Arc::clone(&self.running);
        let failures = Arc::clone(&self.consecutive_failures);

        info!(interval_secs = interval.as_secs(), "Heartbeat trigger started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; consume it so the first
            // real beat lands one full interval from now.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if !*running.read().await {
                    info!("Heartbeat trigger stopped");
                    break;
                }

                match bus.try_publish(Event::timer(None, TimerSource::Heartbeat)).await {
                    Ok(()) => {
                        failures.store(0, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                        if count >= FAILURE_ALERT_THRESHOLD {
                            warn!(
                                consecutive_failures = count,
                                error = %e,
                                "Heartbeat publishes failing, liveness checks degraded"
                            );
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop the tick loop.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Publish one heartbeat immediately, outside the schedule.
    pub async fn trigger_now(&self) -> Result<()> {
        self.bus
            .try_publish(Event::timer(None, TimerSource::Heartbeat))
            .await
    }

    /// Whether the loop is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Count of consecutive failed publishes.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Healthy while failures stay below the alert threshold.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures() < FAILURE_ALERT_THRESHOLD
    }
}
