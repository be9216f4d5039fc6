//! Scheduler module - the two timer-driven producers.
//!
//! Both publish Timer events onto the bus: [`cron::CronTrigger`] for
//! schedule-expression recurring jobs, [`heartbeat::HeartbeatTrigger`] for
//! fixed-interval liveness ticks.

pub mod cron;
pub mod heartbeat;

pub use cron::{CronExpr, CronJobView, CronTrigger};
pub use heartbeat::HeartbeatTrigger;
