//! Configuration type definitions.
//!
//! Every section derives `Default` and deserializes with `#[serde(default)]`
//! so a partial config file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration, passed down explicitly to the components that need
/// it rather than held in a global.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
    pub skills: SkillsConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Dispatcher behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Provider to wire in `run` ("echo" is the builtin loopback)
    pub provider: String,
    /// Maximum attempts a step may make before its owning turn fails
    pub max_step_retries: u32,
    /// Backoff between step retries
    pub backoff: BackoffConfig,
    /// A turn awaiting a result longer than this is force-failed by the
    /// next heartbeat tick
    pub stale_turn_secs: u64,
    /// Wall-clock budget for one command invocation
    pub tool_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider: "echo".to_string(),
            max_step_retries: 3,
            backoff: BackoffConfig::default(),
            stale_turn_secs: 120,
            tool_timeout_secs: 30,
        }
    }
}

/// Retry backoff shape. Which one fits is workload-dependent, so it is
/// configuration rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    /// Same delay every retry
    Fixed,
    /// base × 2^(attempt-1), capped at `max_delay_ms`
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub mode: BackoffMode,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            mode: BackoffMode::Exponential,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (1-indexed). Attempt 0 is the first
    /// dispatch and never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = match self.mode {
            BackoffMode::Fixed => self.base_delay_ms,
            BackoffMode::Exponential => self
                .base_delay_ms
                .saturating_mul(1u64 << (attempt - 1).min(16))
                .min(self.max_delay_ms),
        };
        Duration::from_millis(ms)
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Subscriber queue capacity
    pub buffer_size: usize,
    /// Bounded wait `publish` spends on a full queue before reporting
    /// backpressure
    pub enqueue_wait_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: 128,
            enqueue_wait_ms: 250,
        }
    }
}

/// Timer producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Liveness tick interval
    pub heartbeat_interval_secs: u64,
    /// Recurring jobs
    pub cron: Vec<CronEntryConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            cron: Vec::new(),
        }
    }
}

/// One configured cron entry. The expression is validated when the trigger
/// is built, before the loop ever starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntryConfig {
    /// Stable name, used as the state-file key
    pub name: String,
    /// Standard 5-field expression: minute hour day-of-month month weekday
    pub expr: String,
    /// Target session; `None` publishes a global timer event
    #[serde(default)]
    pub session_key: Option<String>,
    /// Text injected as a silent user turn when the entry fires
    pub payload: String,
}

/// Skill discovery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    /// Skills directory; defaults to `<config dir>/skills`
    pub dir: Option<String>,
}

/// Where durable state lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; defaults to the config directory
    pub data_dir: Option<String>,
}

impl StorageConfig {
    /// Resolve the data directory against a default root.
    pub fn data_dir_or(&self, default_root: PathBuf) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or(default_root)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable text
    Pretty,
    /// Structured JSON lines for log aggregators
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runtime.max_step_retries, 3);
        assert_eq!(config.runtime.provider, "echo");
        assert_eq!(config.bus.buffer_size, 128);
        assert_eq!(config.scheduler.heartbeat_interval_secs, 15);
        assert!(config.scheduler.cron.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"runtime":{"max_step_retries":5}}"#).unwrap();
        assert_eq!(config.runtime.max_step_retries, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.runtime.stale_turn_secs, 120);
        assert_eq!(config.bus.buffer_size, 128);
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffConfig {
            mode: BackoffMode::Fixed,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
        };
        assert_eq!(backoff.delay_for(0), Duration::ZERO);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffConfig {
            mode: BackoffMode::Exponential,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(2_000));
        // Capped by max_delay_ms.
        assert_eq!(backoff.delay_for(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_mode_serde() {
        let json = serde_json::to_string(&BackoffMode::Exponential).unwrap();
        assert_eq!(json, r#""exponential""#);
        let back: BackoffMode = serde_json::from_str(r#""fixed""#).unwrap();
        assert_eq!(back, BackoffMode::Fixed);
    }

    #[test]
    fn test_cron_entry_deserialization() {
        let entry: CronEntryConfig = serde_json::from_str(
            r#"{"name":"digest","expr":"0 9 * * *","session_key":"cli:stdin","payload":"morning digest"}"#,
        )
        .unwrap();
        assert_eq!(entry.name, "digest");
        assert_eq!(entry.session_key.as_deref(), Some("cli:stdin"));
    }

    #[test]
    fn test_storage_data_dir_resolution() {
        let storage = StorageConfig::default();
        assert_eq!(
            storage.data_dir_or(PathBuf::from("/tmp/x")),
            PathBuf::from("/tmp/x")
        );

        let storage = StorageConfig {
            data_dir: Some("/var/lib/yocto".into()),
        };
        assert_eq!(
            storage.data_dir_or(PathBuf::from("/tmp/x")),
            PathBuf::from("/var/lib/yocto")
        );
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let _back: Config = serde_json::from_str(&json).unwrap();
    }
}
