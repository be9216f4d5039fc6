//! Configuration management for YoctoClaw
//!
//! Configuration loads from `~/.yoctoclaw/config.json` with environment
//! variable overrides (`YOCTOCLAW_SECTION_KEY`). The loaded `Config` is an
//! explicitly constructed value handed down to components, not an ambient
//! global.

mod types;

pub use types::*;

use std::path::{Path, PathBuf};

use crate::error::{Result, YoctoError};
use crate::scheduler::cron::CronExpr;

impl Config {
    /// The YoctoClaw configuration directory (`~/.yoctoclaw`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".yoctoclaw")
    }

    /// Path to the config file (`~/.yoctoclaw/config.json`).
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path with environment overrides. A missing
    /// file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Persist to a specific path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the runtime could not honor: malformed cron
    /// expressions fail here, at load time, never at fire time.
    pub fn validate(&self) -> Result<()> {
        for entry in &self.scheduler.cron {
            CronExpr::parse(&entry.expr).map_err(|e| {
                YoctoError::Config(format!("cron entry '{}': {}", entry.name, e))
            })?;
        }
        if self.runtime.provider.trim().is_empty() {
            return Err(YoctoError::Config("runtime.provider is empty".into()));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("YOCTOCLAW_RUNTIME_PROVIDER") {
            self.runtime.provider = val;
        }
        if let Ok(val) = std::env::var("YOCTOCLAW_RUNTIME_MAX_STEP_RETRIES") {
            if let Ok(v) = val.parse() {
                self.runtime.max_step_retries = v;
            }
        }
        if let Ok(val) = std::env::var("YOCTOCLAW_RUNTIME_STALE_TURN_SECS") {
            if let Ok(v) = val.parse() {
                self.runtime.stale_turn_secs = v;
            }
        }
        if let Ok(val) = std::env::var("YOCTOCLAW_SCHEDULER_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                self.scheduler.heartbeat_interval_secs = v;
            }
        }
        if let Ok(val) = std::env::var("YOCTOCLAW_STORAGE_DATA_DIR") {
            self.storage.data_dir = Some(val);
        }
        if let Ok(val) = std::env::var("YOCTOCLAW_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Sessions directory under the resolved data dir.
    pub fn sessions_dir(&self) -> PathBuf {
        self.storage.data_dir_or(Self::dir()).join("sessions")
    }

    /// Event journal path under the resolved data dir.
    pub fn journal_path(&self) -> PathBuf {
        self.storage.data_dir_or(Self::dir()).join("journal.jsonl")
    }

    /// Cron state path under the resolved data dir.
    pub fn cron_state_path(&self) -> PathBuf {
        self.storage.data_dir_or(Self::dir()).join("cron.json")
    }

    /// Skills directory: configured, or `<config dir>/skills`.
    pub fn skills_dir(&self) -> PathBuf {
        self.skills
            .dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::dir().join("skills"))
    }
}
