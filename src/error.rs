//! Error types for YoctoClaw
//!
//! This module defines all error types used throughout the runtime core.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Provider Error Classification
// ============================================================================

/// Typed provider failure classification.
///
/// Providers surface failures through these variants so that the dispatcher's
/// retry policy can distinguish retryable from fatal errors without string
/// matching. The type is serializable because it travels inside
/// `ProviderResult` events on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ProviderError {
    /// 429-class: rate limit or quota exceeded, retry with backoff
    RateLimited(String),
    /// Connection or read timeout, retry with backoff
    Timeout(String),
    /// Backend temporarily down or overloaded, retry with backoff
    Unavailable(String),
    /// Malformed request; retrying the same payload cannot succeed
    InvalidRequest(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "timeout: {}", msg),
            ProviderError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            ProviderError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
        }
    }
}

impl ProviderError {
    /// Returns `true` if this error is transient and the step should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Timeout(_)
                | ProviderError::Unavailable(_)
        )
    }
}

impl From<ProviderError> for YoctoError {
    fn from(err: ProviderError) -> Self {
        YoctoError::Provider(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for YoctoClaw operations.
#[derive(Error, Debug)]
pub enum YoctoError {
    /// Configuration-related errors (invalid config, bad cron expression, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Typed provider error with classification for retry decisions
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// Session state errors (invariant violations, persistence failures, etc.)
    #[error("Session error: {0}")]
    Session(String),

    /// Skill/command registry errors (duplicate commands, parse failures, etc.)
    #[error("Skill error: {0}")]
    Skill(String),

    /// A subscriber queue stayed full past the bounded enqueue wait.
    /// The caller decides whether to retry or discard.
    #[error("Bus error: subscriber queue full")]
    Backpressure,

    /// Event bus channel closed unexpectedly
    #[error("Bus error: channel closed")]
    BusClosed,

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for YoctoClaw operations.
pub type Result<T> = std::result::Result<T, YoctoError>;
