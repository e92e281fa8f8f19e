//! Error taxonomy and retry policy for the download subsystem
//!
//! Fetch errors are split into transient and permanent variants: transient
//! errors are retried by the download task a bounded number of times with
//! exponential backoff and jitter, permanent errors fail the attempt
//! immediately. Persistence errors are classified the same way but never
//! escalate into the download's own terminal state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::DownloadState;

/// Default base delay for exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(30);

/// Fine-grained classification of fetch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchErrorKind {
    /// DNS, connection, timeout
    Network,
    /// Upstream asked us to slow down (HTTP 429)
    RateLimited,
    /// Platform quota exhausted
    QuotaExceeded,
    /// Other upstream HTTP failure
    Http,
    /// Video id does not exist
    InvalidVideoId,
    /// Video existed but has been removed
    VideoRemoved,
    /// Authentication or permission failure
    PermissionDenied,
    /// Local disk write failure
    Disk,
}

/// A categorized fetch failure with retry classification baked in
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum FetchError {
    #[error("transient fetch error ({kind:?}): {message}")]
    Transient { kind: FetchErrorKind, message: String },

    #[error("permanent fetch error ({kind:?}): {message}")]
    Permanent { kind: FetchErrorKind, message: String },
}

impl FetchError {
    /// Whether the download task should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Transient { kind, .. } | Self::Permanent { kind, .. } => *kind,
        }
    }
}

/// Persistence-layer failure, isolated to the updater
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum PersistenceError {
    #[error("transient persistence error: {message}")]
    Transient { message: String },

    #[error("permanent persistence error: {message}")]
    Permanent { message: String },
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        // Disk and network filesystems mostly fail transiently; a retry with
        // backoff is the right default for the record store.
        Self::Transient {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent {
            message: format!("record serialization failed: {}", err),
        }
    }
}

/// Programming-contract violations on a progress signal.
///
/// These are internal assertions: `AlreadyTerminal` in particular is expected
/// under a cancel/complete race and is surfaced as a warning, not a failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum SignalError {
    #[error("invalid transition: {operation} called in state {from:?}")]
    InvalidTransition {
        from: DownloadState,
        operation: &'static str,
    },

    #[error("signal already reached a terminal state")]
    AlreadyTerminal,
}

/// Retry strategy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before the given attempt number (1-based; attempt 1 is
    /// the first retry). Exponential with jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay_ms = self.base_delay.as_millis() as f64 * exp;

        if delay_ms > self.max_delay.as_millis() as f64 {
            delay_ms = self.max_delay.as_millis() as f64;
        }

        if self.jitter_factor > 0.0 {
            let jitter = delay_ms * self.jitter_factor * (rand::random::<f64>() - 0.5);
            delay_ms = (delay_ms + jitter).max(0.0);
        }

        Duration::from_millis(delay_ms as u64)
    }
}

/// Convenience constructors for common error shapes
pub mod errors {
    use super::*;

    pub fn transient_network(message: impl Into<String>) -> FetchError {
        FetchError::Transient {
            kind: FetchErrorKind::Network,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> FetchError {
        FetchError::Transient {
            kind: FetchErrorKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn quota_exceeded(message: impl Into<String>) -> FetchError {
        FetchError::Permanent {
            kind: FetchErrorKind::QuotaExceeded,
            message: message.into(),
        }
    }

    pub fn invalid_video_id(video_id: &str) -> FetchError {
        FetchError::Permanent {
            kind: FetchErrorKind::InvalidVideoId,
            message: format!("no such video: {}", video_id),
        }
    }

    pub fn video_removed(video_id: &str) -> FetchError {
        FetchError::Permanent {
            kind: FetchErrorKind::VideoRemoved,
            message: format!("video has been removed: {}", video_id),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> FetchError {
        FetchError::Permanent {
            kind: FetchErrorKind::PermissionDenied,
            message: message.into(),
        }
    }

    pub fn disk_error(message: impl Into<String>) -> FetchError {
        FetchError::Permanent {
            kind: FetchErrorKind::Disk,
            message: message.into(),
        }
    }

    pub fn upstream_http(status: u16, retryable: bool) -> FetchError {
        let message = format!("upstream returned HTTP {}", status);
        if retryable {
            FetchError::Transient {
                kind: FetchErrorKind::Http,
                message,
            }
        } else {
            FetchError::Permanent {
                kind: FetchErrorKind::Http,
                message,
            }
        }
    }
}
