//! Core data models for the download orchestration subsystem

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error_handling::FetchError;

/// Lifecycle state of a single download attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadState {
    Queued,

    Running,

    Succeeded,

    Failed,

    Cancelled,
}

impl DownloadState {
    /// Whether this state is terminal (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Scheduling hint attached to a submission. Recorded and surfaced on the
/// snapshot; admission order stays FIFO.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadPriority {
    Low,

    #[default]
    Normal,

    High,
}

/// Durable record for a catalog video, owned by the persistence layer.
///
/// The orchestration core only holds the `video_id` while an attempt is in
/// flight and writes an updated copy back through the record store when the
/// attempt reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub video_id: String,

    pub downloaded: bool,

    pub downloaded_at: Option<chrono::DateTime<chrono::Utc>>,

    pub local_path: Option<PathBuf>,

    pub last_error: Option<String>,

    /// Opaque platform metadata blob, stored as-is
    pub metadata: serde_json::Value,
}

impl VideoRecord {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            downloaded: false,
            downloaded_at: None,
            local_path: None,
            last_error: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Metadata returned by the catalog client before streaming begins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub video_id: String,

    pub title: Option<String>,

    /// Container/extension hint, e.g. "mp4"
    pub container: Option<String>,

    /// Total size in bytes when the catalog reports it up front
    pub size_hint: Option<u64>,

    /// Raw platform response, passed through to the video record
    pub raw: serde_json::Value,
}

/// What a successful download produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadArtifact {
    pub local_path: PathBuf,

    pub size_bytes: u64,

    pub checksum_sha256: Option<String>,
}

/// Terminal result of a download attempt, handed to the persistence updater
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Succeeded {
        artifact: DownloadArtifact,
        metadata: serde_json::Value,
    },
    Failed {
        error: FetchError,
    },
}

/// Snapshot of a progress signal at a point in time.
///
/// Exactly one signal exists per accepted download attempt; retries of the
/// same video create new signals with fresh attempt ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub video_id: String,

    pub attempt_id: Uuid,

    pub state: DownloadState,

    /// Fraction complete in [0, 1], non-decreasing while Running
    pub fraction_complete: f64,

    /// Present iff `state == Failed`
    pub error: Option<FetchError>,

    /// Present iff `state == Succeeded`
    pub artifact: Option<DownloadArtifact>,

    pub priority: DownloadPriority,

    pub started_at: chrono::DateTime<chrono::Utc>,

    /// Set exactly once, when a terminal state is reached
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Callback invoked with a snapshot on every signal transition
pub type Listener = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Options recognized by `DownloadCoordinator::submit`
#[derive(Clone, Default)]
pub struct SubmitOptions {
    /// Block the submit call until the attempt reaches a terminal state
    pub wait_for_completion: bool,

    /// Extra listener attached to the attempt's signal
    pub on_progress: Option<Listener>,

    pub priority: DownloadPriority,
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("wait_for_completion", &self.wait_for_completion)
            .field("on_progress", &self.on_progress.is_some())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Download configuration shared by the coordinator and its tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub concurrent_downloads: usize,

    pub fetch_retry_attempts: u32,

    pub retry_base_delay_ms: u64,

    pub retry_max_delay_ms: u64,

    pub timeout_seconds: u64,

    pub user_agent: String,

    pub headers: HashMap<String, String>,

    pub output_directory: PathBuf,

    /// Compute a SHA-256 checksum while streaming to disk
    pub compute_checksum: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: 3,

            fetch_retry_attempts: 3,

            retry_base_delay_ms: 500,

            retry_max_delay_ms: 30_000,

            timeout_seconds: 30,

            user_agent: format!("subvault/{}", env!("CARGO_PKG_VERSION")),

            headers: HashMap::new(),

            output_directory: PathBuf::from("downloads"),

            compute_checksum: true,
        }
    }
}

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crate::core::error_handling::FetchError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::core::error_handling::PersistenceError),

    #[error("Signal error: {0}")]
    Signal(#[from] crate::core::error_handling::SignalError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
