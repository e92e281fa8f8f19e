//! Durable record store and the asynchronous persistence updater
//!
//! The updater is the only component that writes download outcomes back to
//! the record store. It lives off the download path: a persistence failure
//! is retried with backoff, then reported to the error sink, and never
//! escalates into the download attempt's own terminal state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::error_handling::{PersistenceError, RetryPolicy};
use crate::core::models::{DownloadOutcome, VideoRecord};

/// Narrow interface to the durable storage layer
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, video_id: &str) -> Result<Option<VideoRecord>, PersistenceError>;

    async fn save(&self, record: VideoRecord) -> Result<(), PersistenceError>;
}

/// Record store backed by a single JSON document on disk.
///
/// Process-scoped state with explicit initialization: open once at startup
/// and inject where needed. Reads are served from the in-memory map; every
/// save rewrites the document.
pub struct JsonRecordStore {
    path: PathBuf,
    records: Mutex<HashMap<String, VideoRecord>>,
}

impl JsonRecordStore {
    /// Open (or create) the record document at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), "opened record store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn flush(&self, records: &HashMap<String, VideoRecord>) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn load(&self, video_id: &str) -> Result<Option<VideoRecord>, PersistenceError> {
        Ok(self.records.lock().await.get(video_id).cloned())
    }

    async fn save(&self, record: VideoRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.lock().await;
        records.insert(record.video_id.clone(), record);
        self.flush(&records).await
    }
}

/// A persistence failure that exhausted its retries, delivered to the sink
#[derive(Debug, Clone)]
pub struct PersistenceFault {
    pub video_id: String,
    pub attempt_id: Uuid,
    pub error: PersistenceError,
}

/// How many applied attempt ids are remembered for duplicate detection
const APPLIED_ATTEMPT_CAPACITY: usize = 1024;

/// Insertion-ordered set of applied attempt ids, pruned oldest-first once
/// it exceeds `APPLIED_ATTEMPT_CAPACITY`
#[derive(Default)]
struct AppliedAttempts {
    order: VecDeque<Uuid>,
    set: HashSet<Uuid>,
}

impl AppliedAttempts {
    fn contains(&self, attempt_id: &Uuid) -> bool {
        self.set.contains(attempt_id)
    }

    fn insert(&mut self, attempt_id: Uuid) {
        if self.set.insert(attempt_id) {
            self.order.push_back(attempt_id);
            while self.order.len() > APPLIED_ATTEMPT_CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.set.remove(&oldest);
                }
            }
        }
    }
}

/// Applies terminal download outcomes to the durable video record.
///
/// Writes are applied at most once per (video id, attempt id): duplicate
/// `apply` calls for an already-applied attempt are detected and skipped.
/// The applied set remembers the most recent attempts only, which covers
/// the duplicate window (an attempt's own task is the only caller) without
/// growing for the life of the process.
pub struct PersistenceUpdater {
    store: std::sync::Arc<dyn RecordStore>,
    policy: RetryPolicy,
    applied: Mutex<AppliedAttempts>,
    error_sink: Option<mpsc::UnboundedSender<PersistenceFault>>,
}

impl PersistenceUpdater {
    pub fn new(store: std::sync::Arc<dyn RecordStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            applied: Mutex::new(AppliedAttempts::default()),
            error_sink: None,
        }
    }

    /// Route permanently-failed updates to the given channel instead of
    /// only the log
    pub fn with_error_sink(mut self, sink: mpsc::UnboundedSender<PersistenceFault>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Apply a terminal outcome to the video's durable record.
    ///
    /// Never returns an error into the download path: transient store
    /// failures are retried with backoff, permanent ones are reported to
    /// the error sink.
    pub async fn apply(&self, video_id: &str, attempt_id: Uuid, outcome: &DownloadOutcome) {
        {
            let applied = self.applied.lock().await;
            if applied.contains(&attempt_id) {
                debug!(video_id, %attempt_id, "outcome already applied, skipping");
                return;
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.apply_once(video_id, outcome).await {
                Ok(()) => {
                    self.applied.lock().await.insert(attempt_id);
                    debug!(video_id, %attempt_id, "persisted download outcome");
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        video_id,
                        attempt,
                        error = %e,
                        "transient persistence failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(video_id, %attempt_id, error = %e, "failed to persist download outcome");
                    if let Some(sink) = &self.error_sink {
                        let _ = sink.send(PersistenceFault {
                            video_id: video_id.to_string(),
                            attempt_id,
                            error: e,
                        });
                    }
                    return;
                }
            }
        }
    }

    async fn apply_once(
        &self,
        video_id: &str,
        outcome: &DownloadOutcome,
    ) -> Result<(), PersistenceError> {
        let mut record = self
            .store
            .load(video_id)
            .await?
            .unwrap_or_else(|| VideoRecord::new(video_id));

        match outcome {
            DownloadOutcome::Succeeded { artifact, metadata } => {
                record.downloaded = true;
                record.downloaded_at = Some(chrono::Utc::now());
                record.local_path = Some(artifact.local_path.clone());
                record.last_error = None;
                if !metadata.is_null() {
                    record.metadata = metadata.clone();
                }
            }
            DownloadOutcome::Failed { error } => {
                record.last_error = Some(error.to_string());
            }
        }

        self.store.save(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error_handling::errors;
    use crate::core::models::DownloadArtifact;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn outcome_success() -> DownloadOutcome {
        DownloadOutcome::Succeeded {
            artifact: DownloadArtifact {
                local_path: PathBuf::from("/tmp/abc123.mp4"),
                size_bytes: 2048,
                checksum_sha256: Some("deadbeef".to_string()),
            },
            metadata: serde_json::json!({"title": "a video"}),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    /// Store that fails transiently for the first N saves
    struct FlakyStore {
        inner: JsonRecordStore,
        failures_left: AtomicU32,
        save_count: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn load(&self, video_id: &str) -> Result<Option<VideoRecord>, PersistenceError> {
            self.inner.load(video_id).await
        }

        async fn save(&self, record: VideoRecord) -> Result<(), PersistenceError> {
            self.save_count.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(PersistenceError::Transient {
                    message: "connection lost".to_string(),
                });
            }
            self.inner.save(record).await
        }
    }

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        {
            let store = JsonRecordStore::open(&path).await.unwrap();
            let mut record = VideoRecord::new("abc123");
            record.downloaded = true;
            store.save(record).await.unwrap();
        }

        // Reopen and read back
        let store = JsonRecordStore::open(&path).await.unwrap();
        let loaded = store.load("abc123").await.unwrap().unwrap();
        assert!(loaded.downloaded);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_success_sets_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonRecordStore::open(dir.path().join("records.json"))
                .await
                .unwrap(),
        );
        let updater = PersistenceUpdater::new(store.clone(), fast_policy());

        updater
            .apply("abc123", Uuid::new_v4(), &outcome_success())
            .await;

        let record = store.load("abc123").await.unwrap().unwrap();
        assert!(record.downloaded);
        assert!(record.downloaded_at.is_some());
        assert_eq!(record.local_path, Some(PathBuf::from("/tmp/abc123.mp4")));
        assert!(record.last_error.is_none());
        assert_eq!(record.metadata["title"], "a video");
    }

    #[tokio::test]
    async fn test_apply_failure_records_error_without_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonRecordStore::open(dir.path().join("records.json"))
                .await
                .unwrap(),
        );
        let updater = PersistenceUpdater::new(store.clone(), fast_policy());

        let outcome = DownloadOutcome::Failed {
            error: errors::video_removed("xyz999"),
        };
        updater.apply("xyz999", Uuid::new_v4(), &outcome).await;

        let record = store.load("xyz999").await.unwrap().unwrap();
        assert!(!record.downloaded);
        assert!(record.last_error.unwrap().contains("removed"));
    }

    #[tokio::test]
    async fn test_duplicate_apply_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let inner = JsonRecordStore::open(dir.path().join("records.json"))
            .await
            .unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures_left: AtomicU32::new(0),
            save_count: AtomicU32::new(0),
        });
        let updater = PersistenceUpdater::new(store.clone(), fast_policy());

        let attempt_id = Uuid::new_v4();
        updater.apply("abc123", attempt_id, &outcome_success()).await;
        updater.apply("abc123", attempt_id, &outcome_success()).await;

        assert_eq!(store.save_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let inner = JsonRecordStore::open(dir.path().join("records.json"))
            .await
            .unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures_left: AtomicU32::new(2),
            save_count: AtomicU32::new(0),
        });
        let updater = PersistenceUpdater::new(store.clone(), fast_policy());

        updater
            .apply("abc123", Uuid::new_v4(), &outcome_success())
            .await;

        assert_eq!(store.save_count.load(Ordering::SeqCst), 3);
        let record = store.load("abc123").await.unwrap().unwrap();
        assert!(record.downloaded);
    }

    /// Store keeping records in memory only, for high-volume tests
    #[derive(Default)]
    struct MemStore {
        records: parking_lot::Mutex<HashMap<String, VideoRecord>>,
    }

    #[async_trait]
    impl RecordStore for MemStore {
        async fn load(&self, video_id: &str) -> Result<Option<VideoRecord>, PersistenceError> {
            Ok(self.records.lock().get(video_id).cloned())
        }

        async fn save(&self, record: VideoRecord) -> Result<(), PersistenceError> {
            self.records.lock().insert(record.video_id.clone(), record);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_applied_attempts_are_pruned() {
        let store = Arc::new(MemStore::default());
        let updater = PersistenceUpdater::new(store, fast_policy());

        let first = Uuid::new_v4();
        updater.apply("abc123", first, &outcome_success()).await;

        for _ in 0..APPLIED_ATTEMPT_CAPACITY {
            updater
                .apply("abc123", Uuid::new_v4(), &outcome_success())
                .await;
        }

        let applied = updater.applied.lock().await;
        assert_eq!(applied.order.len(), APPLIED_ATTEMPT_CAPACITY);
        assert_eq!(applied.set.len(), APPLIED_ATTEMPT_CAPACITY);
        assert!(!applied.contains(&first), "oldest attempt must be evicted");
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let inner = JsonRecordStore::open(dir.path().join("records.json"))
            .await
            .unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures_left: AtomicU32::new(100),
            save_count: AtomicU32::new(0),
        });

        let (sink, mut faults) = mpsc::unbounded_channel();
        let updater =
            PersistenceUpdater::new(store.clone(), fast_policy()).with_error_sink(sink);

        let attempt_id = Uuid::new_v4();
        updater.apply("abc123", attempt_id, &outcome_success()).await;

        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.video_id, "abc123");
        assert_eq!(fault.attempt_id, attempt_id);
        assert!(store.load("abc123").await.unwrap().is_none());
    }
}
