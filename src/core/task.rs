//! Download task execution
//!
//! One `DownloadTask` owns one video's retrieval: it drives the catalog
//! fetch, streams bytes to disk, feeds the progress signal, and on a
//! terminal state hands the outcome to the persistence updater. Each task
//! runs on its own tokio task, so the submitting request path never blocks
//! on the download itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::core::catalog::VideoCatalogClient;
use crate::core::error_handling::{errors, FetchError, RetryPolicy};
use crate::core::models::{DownloadArtifact, DownloadConfig, DownloadOutcome};
use crate::core::persistence::PersistenceUpdater;
use crate::core::progress::ProgressSignal;

/// Advisory cancellation token, polled cooperatively between chunks and at
/// suspension points. No in-progress I/O is forcibly terminated.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

enum AttemptError {
    Fetch(FetchError),
    Cancelled,
}

impl From<FetchError> for AttemptError {
    fn from(err: FetchError) -> Self {
        Self::Fetch(err)
    }
}

/// A single video's download, bound to its progress signal
pub(crate) struct DownloadTask {
    signal: Arc<ProgressSignal>,
    cancel: CancelToken,
    catalog: Arc<dyn VideoCatalogClient>,
    updater: Arc<PersistenceUpdater>,
    config: DownloadConfig,
}

impl DownloadTask {
    pub(crate) fn new(
        signal: Arc<ProgressSignal>,
        cancel: CancelToken,
        catalog: Arc<dyn VideoCatalogClient>,
        updater: Arc<PersistenceUpdater>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            signal,
            cancel,
            catalog,
            updater,
            config,
        }
    }

    /// Drive the attempt to a terminal state. Waits for an admission permit
    /// while still `Queued`, then fetches with bounded retries for transient
    /// errors, and finally triggers the persistence update for succeeded and
    /// failed attempts (cancelled attempts skip persistence).
    pub(crate) async fn run(self, semaphore: Arc<Semaphore>) {
        let video_id = self.signal.video_id();
        let attempt_id = self.signal.attempt_id();

        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed during shutdown
                    self.signal.cancel();
                    return;
                }
            },
            _ = self.cancel.cancelled() => {
                info!(video_id, "download cancelled while queued");
                self.signal.cancel();
                return;
            }
        };

        if self.signal.start().is_err() {
            // Cancelled between admission and start
            return;
        }
        info!(video_id, %attempt_id, "download started");

        let policy = RetryPolicy {
            max_attempts: self.config.fetch_retry_attempts.max(1),
            base_delay: std::time::Duration::from_millis(self.config.retry_base_delay_ms),
            max_delay: std::time::Duration::from_millis(self.config.retry_max_delay_ms),
            ..Default::default()
        };

        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            match self.run_attempt(&video_id).await {
                Ok((artifact, metadata)) => {
                    if self.signal.complete(artifact.clone()) {
                        info!(
                            video_id,
                            size_bytes = artifact.size_bytes,
                            path = %artifact.local_path.display(),
                            "download succeeded"
                        );
                        break Some(DownloadOutcome::Succeeded { artifact, metadata });
                    }
                    // Lost the race against a cancellation
                    break None;
                }
                Err(AttemptError::Cancelled) => {
                    info!(video_id, "download cancelled");
                    self.signal.cancel();
                    break None;
                }
                Err(AttemptError::Fetch(e)) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        video_id,
                        attempt,
                        error = %e,
                        "transient fetch failure, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            self.signal.cancel();
                            break None;
                        }
                    }
                }
                Err(AttemptError::Fetch(e)) => {
                    warn!(video_id, error = %e, "download failed");
                    if self.signal.fail(e.clone()) {
                        break Some(DownloadOutcome::Failed { error: e });
                    }
                    break None;
                }
            }
        };

        // Persistence runs after the terminal transition; its failure never
        // reverts the signal's terminal state.
        if let Some(outcome) = outcome {
            self.updater.apply(&video_id, attempt_id, &outcome).await;
        }
    }

    async fn run_attempt(
        &self,
        video_id: &str,
    ) -> Result<(DownloadArtifact, serde_json::Value), AttemptError> {
        if self.cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        let metadata = tokio::select! {
            res = self.catalog.fetch_metadata(video_id) => res?,
            _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
        };

        let (mut stream, stream_len) = tokio::select! {
            res = self.catalog.fetch_stream(video_id) => res?,
            _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
        };
        let total_bytes = stream_len.or(metadata.size_hint);

        let container = metadata.container.as_deref().unwrap_or("mp4");
        let local_path = self
            .config
            .output_directory
            .join(format!("{}.{}", video_id, container));

        tokio::fs::create_dir_all(&self.config.output_directory)
            .await
            .map_err(|e| errors::disk_error(format!("creating output directory: {}", e)))?;
        let mut file = tokio::fs::File::create(&local_path)
            .await
            .map_err(|e| errors::disk_error(format!("creating {}: {}", local_path.display(), e)))?;

        let mut hasher = self.config.compute_checksum.then(Sha256::new);
        let mut downloaded: u64 = 0;

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.cancel.cancelled() => {
                    self.discard_partial(&local_path).await;
                    return Err(AttemptError::Cancelled);
                }
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .map_err(|e| errors::disk_error(format!("writing {}: {}", local_path.display(), e)))?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            downloaded += chunk.len() as u64;

            if let Some(total) = total_bytes {
                if total > 0 {
                    let fraction = downloaded as f64 / total as f64;
                    if self.signal.advance(fraction).is_err() {
                        // The signal went terminal under us: a cancel won
                        self.discard_partial(&local_path).await;
                        return Err(AttemptError::Cancelled);
                    }
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| errors::disk_error(format!("flushing {}: {}", local_path.display(), e)))?;

        let checksum_sha256 = hasher.map(|h| hex::encode(h.finalize()));
        Ok((
            DownloadArtifact {
                local_path,
                size_bytes: downloaded,
                checksum_sha256,
            },
            metadata.raw,
        ))
    }

    async fn discard_partial(&self, path: &std::path::Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %e, "could not remove partial file");
        }
    }
}
