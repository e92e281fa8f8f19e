//! Download coordinator: the single entry point for download requests
//!
//! The coordinator owns the in-flight attempt map, the concurrency
//! semaphore, and the shared catalog/persistence handles. Submissions are
//! deduplicated per video id: while an attempt for a video is in flight,
//! further submissions attach to it instead of spawning a second download.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::core::catalog::VideoCatalogClient;
use crate::core::models::{DownloadConfig, Listener, ProgressSnapshot, SubmitOptions};
use crate::core::persistence::PersistenceUpdater;
use crate::core::progress::ProgressSignal;
use crate::core::task::{CancelToken, DownloadTask};

/// Caller-facing handle to one download attempt.
///
/// Cheap to clone; every clone refers to the same attempt. Dropping a handle
/// never cancels the download.
#[derive(Clone)]
pub struct DownloadHandle {
    signal: Arc<ProgressSignal>,
    cancel: CancelToken,
}

impl DownloadHandle {
    fn new(signal: Arc<ProgressSignal>, cancel: CancelToken) -> Self {
        Self { signal, cancel }
    }

    pub fn video_id(&self) -> String {
        self.signal.video_id()
    }

    pub fn attempt_id(&self) -> uuid::Uuid {
        self.signal.attempt_id()
    }

    /// Snapshot of the attempt right now
    pub fn current_progress(&self) -> ProgressSnapshot {
        self.signal.current()
    }

    /// Receiver observing every committed state transition
    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.signal.watch()
    }

    /// Request cooperative cancellation. Returns immediately; the attempt
    /// observes the request at its next check point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the attempt reaches a terminal state, or the timeout
    /// elapses. Always returns a snapshot: on timeout it is simply the
    /// current, possibly non-terminal, one.
    pub async fn await_completion(&self, timeout: Option<Duration>) -> ProgressSnapshot {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.wait_terminal()).await {
                Ok(snapshot) => snapshot,
                Err(_) => self.signal.current(),
            },
            None => self.wait_terminal().await,
        }
    }

    async fn wait_terminal(&self) -> ProgressSnapshot {
        let mut rx = self.signal.watch();
        loop {
            let snapshot = rx.borrow().clone();
            if snapshot.is_terminal() {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                return self.signal.current();
            }
        }
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("video_id", &self.signal.video_id())
            .field("attempt_id", &self.signal.attempt_id())
            .finish()
    }
}

struct InFlightEntry {
    signal: Arc<ProgressSignal>,
    cancel: CancelToken,
}

/// Orchestrates download attempts: dedupe, admission, lifecycle
pub struct DownloadCoordinator {
    catalog: Arc<dyn VideoCatalogClient>,
    updater: Arc<PersistenceUpdater>,
    config: DownloadConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<String, InFlightEntry>>>,
    global_listeners: Mutex<Vec<Listener>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DownloadCoordinator {
    pub fn new(
        catalog: Arc<dyn VideoCatalogClient>,
        updater: Arc<PersistenceUpdater>,
        config: DownloadConfig,
    ) -> Self {
        let permits = config.concurrent_downloads.max(1);
        info!(
            concurrent_downloads = permits,
            output_directory = %config.output_directory.display(),
            "🚀 download coordinator ready"
        );

        Self {
            catalog,
            updater,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            global_listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a listener to every attempt: current in-flight ones and all
    /// submitted later
    pub fn add_listener(&self, listener: Listener) {
        for entry in self.in_flight.lock().values() {
            entry.signal.listeners().subscribe(Arc::clone(&listener));
        }
        self.global_listeners.lock().push(listener);
    }

    /// Submit a download request for a video.
    ///
    /// If an attempt for this video is already in flight, no second attempt
    /// is spawned; the returned handle refers to the existing one and any
    /// `on_progress` listener is attached to it. With `wait_for_completion`
    /// set the call blocks until the attempt is terminal before returning.
    pub async fn submit(&self, video_id: &str, options: SubmitOptions) -> DownloadHandle {
        let handle = self.admit(video_id, &options);

        if options.wait_for_completion {
            handle.await_completion(None).await;
        }
        handle
    }

    fn admit(&self, video_id: &str, options: &SubmitOptions) -> DownloadHandle {
        let mut in_flight = self.in_flight.lock();

        if let Some(entry) = in_flight.get(video_id) {
            if !entry.signal.current().is_terminal() {
                debug!(video_id, "attaching to in-flight download");
                if let Some(listener) = options.on_progress.clone() {
                    entry.signal.listeners().subscribe(listener);
                }
                return DownloadHandle::new(Arc::clone(&entry.signal), entry.cancel.clone());
            }
        }

        let signal = Arc::new(ProgressSignal::new(video_id, options.priority));
        for listener in self.global_listeners.lock().iter() {
            signal.listeners().subscribe(Arc::clone(listener));
        }
        if let Some(listener) = options.on_progress.clone() {
            signal.listeners().subscribe(listener);
        }

        let cancel = CancelToken::new();
        in_flight.insert(
            video_id.to_string(),
            InFlightEntry {
                signal: Arc::clone(&signal),
                cancel: cancel.clone(),
            },
        );

        info!(video_id, priority = ?options.priority, "📥 download queued");

        let task = DownloadTask::new(
            Arc::clone(&signal),
            cancel.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.updater),
            self.config.clone(),
        );
        let semaphore = Arc::clone(&self.semaphore);
        let map = Arc::clone(&self.in_flight);
        let vid = video_id.to_string();
        let attempt_id = signal.attempt_id();

        let join = tokio::spawn(async move {
            task.run(semaphore).await;
            // Remove our own entry, unless a newer attempt replaced it
            let mut map = map.lock();
            if map
                .get(&vid)
                .map(|entry| entry.signal.attempt_id() == attempt_id)
                .unwrap_or(false)
            {
                map.remove(&vid);
            }
        });

        // Reap handles of finished tasks so the list tracks live work only
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(join);
        drop(tasks);

        DownloadHandle::new(signal, cancel)
    }

    /// Handle to the in-flight attempt for a video, if any
    pub fn handle(&self, video_id: &str) -> Option<DownloadHandle> {
        self.in_flight.lock().get(video_id).map(|entry| {
            DownloadHandle::new(Arc::clone(&entry.signal), entry.cancel.clone())
        })
    }

    /// Request cancellation of a video's in-flight attempt. Returns false
    /// when no attempt for the video is in flight.
    pub fn cancel(&self, video_id: &str) -> bool {
        match self.in_flight.lock().get(video_id) {
            Some(entry) => {
                info!(video_id, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            None => {
                debug!(video_id, "cancel requested but no attempt in flight");
                false
            }
        }
    }

    /// Snapshots of every attempt still tracked by the coordinator
    pub fn active_downloads(&self) -> Vec<ProgressSnapshot> {
        self.in_flight
            .lock()
            .values()
            .map(|entry| entry.signal.current())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn task_backlog(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel every in-flight attempt and wait for their tasks to finish,
    /// persistence included
    pub async fn shutdown(&self) {
        let cancelled = {
            let in_flight = self.in_flight.lock();
            for entry in in_flight.values() {
                entry.cancel.cancel();
            }
            in_flight.len()
        };
        if cancelled > 0 {
            info!(cancelled, "🛑 shutting down, cancelling in-flight downloads");
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for join in tasks {
            if let Err(e) = join.await {
                warn!(error = %e, "download task aborted during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("active", &self.active_count())
            .field("concurrent_downloads", &self.config.concurrent_downloads)
            .finish()
    }
}
