//! Observable progress signal for a single download attempt
//!
//! A `ProgressSignal` is the mutable, observable record of one download
//! attempt's state, decoupled from any transport. Snapshot reads go through
//! a `tokio::sync::watch` channel and never block on writers; transitions
//! are serialized by a short critical section so every listener queue
//! receives snapshots in exactly the order transitions were committed.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error_handling::{FetchError, SignalError};
use crate::core::listeners::ListenerRegistry;
use crate::core::models::{
    DownloadArtifact, DownloadPriority, DownloadState, ProgressSnapshot,
};

/// Mutable, observable record of a single download attempt.
///
/// Created when an attempt is accepted, immutable after reaching a terminal
/// state. The owning task is the only writer apart from `cancel`, which may
/// race with a natural completion; that race is resolved by the idempotent
/// terminal guard.
pub struct ProgressSignal {
    // Serializes transition + enqueue so each listener queue sees snapshots
    // in transition order. Listener callbacks run on their own workers, not
    // under this lock.
    transition_lock: Mutex<()>,
    tx: watch::Sender<ProgressSnapshot>,
    listeners: ListenerRegistry,
}

impl ProgressSignal {
    /// Create a fresh signal in the `Queued` state with a new attempt id
    pub fn new(video_id: impl Into<String>, priority: DownloadPriority) -> Self {
        let initial = ProgressSnapshot {
            video_id: video_id.into(),
            attempt_id: Uuid::new_v4(),
            state: DownloadState::Queued,
            fraction_complete: 0.0,
            error: None,
            artifact: None,
            priority,
            started_at: chrono::Utc::now(),
            finished_at: None,
        };
        let (tx, _rx) = watch::channel(initial);

        Self {
            transition_lock: Mutex::new(()),
            tx,
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn video_id(&self) -> String {
        self.tx.borrow().video_id.clone()
    }

    pub fn attempt_id(&self) -> Uuid {
        self.tx.borrow().attempt_id
    }

    /// Lock-free snapshot read, valid at any time
    pub fn current(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every committed transition
    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// `Queued -> Running`, called when the execution unit is scheduled
    pub fn start(&self) -> Result<(), SignalError> {
        let _guard = self.transition_lock.lock();
        let current = self.tx.borrow().clone();

        if current.state != DownloadState::Queued {
            return Err(SignalError::InvalidTransition {
                from: current.state,
                operation: "start",
            });
        }

        let mut next = current;
        next.state = DownloadState::Running;
        self.commit(next);
        Ok(())
    }

    /// Report progress while `Running`. The fraction is clamped to [0, 1]
    /// and never decreases; calling after a terminal state is a contract
    /// violation.
    pub fn advance(&self, fraction: f64) -> Result<(), SignalError> {
        let _guard = self.transition_lock.lock();
        let current = self.tx.borrow().clone();

        if current.state != DownloadState::Running {
            return Err(SignalError::InvalidTransition {
                from: current.state,
                operation: "advance",
            });
        }

        let mut next = current;
        next.fraction_complete = fraction.clamp(0.0, 1.0).max(next.fraction_complete);
        self.commit(next);
        Ok(())
    }

    /// `-> Succeeded`. Returns false (and logs a warning) when the signal is
    /// already terminal; a cancel racing a natural completion is expected.
    pub fn complete(&self, artifact: DownloadArtifact) -> bool {
        let _guard = self.transition_lock.lock();
        let current = self.tx.borrow().clone();

        if current.state.is_terminal() {
            self.warn_already_terminal("complete", &current);
            return false;
        }

        let mut next = current;
        next.state = DownloadState::Succeeded;
        next.fraction_complete = 1.0;
        next.artifact = Some(artifact);
        next.finished_at = Some(chrono::Utc::now());
        self.commit(next);
        true
    }

    /// `-> Failed` with the categorized error attached. Idempotent-guarded
    /// like `complete`.
    pub fn fail(&self, error: FetchError) -> bool {
        let _guard = self.transition_lock.lock();
        let current = self.tx.borrow().clone();

        if current.state.is_terminal() {
            self.warn_already_terminal("fail", &current);
            return false;
        }

        let mut next = current;
        next.state = DownloadState::Failed;
        next.error = Some(error);
        next.finished_at = Some(chrono::Utc::now());
        self.commit(next);
        true
    }

    /// `-> Cancelled`, reachable from `Queued` or `Running`
    pub fn cancel(&self) -> bool {
        let _guard = self.transition_lock.lock();
        let current = self.tx.borrow().clone();

        if current.state.is_terminal() {
            self.warn_already_terminal("cancel", &current);
            return false;
        }

        let mut next = current;
        next.state = DownloadState::Cancelled;
        next.finished_at = Some(chrono::Utc::now());
        self.commit(next);
        true
    }

    fn commit(&self, next: ProgressSnapshot) {
        debug!(
            video_id = %next.video_id,
            state = ?next.state,
            fraction = next.fraction_complete,
            "progress transition"
        );
        self.tx.send_replace(next.clone());
        self.listeners.notify(&next);
    }

    fn warn_already_terminal(&self, operation: &str, current: &ProgressSnapshot) {
        warn!(
            video_id = %current.video_id,
            state = ?current.state,
            operation,
            "{}",
            SignalError::AlreadyTerminal
        );
    }
}

impl std::fmt::Debug for ProgressSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.current();
        f.debug_struct("ProgressSignal")
            .field("video_id", &snapshot.video_id)
            .field("attempt_id", &snapshot.attempt_id)
            .field("state", &snapshot.state)
            .field("fraction_complete", &snapshot.fraction_complete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error_handling::errors;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn artifact() -> DownloadArtifact {
        DownloadArtifact {
            local_path: PathBuf::from("/tmp/abc123.mp4"),
            size_bytes: 1024,
            checksum_sha256: None,
        }
    }

    #[test]
    fn test_fraction_is_monotone() {
        let signal = ProgressSignal::new("abc123", DownloadPriority::Normal);
        signal.start().unwrap();

        signal.advance(0.3).unwrap();
        signal.advance(0.6).unwrap();
        signal.advance(0.4).unwrap(); // stale update must not regress

        assert_eq!(signal.current().fraction_complete, 0.6);
    }

    #[test]
    fn test_fraction_is_clamped() {
        let signal = ProgressSignal::new("abc123", DownloadPriority::Normal);
        signal.start().unwrap();

        signal.advance(7.5).unwrap();
        assert_eq!(signal.current().fraction_complete, 1.0);
    }

    #[test]
    fn test_advance_before_start_is_invalid() {
        let signal = ProgressSignal::new("abc123", DownloadPriority::Normal);
        let err = signal.advance(0.5).unwrap_err();
        assert!(matches!(
            err,
            SignalError::InvalidTransition {
                from: DownloadState::Queued,
                ..
            }
        ));
    }

    #[test]
    fn test_no_transition_after_terminal() {
        let signal = ProgressSignal::new("abc123", DownloadPriority::Normal);
        signal.start().unwrap();
        assert!(signal.complete(artifact()));

        assert!(signal.advance(0.9).is_err());
        assert!(signal.start().is_err());

        let snapshot = signal.current();
        assert_eq!(snapshot.state, DownloadState::Succeeded);
        assert_eq!(snapshot.fraction_complete, 1.0);
        assert!(snapshot.finished_at.is_some());
    }

    #[test]
    fn test_terminal_ops_are_idempotent() {
        let signal = ProgressSignal::new("abc123", DownloadPriority::Normal);
        signal.start().unwrap();

        assert!(signal.complete(artifact()));
        let finished_at = signal.current().finished_at;

        // Second terminal calls are no-ops that preserve the first result
        assert!(!signal.complete(artifact()));
        assert!(!signal.fail(errors::transient_network("late failure")));
        assert!(!signal.cancel());

        let snapshot = signal.current();
        assert_eq!(snapshot.state, DownloadState::Succeeded);
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.finished_at, finished_at);
    }

    #[test]
    fn test_cancel_from_queued() {
        let signal = ProgressSignal::new("abc123", DownloadPriority::Normal);
        assert!(signal.cancel());
        assert_eq!(signal.current().state, DownloadState::Cancelled);
    }

    #[test]
    fn test_fail_attaches_error() {
        let signal = ProgressSignal::new("xyz999", DownloadPriority::Normal);
        signal.start().unwrap();
        assert!(signal.fail(errors::video_removed("xyz999")));

        let snapshot = signal.current();
        assert_eq!(snapshot.state, DownloadState::Failed);
        assert!(snapshot.error.is_some());
    }

    #[tokio::test]
    async fn test_listeners_see_transitions_in_order() {
        let signal = ProgressSignal::new("abc123", DownloadPriority::Normal);
        let seen: Arc<parking_lot::Mutex<Vec<(DownloadState, f64)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        signal.listeners().subscribe(Arc::new(move |snapshot| {
            seen_clone
                .lock()
                .push((snapshot.state, snapshot.fraction_complete));
        }));

        signal.start().unwrap();
        signal.advance(0.3).unwrap();
        signal.advance(0.6).unwrap();
        signal.complete(artifact());

        // Delivery is queued per subscriber; wait for the last event to land
        for _ in 0..200 {
            if seen.lock().len() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (DownloadState::Running, 0.0),
                (DownloadState::Running, 0.3),
                (DownloadState::Running, 0.6),
                (DownloadState::Succeeded, 1.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_observes_terminal_state() {
        let signal = Arc::new(ProgressSignal::new("abc123", DownloadPriority::Normal));
        let mut rx = signal.watch();

        let writer = Arc::clone(&signal);
        let handle = tokio::spawn(async move {
            writer.start().unwrap();
            writer.advance(0.5).unwrap();
            writer.complete(artifact());
        });

        loop {
            if rx.borrow().state.is_terminal() {
                break;
            }
            rx.changed().await.unwrap();
        }

        assert_eq!(rx.borrow().state, DownloadState::Succeeded);
        handle.await.unwrap();
    }
}
