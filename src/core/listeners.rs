//! Ordered listener registry for progress notifications
//!
//! Listeners are plain synchronous callbacks invoked off the transition
//! path: every subscriber owns a queue drained by its own worker task, so a
//! slow listener delays only its own later notifications, never another
//! listener's delivery and never the task driving the signal. Within one
//! subscription, snapshots arrive in the order they were committed. A
//! panicking listener is isolated: the failure is logged and its later
//! notifications still arrive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::models::{Listener, ProgressSnapshot};

/// Token returned by `subscribe`, used to detach the listener later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered set of callback subscribers notified on state transitions
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<ProgressSnapshot>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback and spawn its delivery worker. Takes effect for
    /// the next notification. Must be called from within a tokio runtime.
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressSnapshot>();

        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                let video_id = snapshot.video_id.clone();
                let delivered = catch_unwind(AssertUnwindSafe(|| listener(snapshot)));
                if delivered.is_err() {
                    warn!(
                        video_id = %video_id,
                        subscription = id.0,
                        "listener panicked during notification; keeping its subscription"
                    );
                }
            }
        });

        self.subscribers.lock().push((id, tx));
        id
    }

    /// Detach a subscriber. Notifications already queued for it are still
    /// delivered; nothing committed after this call reaches it.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Enqueue a snapshot for every current subscriber, in subscription
    /// order. Enqueueing never blocks on listener execution; subscribers
    /// whose worker is gone are dropped from the set.
    pub fn notify(&self, snapshot: &ProgressSnapshot) {
        self.subscribers
            .lock()
            .retain(|(_, tx)| tx.send(snapshot.clone()).is_ok());
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}
