//! Status snapshots and their publication to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, error};

/// Derived view of the engine's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Pending and in-progress operations.
    pub pending_count: usize,
    /// Terminally failed operations.
    pub failed_count: usize,
    /// Manual conflicts awaiting an operator.
    pub conflict_count: usize,
    pub draining: bool,
}

type Callback = Box<dyn Fn(&SyncStatus) + Send + Sync>;

struct NotifierInner {
    subscribers: Vec<(u64, Arc<Callback>)>,
    next_id: u64,
}

/// Pushes status snapshots to subscribers whenever they change.
///
/// Callbacks run synchronously on the publishing task. A panicking callback
/// is logged and skipped; the remaining subscribers still receive the
/// snapshot.
pub struct StatusNotifier {
    inner: Arc<Mutex<NotifierInner>>,
    current: watch::Sender<SyncStatus>,
}

impl StatusNotifier {
    /// Create a notifier holding an initial snapshot.
    pub fn new(initial: SyncStatus) -> Self {
        let (current, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Mutex::new(NotifierInner {
                subscribers: Vec::new(),
                next_id: 0,
            })),
            current,
        }
    }

    /// Most recently published snapshot.
    pub fn current(&self) -> SyncStatus {
        self.current.borrow().clone()
    }

    /// Register a callback. It immediately receives the current snapshot.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let callback: Arc<Callback> = Arc::new(Box::new(callback));
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push((id, callback.clone()));
            id
        };

        let snapshot = self.current();
        Self::deliver(id, &callback, &snapshot);

        Subscription {
            id,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.current.subscribe()
    }

    /// Publish a snapshot if it differs from the last one.
    ///
    /// Returns whether subscribers were notified.
    pub fn publish(&self, status: SyncStatus) -> bool {
        let changed = self.current.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if !changed {
            return false;
        }

        // Clone the list so callbacks may subscribe or unsubscribe re-entrantly.
        let subscribers: Vec<(u64, Arc<Callback>)> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.clone()
        };

        debug!("Publishing status to {} subscriber(s)", subscribers.len());
        for (id, callback) in &subscribers {
            Self::deliver(*id, callback, &status);
        }
        true
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }

    fn deliver(id: u64, callback: &Callback, status: &SyncStatus) {
        if catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
            error!("Status subscriber {} panicked; continuing", id);
        }
    }
}

/// Handle returned by [`StatusNotifier::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`unsubscribe`](Self::unsubscribe) to stop receiving snapshots.
pub struct Subscription {
    id: u64,
    notifier: Weak<Mutex<NotifierInner>>,
}

impl Subscription {
    /// Remove the callback. Safe to call after the notifier is gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.notifier.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
