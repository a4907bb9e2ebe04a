//! Connectivity monitor: online/offline state and its transitions.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::info;

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    WentOnline,
    WentOffline,
}

impl ConnectivityEvent {
    /// Whether the transition ends online.
    pub fn is_online(self) -> bool {
        self == ConnectivityEvent::WentOnline
    }

    fn from_online(online: bool) -> Self {
        if online {
            ConnectivityEvent::WentOnline
        } else {
            ConnectivityEvent::WentOffline
        }
    }
}

/// Called synchronously on each transition. Returning `false` unregisters it.
type Listener = Box<dyn Fn(ConnectivityEvent) -> bool + Send + Sync>;

/// Tracks whether the environment is online.
///
/// The environment (network watcher, platform hook, test) drives it through
/// [`ConnectivityMonitor::set_online`]. Repeated identical states never
/// produce an event.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Run `listener` inside every future [`set_online`](Self::set_online)
    /// that changes the state, before it returns.
    ///
    /// The listener stays registered until it returns `false`.
    pub fn on_transition<F>(&self, listener: F)
    where
        F: Fn(ConnectivityEvent) -> bool + Send + Sync + 'static,
    {
        self.lock_listeners().push(Box::new(listener));
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_listeners(&self, event: ConnectivityEvent) {
        // Taken out so a listener may re-enter the monitor.
        let listeners = std::mem::take(&mut *self.lock_listeners());
        let kept: Vec<Listener> = listeners.into_iter().filter(|l| l(event)).collect();
        let mut listeners = self.lock_listeners();
        let added = std::mem::replace(&mut *listeners, kept);
        listeners.extend(added);
    }

    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Report the environment's state. Returns the fired event, or `None`
    /// when the state is unchanged.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if !changed {
            return None;
        }

        let event = ConnectivityEvent::from_online(online);
        info!("Connectivity changed: {:?}", event);
        self.notify_listeners(event);
        Some(event)
    }

    /// Subscribe to transitions from the current state onward.
    pub fn events(&self) -> ConnectivityEvents {
        let mut rx = self.state.subscribe();
        let last = *rx.borrow_and_update();
        ConnectivityEvents { rx, last }
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("listeners", &self.lock_listeners().len())
            .finish()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Stream of deduplicated connectivity transitions.
pub struct ConnectivityEvents {
    rx: watch::Receiver<bool>,
    last: bool,
}

impl ConnectivityEvents {
    /// Wait for the next transition. Returns `None` once the monitor is dropped.
    ///
    /// A rapid offline/online flap that settles back on the last observed
    /// state is coalesced away.
    pub async fn next(&mut self) -> Option<ConnectivityEvent> {
        loop {
            self.rx.changed().await.ok()?;
            let online = *self.rx.borrow_and_update();
            if online != self.last {
                self.last = online;
                return Some(ConnectivityEvent::from_online(online));
            }
        }
    }
}
