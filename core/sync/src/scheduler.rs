//! Sync scheduling: connectivity transitions, periodic drains and due retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connectivity::{ConnectivityEvent, ConnectivityEvents, ConnectivityMonitor};

/// What asked for a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Engine construction found pending work.
    Startup,
    /// An operation was enqueued while online.
    Enqueue,
    /// `force_sync` was called.
    Manual,
    /// The periodic timer fired.
    Periodic,
    /// Connectivity came back.
    Reconnected,
    /// A backed-off operation became due.
    RetryDue,
    /// An operator resolved a manual conflict.
    ConflictResolved,
}

impl SyncTrigger {
    /// Whether this trigger drains regardless of what the engine last saw.
    ///
    /// Only a reconnect does; every other trigger is advisory and checks
    /// connectivity first.
    pub fn is_unconditional(&self) -> bool {
        matches!(self, SyncTrigger::Reconnected)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Startup => "startup",
            SyncTrigger::Enqueue => "enqueue",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Reconnected => "reconnected",
            SyncTrigger::RetryDue => "retry_due",
            SyncTrigger::ConflictResolved => "conflict_resolved",
        };
        f.write_str(name)
    }
}

/// The engine side of the scheduler loop.
#[async_trait]
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Whether the environment is online.
    fn is_online(&self) -> bool;

    /// Start a drain pass in the background.
    fn trigger(self: Arc<Self>, trigger: SyncTrigger);

    /// Earliest scheduled retry.
    async fn next_retry_deadline(&self) -> Option<DateTime<Utc>>;

    /// Drop retries due at `now` from the schedule. Returns how many were due.
    async fn take_due_retries(&self, now: DateTime<Utc>) -> usize;

    /// Interrupt the running drain pass, if any.
    async fn cancel_drain(&self);

    /// Republish the full status after a connectivity transition.
    ///
    /// Subscribers already saw the new flag from inside `set_online`; this
    /// reconciles the counts under the engine's lock.
    async fn connectivity_changed(&self, event: ConnectivityEvent);
}

/// Background loop deciding when to drain.
pub struct SyncScheduler {
    events: ConnectivityEvents,
    periodic: Option<Duration>,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
}

impl SyncScheduler {
    /// Create a scheduler observing `connectivity`.
    ///
    /// `wake` is notified by the engine whenever the retry schedule may have
    /// changed, so the loop recomputes its next deadline.
    pub fn new(
        connectivity: &ConnectivityMonitor,
        periodic: Option<Duration>,
        shutdown: CancellationToken,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            events: connectivity.events(),
            periodic,
            shutdown,
            wake,
        }
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run<H: SchedulerHooks>(mut self, hooks: Arc<H>) {
        let mut periodic_interval = self.periodic.map(Self::create_periodic_interval);
        let mut connectivity_open = true;

        info!("Sync scheduler started");

        loop {
            let retry_at = hooks.next_retry_deadline().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Sync scheduler shutting down");
                    break;
                }

                event = self.events.next(), if connectivity_open => {
                    match event {
                        Some(event) => {
                            hooks.connectivity_changed(event).await;
                            match event {
                                ConnectivityEvent::WentOnline => {
                                    hooks.clone().trigger(SyncTrigger::Reconnected);
                                }
                                ConnectivityEvent::WentOffline => {
                                    hooks.cancel_drain().await;
                                }
                            }
                        }
                        None => {
                            debug!("Connectivity monitor closed");
                            connectivity_open = false;
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    if hooks.is_online() {
                        debug!("Triggering periodic sync");
                        hooks.clone().trigger(SyncTrigger::Periodic);
                    }
                }

                _ = Self::wait_until(retry_at) => {
                    let due = hooks.take_due_retries(Utc::now()).await;
                    if due > 0 && hooks.is_online() {
                        debug!("{} retr(ies) due", due);
                        hooks.clone().trigger(SyncTrigger::RetryDue);
                    }
                }

                _ = self.wake.notified() => {
                    // Retry schedule changed; recompute the deadline.
                }
            }
        }
    }

    fn create_periodic_interval(period: Duration) -> Interval {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn wait_until(deadline: Option<DateTime<Utc>>) {
        match deadline {
            Some(at) => {
                let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay).await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHooks {
        connectivity: Arc<ConnectivityMonitor>,
        triggers: Mutex<Vec<SyncTrigger>>,
        retries: Mutex<Vec<DateTime<Utc>>>,
        cancels: Mutex<usize>,
    }

    impl RecordingHooks {
        fn new(connectivity: Arc<ConnectivityMonitor>) -> Arc<Self> {
            Arc::new(Self {
                connectivity,
                triggers: Mutex::new(Vec::new()),
                retries: Mutex::new(Vec::new()),
                cancels: Mutex::new(0),
            })
        }

        fn triggers(&self) -> Vec<SyncTrigger> {
            self.triggers.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SchedulerHooks for RecordingHooks {
        fn is_online(&self) -> bool {
            self.connectivity.is_online()
        }

        fn trigger(self: Arc<Self>, trigger: SyncTrigger) {
            self.triggers.lock().unwrap().push(trigger);
        }

        async fn next_retry_deadline(&self) -> Option<DateTime<Utc>> {
            self.retries.lock().unwrap().iter().min().copied()
        }

        async fn take_due_retries(&self, now: DateTime<Utc>) -> usize {
            let mut retries = self.retries.lock().unwrap();
            let before = retries.len();
            retries.retain(|at| *at > now);
            before - retries.len()
        }

        async fn cancel_drain(&self) {
            *self.cancels.lock().unwrap() += 1;
        }

        async fn connectivity_changed(&self, _event: ConnectivityEvent) {}
    }

    fn spawn(
        connectivity: &Arc<ConnectivityMonitor>,
        periodic: Option<Duration>,
        hooks: &Arc<RecordingHooks>,
    ) -> (CancellationToken, Arc<Notify>, tokio::task::JoinHandle<()>) {
        let shutdown = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let scheduler = SyncScheduler::new(connectivity, periodic, shutdown.clone(), wake.clone());
        let task = tokio::spawn(scheduler.run(hooks.clone()));
        (shutdown, wake, task)
    }

    #[test]
    fn test_only_reconnect_is_unconditional() {
        assert!(SyncTrigger::Reconnected.is_unconditional());
        assert!(!SyncTrigger::Periodic.is_unconditional());
        assert!(!SyncTrigger::Manual.is_unconditional());
        assert_eq!(SyncTrigger::RetryDue.to_string(), "retry_due");
    }

    #[tokio::test]
    async fn test_reconnect_triggers_and_offline_cancels() {
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let hooks = RecordingHooks::new(connectivity.clone());
        let (shutdown, _wake, task) = spawn(&connectivity, None, &hooks);

        tokio::task::yield_now().await;
        connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        connectivity.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hooks.triggers(), vec![SyncTrigger::Reconnected]);
        assert_eq!(*hooks.cancels.lock().unwrap(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_only_when_online() {
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let hooks = RecordingHooks::new(connectivity.clone());
        let (shutdown, _wake, task) = spawn(&connectivity, Some(Duration::from_secs(30)), &hooks);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(hooks.triggers(), vec![SyncTrigger::Periodic]);

        connectivity.set_online(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!hooks.triggers().contains(&SyncTrigger::Reconnected));
        assert_eq!(
            hooks
                .triggers()
                .iter()
                .filter(|t| **t == SyncTrigger::Periodic)
                .count(),
            1
        );

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_deadline_fires_after_wake() {
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let hooks = RecordingHooks::new(connectivity.clone());
        let (shutdown, wake, task) = spawn(&connectivity, None, &hooks);

        tokio::task::yield_now().await;
        hooks
            .retries
            .lock()
            .unwrap()
            .push(Utc::now() + chrono::Duration::milliseconds(30));
        wake.notify_one();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hooks.triggers(), vec![SyncTrigger::RetryDue]);
        assert!(hooks.retries.lock().unwrap().is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
