//! Core sync engine that owns the queue and orchestrates drain passes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use offsync_common::{Error, OperationId, Result};
use offsync_storage::{DocumentRecord, DocumentStore, FileMetadata, KeyValueStore, MetadataStore};

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, ConflictStrategy, PendingConflict};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::executor::{ExecutionOutcome, SyncExecutor};
use crate::persistence::QueuePersistence;
use crate::queue::{OperationQueue, OperationType, SyncOperation};
use crate::retry::{RetryConfig, RetryScheduler};
use crate::scheduler::{SchedulerHooks, SyncScheduler, SyncTrigger};
use crate::status::{StatusNotifier, Subscription, SyncStatus};

/// Summary of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub trigger: SyncTrigger,
    /// Operations that completed, including ones superseded by a remote version.
    pub completed: usize,
    /// Operations that reached terminal failure.
    pub failed: usize,
    /// Operations sent back to pending with a backoff delay.
    pub retried: usize,
    /// Conflicts met, resolved automatically or held for an operator.
    pub conflicts: usize,
    /// The pass was cut short by an offline transition or shutdown.
    pub interrupted: bool,
    pub duration: Duration,
}

impl DrainReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            completed: 0,
            failed: 0,
            retried: 0,
            conflicts: 0,
            interrupted: false,
            duration: Duration::ZERO,
        }
    }
}

/// Result of asking for a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A pass ran to its end (or was interrupted).
    Finished(DrainReport),
    /// Another pass was already running; it will observe the current queue.
    AlreadyRunning,
    /// Nothing ran: offline for an advisory trigger, or the engine is closing.
    Skipped,
}

/// Read-only diagnostic bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportState {
    pub queue: Vec<SyncOperation>,
    pub last_sync: Option<DateTime<Utc>>,
    pub documents: Vec<DocumentRecord>,
    pub metadata: Vec<FileMetadata>,
    #[serde(default)]
    pub conflicts: Vec<PendingConflict>,
}

/// Everything guarded by the engine's single writer lock.
struct EngineState {
    queue: OperationQueue,
    last_sync_at: Option<DateTime<Utc>>,
    draining: bool,
    rerun_requested: bool,
    drain_token: Option<CancellationToken>,
    conflicts: BTreeMap<OperationId, PendingConflict>,
    retries: RetryScheduler,
}

impl EngineState {
    /// Rebuild the retry heap from the queue's backoff deadlines.
    ///
    /// Operations held by a manual conflict are left out; only
    /// `resolve_conflict` makes them runnable again.
    fn reschedule_retries(&mut self) {
        self.retries.clear();
        for op in self.queue.operations() {
            if self.conflicts.contains_key(&op.id) {
                continue;
            }
            if let (false, Some(at)) = (op.is_terminal(), op.next_attempt_at) {
                self.retries.schedule(op.id.clone(), at);
            }
        }
    }
}

struct EngineInner {
    documents: Arc<dyn DocumentStore>,
    metadata: Arc<dyn MetadataStore>,
    persistence: QueuePersistence,
    connectivity: Arc<ConnectivityMonitor>,
    executor: SyncExecutor,
    retry: RetryConfig,
    default_max_attempts: u32,
    state: Mutex<EngineState>,
    notifier: StatusNotifier,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
}

/// Offline operation synchronization engine.
///
/// Queues mutation intents durably, replays them against the document and
/// metadata stores whenever connectivity allows, and publishes a status
/// snapshot after every state change. Each instance owns its queue; build one
/// per persisted store and call [`close`](Self::close) when done.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    scheduler_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create an engine, restore persisted state and start the scheduler.
    ///
    /// Must be called from within a tokio runtime. If online with pending
    /// work, a drain starts right away.
    pub async fn new(
        documents: Arc<dyn DocumentStore>,
        metadata: Arc<dyn MetadataStore>,
        kv: Arc<dyn KeyValueStore>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let persistence = QueuePersistence::new(kv);
        let queue = persistence.load_queue().await?;
        let last_sync_at = persistence.load_last_sync().await?;
        let conflicts: BTreeMap<OperationId, PendingConflict> = persistence
            .load_conflicts()
            .await?
            .into_iter()
            .filter(|c| {
                queue
                    .get(&c.operation_id)
                    .is_some_and(|op| !op.is_terminal())
            })
            .map(|c| (c.operation_id.clone(), c))
            .collect();

        let mut state = EngineState {
            queue,
            last_sync_at,
            draining: false,
            rerun_requested: false,
            drain_token: None,
            conflicts,
            retries: RetryScheduler::new(),
        };
        state.reschedule_retries();

        let initial = status_of(&state, connectivity.is_online());
        let pending = initial.pending_count;
        let resolver = ConflictResolver::new(config.conflict_strategy, config.conflict_tolerance);

        let inner = Arc::new(EngineInner {
            executor: SyncExecutor::new(documents.clone(), metadata.clone(), resolver),
            documents,
            metadata,
            persistence,
            connectivity,
            retry: config.retry.clone(),
            default_max_attempts: config.default_max_attempts,
            state: Mutex::new(state),
            notifier: StatusNotifier::new(initial),
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
        });

        let scheduler = SyncScheduler::new(
            &inner.connectivity,
            config.periodic_interval,
            inner.shutdown.clone(),
            inner.wake.clone(),
        );
        let task = tokio::spawn(scheduler.run(inner.clone()));

        let listener = Arc::downgrade(&inner);
        inner.connectivity.on_transition(move |event| match listener.upgrade() {
            Some(inner) if !inner.shutdown.is_cancelled() => {
                inner.publish_online(event.is_online());
                true
            }
            _ => false,
        });

        info!(
            "Sync engine ready on {} store with {} pending operation(s)",
            inner.documents.name(),
            pending
        );
        if pending > 0 && inner.connectivity.is_online() {
            inner.clone().trigger(SyncTrigger::Startup);
        }

        Ok(Self {
            inner,
            scheduler_task: StdMutex::new(Some(task)),
        })
    }

    /// Queue a mutation intent.
    ///
    /// Never fails: if the queue cannot be persisted the operation still
    /// stays queued in memory and the failure is logged. Triggers a drain
    /// when online.
    pub async fn queue_operation(
        &self,
        op_type: OperationType,
        target_id: impl Into<String>,
        payload: Value,
        max_attempts: Option<u32>,
    ) -> SyncOperation {
        let op = SyncOperation::new(
            op_type,
            target_id,
            payload,
            max_attempts.unwrap_or(self.inner.default_max_attempts),
        );

        {
            let mut state = self.inner.state.lock().await;
            state.queue.push(op.clone());
            self.inner.save_queue(&state).await;
            self.inner.publish(&state);
        }
        debug!("Queued {} {} for {}", op.op_type, op.id, op.target_id);

        if self.inner.connectivity.is_online() {
            self.inner.clone().trigger(SyncTrigger::Enqueue);
        }
        op
    }

    /// Current status.
    pub fn get_status(&self) -> SyncStatus {
        let mut status = self.inner.notifier.current();
        status.online = self.inner.connectivity.is_online();
        status
    }

    /// Register a status callback. It receives the current snapshot immediately.
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(callback)
    }

    /// Receiver that always holds the latest status.
    pub fn status_watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.notifier.watch()
    }

    /// Drain now.
    ///
    /// Fails with [`Error::Offline`] when offline, leaving the queue untouched.
    pub async fn force_sync(&self) -> Result<DrainOutcome> {
        if !self.inner.connectivity.is_online() {
            return Err(Error::Offline);
        }
        Ok(self.inner.clone().drain(SyncTrigger::Manual).await)
    }

    /// Remove every terminally failed operation. Returns how many were removed.
    pub async fn clear_failed_operations(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let removed = state.queue.clear_failed();
        if removed > 0 {
            info!("Cleared {} failed operation(s)", removed);
            self.inner.persistence.save_queue(&state.queue).await?;
        }
        self.inner.publish(&state);
        Ok(removed)
    }

    /// Copy of the queue in FIFO order.
    pub async fn snapshot(&self) -> Vec<SyncOperation> {
        self.inner.state.lock().await.queue.snapshot()
    }

    /// Manual conflicts awaiting an operator.
    pub async fn pending_conflicts(&self) -> Vec<PendingConflict> {
        let state = self.inner.state.lock().await;
        state.conflicts.values().cloned().collect()
    }

    /// Settle a manual conflict. The held operation runs on the next pass
    /// with `strategy` applied instead of re-detecting.
    pub async fn resolve_conflict(
        &self,
        operation_id: &OperationId,
        strategy: ConflictStrategy,
    ) -> Result<()> {
        if strategy == ConflictStrategy::Manual {
            return Err(Error::InvalidInput(
                "A conflict cannot be resolved as manual".to_string(),
            ));
        }

        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            if !state.conflicts.contains_key(operation_id) {
                return Err(Error::NotFound(format!("No conflict for operation {}", operation_id)));
            }
            let op = state.queue.get_mut(operation_id).ok_or_else(|| {
                Error::NotFound(format!("Operation not found: {}", operation_id))
            })?;
            op.resolution = Some(strategy);
            state.conflicts.remove(operation_id);

            info!("Conflict on {} resolved as {}", operation_id, strategy);
            self.inner.persistence.save_queue(&state.queue).await?;
            self.inner.save_conflicts(state).await?;
            self.inner.publish(state);
        }

        if self.inner.connectivity.is_online() {
            self.inner.clone().trigger(SyncTrigger::ConflictResolved);
        }
        Ok(())
    }

    /// Diagnostic bundle of queue, last sync time and collaborator contents.
    pub async fn export_state(&self) -> Result<ExportState> {
        let (queue, last_sync, conflicts) = {
            let state = self.inner.state.lock().await;
            (
                state.queue.snapshot(),
                state.last_sync_at,
                state.conflicts.values().cloned().collect(),
            )
        };

        Ok(ExportState {
            queue,
            last_sync,
            documents: self.inner.documents.list().await?,
            metadata: self.inner.metadata.list().await?,
            conflicts,
        })
    }

    /// Stop the scheduler, interrupt any running pass and wait for it to settle.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        let task = self
            .scheduler_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Sync scheduler task ended abnormally: {}", e);
            }
        }

        let mut status = self.inner.notifier.watch();
        let _ = status.wait_for(|s| !s.draining).await;
        info!("Sync engine closed");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn status_of(state: &EngineState, online: bool) -> SyncStatus {
    SyncStatus {
        online,
        last_sync_at: state.last_sync_at,
        pending_count: state.queue.pending_count(),
        failed_count: state.queue.failed_count(),
        conflict_count: state.conflicts.len(),
        draining: state.draining,
    }
}

impl EngineInner {
    fn publish(&self, state: &EngineState) {
        self.notifier
            .publish(status_of(state, self.connectivity.is_online()));
    }

    /// Republish the last snapshot with a new connectivity flag.
    ///
    /// Runs inside `ConnectivityMonitor::set_online`, so it cannot take the
    /// state lock; the scheduler republishes the full snapshot afterwards.
    fn publish_online(&self, online: bool) {
        let mut status = self.notifier.current();
        status.online = online;
        self.notifier.publish(status);
    }

    async fn save_queue(&self, state: &EngineState) {
        if let Err(e) = self.persistence.save_queue(&state.queue).await {
            warn!("Failed to persist sync queue: {}", e);
        }
    }

    async fn save_conflicts(&self, state: &EngineState) -> Result<()> {
        let conflicts: Vec<PendingConflict> = state.conflicts.values().cloned().collect();
        self.persistence.save_conflicts(&conflicts).await
    }

    /// Run drain passes until no follow-up is requested.
    async fn drain(self: Arc<Self>, trigger: SyncTrigger) -> DrainOutcome {
        let (outcome, rerun) = self.drain_pass(trigger).await;
        if rerun && self.connectivity.is_online() && !self.shutdown.is_cancelled() {
            debug!("Running follow-up pass after reconnect");
            return self.drain_pass(SyncTrigger::Reconnected).await.0;
        }
        outcome
    }

    /// One serialized pass over the queue.
    ///
    /// Returns the outcome and whether a reconnect arrived while it ran.
    async fn drain_pass(&self, trigger: SyncTrigger) -> (DrainOutcome, bool) {
        let cancel = {
            let mut state = self.state.lock().await;
            if self.shutdown.is_cancelled()
                || (!trigger.is_unconditional() && !self.connectivity.is_online())
            {
                return (DrainOutcome::Skipped, false);
            }
            if state.draining {
                if trigger.is_unconditional() {
                    state.rerun_requested = true;
                }
                debug!("Drain already running; {} trigger ignored", trigger);
                return (DrainOutcome::AlreadyRunning, false);
            }

            let token = self.shutdown.child_token();
            state.draining = true;
            state.drain_token = Some(token.clone());
            self.publish(&state);
            token
        };

        info!("Starting sync pass ({})", trigger);
        let start = Instant::now();
        let mut report = DrainReport::new(trigger);
        let mut attempted: HashSet<OperationId> = HashSet::new();

        loop {
            let next = {
                let mut guard = self.state.lock().await;
                let next = if cancel.is_cancelled() {
                    report.interrupted = true;
                    None
                } else {
                    Self::claim_next(&mut guard, &attempted, &mut report)
                };

                match next {
                    Some(op) => {
                        self.publish(&guard);
                        op
                    }
                    None => {
                        report.duration = start.elapsed();
                        let rerun = self.finish_pass(&mut guard, &report).await;
                        drop(guard);
                        self.wake.notify_one();
                        info!(
                            "Sync pass completed in {:?}: {} completed, {} failed, {} retried, {} conflicts{}",
                            report.duration,
                            report.completed,
                            report.failed,
                            report.retried,
                            report.conflicts,
                            if report.interrupted { " (interrupted)" } else { "" }
                        );
                        return (DrainOutcome::Finished(report), rerun);
                    }
                }
            };

            attempted.insert(next.id.clone());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.executor.execute(&next) => Some(outcome),
            };

            let mut guard = self.state.lock().await;
            self.settle(&mut guard, &next, outcome, &mut report).await;
            self.save_queue(&guard).await;
            self.publish(&guard);
        }
    }

    /// Pick the next runnable operation and mark it in progress.
    fn claim_next(
        state: &mut EngineState,
        attempted: &HashSet<OperationId>,
        report: &mut DrainReport,
    ) -> Option<SyncOperation> {
        let mut skip = attempted.clone();
        skip.extend(state.conflicts.keys().cloned());

        loop {
            let id = state.queue.next_runnable(Utc::now(), &skip)?.id.clone();
            let op = state.queue.get_mut(&id)?;

            op.mark_in_progress();
            if op.begin_attempt() {
                return Some(op.clone());
            }

            error!("Operation {} has no attempts left", op.id);
            op.mark_failed(format!(
                "Attempt limit of {} reached",
                op.max_attempts
            ));
            report.failed += 1;
            skip.insert(id);
        }
    }

    /// Record the outcome of one execution.
    async fn settle(
        &self,
        state: &mut EngineState,
        op: &SyncOperation,
        outcome: Option<ExecutionOutcome>,
        report: &mut DrainReport,
    ) {
        let Some(entry) = state.queue.get_mut(&op.id) else {
            return;
        };

        match outcome {
            None => {
                debug!("{} {} interrupted", op.op_type, op.id);
                entry.release(true);
                report.interrupted = true;
            }
            Some(ExecutionOutcome::Applied { conflict }) => {
                debug!("{} {} completed", op.op_type, op.id);
                entry.mark_completed();
                report.completed += 1;
                if conflict.is_some() {
                    report.conflicts += 1;
                }
            }
            Some(ExecutionOutcome::Superseded(_)) => {
                debug!("{} {} superseded by remote version", op.op_type, op.id);
                entry.mark_completed();
                report.completed += 1;
                report.conflicts += 1;
            }
            Some(ExecutionOutcome::Deferred(resolution)) => {
                entry.release(true);
                state.conflicts.insert(
                    op.id.clone(),
                    PendingConflict {
                        operation_id: op.id.clone(),
                        resolution,
                    },
                );
                report.conflicts += 1;
                if let Err(e) = self.save_conflicts(state).await {
                    warn!("Failed to persist sync conflicts: {}", e);
                }
            }
            Some(ExecutionOutcome::Failed(err)) => {
                if err.is_retryable() && entry.attempt < entry.max_attempts {
                    let delay = self.retry.delay_for_attempt(entry.attempt);
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(
                        "{} {} failed (attempt {}/{}), retrying in {:?}: {}",
                        op.op_type, op.id, entry.attempt, entry.max_attempts, delay, err
                    );
                    entry.mark_retry(retry_at);
                    state.retries.schedule(op.id.clone(), retry_at);
                    report.retried += 1;
                } else {
                    error!(
                        "{} {} failed permanently after {} attempt(s): {}",
                        op.op_type, op.id, entry.attempt, err
                    );
                    entry.mark_failed(err.to_string());
                    report.failed += 1;
                }
            }
        }
    }

    /// Close the pass: prune, persist and clear the draining flag.
    ///
    /// Returns whether a follow-up pass was requested.
    async fn finish_pass(&self, state: &mut EngineState, report: &DrainReport) -> bool {
        state.queue.prune_completed();
        self.save_queue(state).await;

        if !report.interrupted {
            let now = Utc::now();
            state.last_sync_at = Some(now);
            if let Err(e) = self.persistence.save_last_sync(now).await {
                warn!("Failed to persist last sync time: {}", e);
            }
        }

        state.draining = false;
        state.drain_token = None;
        state.reschedule_retries();
        self.publish(state);
        std::mem::take(&mut state.rerun_requested)
    }
}

#[async_trait]
impl SchedulerHooks for EngineInner {
    fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    fn trigger(self: Arc<Self>, trigger: SyncTrigger) {
        tokio::spawn(async move {
            let outcome = self.drain(trigger).await;
            debug!("Drain ({}) finished: {:?}", trigger, outcome);
        });
    }

    async fn next_retry_deadline(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.retries.next_deadline()
    }

    async fn take_due_retries(&self, now: DateTime<Utc>) -> usize {
        self.state.lock().await.retries.pop_due(now).len()
    }

    async fn cancel_drain(&self) {
        let state = self.state.lock().await;
        if let Some(token) = &state.drain_token {
            info!("Interrupting sync pass");
            token.cancel();
        }
    }

    async fn connectivity_changed(&self, _event: ConnectivityEvent) {
        let state = self.state.lock().await;
        self.publish(&state);
    }
}
