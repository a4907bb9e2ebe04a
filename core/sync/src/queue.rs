//! Ordered queue of pending mutation intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use offsync_common::OperationId;

use crate::conflict::ConflictStrategy;

/// Kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
    Copy,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
            OperationType::Copy => "copy",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be executed (possibly after a backoff delay).
    Pending,
    /// Currently being executed by a drain pass.
    InProgress,
    /// Applied successfully. Pruned at the end of the pass.
    Completed,
    /// Terminal failure; kept until explicitly cleared.
    Failed,
}

/// One durable mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub target_id: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub max_attempts: u32,
    /// Earliest time a retry may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Operator's answer to a manual conflict on this operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictStrategy>,
}

impl SyncOperation {
    /// Create a new pending operation.
    pub fn new(
        op_type: OperationType,
        target_id: impl Into<String>,
        payload: Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            op_type,
            target_id: target_id.into(),
            payload,
            created_at: Utc::now(),
            status: OperationStatus::Pending,
            last_error: None,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            next_attempt_at: None,
            resolution: None,
        }
    }

    /// Whether the operation reached a state it never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Completed | OperationStatus::Failed
        )
    }

    /// Whether a pending operation may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Mark as picked up by a drain pass.
    pub fn mark_in_progress(&mut self) {
        if self.status == OperationStatus::Pending {
            self.status = OperationStatus::InProgress;
        }
    }

    /// Count one execution. Returns false if the attempt budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempt >= self.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    /// Mark as completed successfully.
    pub fn mark_completed(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = OperationStatus::Completed;
        self.last_error = None;
        self.next_attempt_at = None;
    }

    /// Mark as terminally failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = OperationStatus::Failed;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
    }

    /// Return to pending, to be re-run no earlier than `retry_at`.
    pub fn mark_retry(&mut self, retry_at: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.status = OperationStatus::Pending;
        self.next_attempt_at = Some(retry_at);
    }

    /// Return to pending without charging the attempt that was started.
    ///
    /// Used when execution was interrupted or deferred rather than failed.
    /// Any backoff deadline is dropped: the operation was already due when it
    /// was claimed.
    pub fn release(&mut self, attempt_started: bool) {
        if self.is_terminal() {
            return;
        }
        self.status = OperationStatus::Pending;
        self.next_attempt_at = None;
        if attempt_started {
            self.attempt = self.attempt.saturating_sub(1);
        }
    }
}

/// FIFO queue of sync operations.
///
/// Operations on the same `target_id` always run in insertion order; a
/// pending operation that cannot run yet holds back every later operation
/// on its target.
#[derive(Debug, Clone, Default)]
pub struct OperationQueue {
    operations: Vec<SyncOperation>,
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue from previously persisted operations.
    pub fn from_operations(operations: Vec<SyncOperation>) -> Self {
        Self { operations }
    }

    /// Append an operation.
    pub fn push(&mut self, operation: SyncOperation) {
        self.operations.push(operation);
    }

    /// Copy of the queue in FIFO order.
    pub fn snapshot(&self) -> Vec<SyncOperation> {
        self.operations.clone()
    }

    /// Borrow the operations in FIFO order.
    pub fn operations(&self) -> &[SyncOperation] {
        &self.operations
    }

    /// Get an operation by id.
    pub fn get(&self, id: &OperationId) -> Option<&SyncOperation> {
        self.operations.iter().find(|op| &op.id == id)
    }

    /// Get a mutable operation by id.
    pub fn get_mut(&mut self, id: &OperationId) -> Option<&mut SyncOperation> {
        self.operations.iter_mut().find(|op| &op.id == id)
    }

    /// Delete the given operations. Returns how many were removed.
    pub fn remove(&mut self, ids: &[OperationId]) -> usize {
        let before = self.operations.len();
        self.operations.retain(|op| !ids.contains(&op.id));
        before - self.operations.len()
    }

    /// Remove every completed operation.
    pub fn prune_completed(&mut self) -> usize {
        let before = self.operations.len();
        self.operations
            .retain(|op| op.status != OperationStatus::Completed);
        before - self.operations.len()
    }

    /// Remove every terminally failed operation.
    pub fn clear_failed(&mut self) -> usize {
        let before = self.operations.len();
        self.operations.retain(|op| op.status != OperationStatus::Failed);
        before - self.operations.len()
    }

    /// First operation that may run now.
    ///
    /// Skips anything in `skip` (already attempted this pass, or held by a
    /// manual conflict); a skipped, not-yet-due or in-flight operation blocks
    /// later operations on the same target.
    pub fn next_runnable(
        &self,
        now: DateTime<Utc>,
        skip: &HashSet<OperationId>,
    ) -> Option<&SyncOperation> {
        let mut blocked: HashSet<&str> = HashSet::new();

        for op in &self.operations {
            match op.status {
                OperationStatus::Completed | OperationStatus::Failed => continue,
                OperationStatus::InProgress => {
                    blocked.insert(op.target_id.as_str());
                    continue;
                }
                OperationStatus::Pending => {}
            }

            if blocked.contains(op.target_id.as_str()) {
                continue;
            }

            if skip.contains(&op.id) || !op.is_due(now) {
                blocked.insert(op.target_id.as_str());
                continue;
            }

            return Some(op);
        }

        None
    }

    /// Reset operations left `in_progress` by an interrupted run.
    ///
    /// Returns how many were reset.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut reset = 0;
        for op in &mut self.operations {
            if op.status == OperationStatus::InProgress {
                op.release(op.attempt > 0);
                reset += 1;
            }
        }
        reset
    }

    /// Pending and in-progress operations.
    pub fn pending_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::InProgress
                )
            })
            .count()
    }

    /// Terminally failed operations.
    pub fn failed_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .count()
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
