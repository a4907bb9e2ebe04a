//! Offsync Sync Engine
//!
//! This module provides offline operation synchronization, including:
//! - A durable FIFO queue of mutation intents, ordered per target
//! - Replay against document and metadata stores with retry and backoff
//! - Conflict detection and resolution
//! - Connectivity-driven, periodic and manual drain scheduling
//! - Status snapshots pushed to subscribers

pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod executor;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod status;

// Re-export main types
pub use config::SyncConfig;
pub use conflict::{
    ConflictResolution, ConflictResolver, ConflictStrategy, PendingConflict, ResolutionAction,
};
pub use connectivity::{ConnectivityEvent, ConnectivityEvents, ConnectivityMonitor};
pub use engine::{DrainOutcome, DrainReport, ExportState, SyncEngine};
pub use executor::{ExecutionOutcome, SyncExecutor};
pub use persistence::{QueuePersistence, CONFLICTS_KEY, LAST_SYNC_KEY, QUEUE_KEY};
pub use queue::{OperationQueue, OperationStatus, OperationType, SyncOperation};
pub use retry::{RetryConfig, RetryScheduler};
pub use scheduler::{SchedulerHooks, SyncScheduler, SyncTrigger};
pub use status::{StatusNotifier, Subscription, SyncStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _queue = OperationQueue::new();
        let _monitor = ConnectivityMonitor::default();
        let _status = SyncStatus::default();
    }
}
