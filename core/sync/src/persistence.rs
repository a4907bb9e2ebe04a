//! Persistence of queue state on the durable key-value surface.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use offsync_common::{Error, Result};
use offsync_storage::KeyValueStore;

use crate::conflict::PendingConflict;
use crate::queue::{OperationQueue, SyncOperation};

/// Key holding the JSON array of operations.
pub const QUEUE_KEY: &str = "sync_queue";
/// Key holding the ISO-8601 time of the last completed drain.
pub const LAST_SYNC_KEY: &str = "sync_last_sync";
/// Key holding unresolved manual conflicts.
pub const CONFLICTS_KEY: &str = "sync_conflicts";

/// Serializes engine state to and from a [`KeyValueStore`].
///
/// Loading never fails on bad data: malformed values are logged and treated
/// as absent. Only store-level failures are returned.
#[derive(Clone)]
pub struct QueuePersistence {
    store: Arc<dyn KeyValueStore>,
}

impl QueuePersistence {
    /// Create an adapter over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the queue. `in_progress` operations are reset to `pending`.
    pub async fn load_queue(&self) -> Result<OperationQueue> {
        let operations: Vec<SyncOperation> = self.load_json(QUEUE_KEY).await?.unwrap_or_default();
        let mut queue = OperationQueue::from_operations(operations);

        let reset = queue.recover_interrupted();
        if reset > 0 {
            warn!("Reset {} interrupted operation(s) to pending", reset);
        }
        debug!("Restored {} queued operation(s)", queue.len());

        Ok(queue)
    }

    /// Persist the full queue.
    pub async fn save_queue(&self, queue: &OperationQueue) -> Result<()> {
        self.save_json(QUEUE_KEY, queue.operations()).await
    }

    /// Load the last sync time.
    pub async fn load_last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get(LAST_SYNC_KEY).await? else {
            return Ok(None);
        };

        match DateTime::parse_from_rfc3339(raw.trim().trim_matches('"')) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                warn!("Ignoring malformed {}: {}", LAST_SYNC_KEY, e);
                Ok(None)
            }
        }
    }

    /// Persist the last sync time.
    pub async fn save_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.store.set(LAST_SYNC_KEY, at.to_rfc3339()).await
    }

    /// Load unresolved manual conflicts.
    pub async fn load_conflicts(&self) -> Result<Vec<PendingConflict>> {
        Ok(self.load_json(CONFLICTS_KEY).await?.unwrap_or_default())
    }

    /// Persist unresolved manual conflicts. An empty list removes the key.
    pub async fn save_conflicts(&self, conflicts: &[PendingConflict]) -> Result<()> {
        if conflicts.is_empty() {
            return self.store.remove(CONFLICTS_KEY).await;
        }
        self.save_json(CONFLICTS_KEY, &conflicts).await
    }

    async fn load_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Ignoring malformed {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn save_json<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.store.set(key, json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OperationStatus, OperationType};
    use offsync_storage::MemoryKeyValueStore;
    use serde_json::Value;

    fn persistence() -> (QueuePersistence, MemoryKeyValueStore) {
        let store = MemoryKeyValueStore::new();
        (QueuePersistence::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_missing_keys_load_empty() {
        let (persistence, _) = persistence();
        assert!(persistence.load_queue().await.unwrap().is_empty());
        assert!(persistence.load_last_sync().await.unwrap().is_none());
        assert!(persistence.load_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_roundtrip_resets_in_progress() {
        let (persistence, _) = persistence();

        let mut queue = OperationQueue::new();
        let mut running = SyncOperation::new(OperationType::Update, "doc-1", Value::Null, 3);
        running.mark_in_progress();
        running.begin_attempt();
        queue.push(running);
        queue.push(SyncOperation::new(OperationType::Delete, "doc-1", Value::Null, 3));

        persistence.save_queue(&queue).await.unwrap();
        let restored = persistence.load_queue().await.unwrap();

        assert_eq!(restored.len(), 2);
        assert!(restored
            .operations()
            .iter()
            .all(|op| op.status == OperationStatus::Pending));
        assert_eq!(restored.operations()[0].op_type, OperationType::Update);
        assert_eq!(restored.operations()[0].attempt, 0);
    }

    #[tokio::test]
    async fn test_malformed_queue_is_treated_as_absent() {
        let (persistence, store) = persistence();
        store.set(QUEUE_KEY, "{definitely not json".to_string()).await.unwrap();

        let queue = persistence.load_queue().await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_last_sync_roundtrip_and_malformed() {
        let (persistence, store) = persistence();
        let now = Utc::now();

        persistence.save_last_sync(now).await.unwrap();
        assert_eq!(persistence.load_last_sync().await.unwrap(), Some(now));

        store.set(LAST_SYNC_KEY, "yesterday".to_string()).await.unwrap();
        assert!(persistence.load_last_sync().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_sync_accepts_json_string() {
        let (persistence, store) = persistence();
        store
            .set(LAST_SYNC_KEY, "\"2024-01-15T12:34:56Z\"".to_string())
            .await
            .unwrap();

        let at = persistence.load_last_sync().await.unwrap().unwrap();
        assert_eq!(at.to_rfc3339(), "2024-01-15T12:34:56+00:00");
    }

    #[tokio::test]
    async fn test_empty_conflicts_remove_key() {
        let (persistence, store) = persistence();
        store.set(CONFLICTS_KEY, "[]".to_string()).await.unwrap();

        persistence.save_conflicts(&[]).await.unwrap();
        assert!(store.get(CONFLICTS_KEY).await.unwrap().is_none());
    }
}
