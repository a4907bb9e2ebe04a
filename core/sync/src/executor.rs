//! Dispatch of queued operations to the document and metadata stores.
//!
//! Every handler is safe to re-run after a crash mid-operation: create and
//! update are upserts keyed by target id, delete is a soft-delete marker,
//! move and copy check whether their effect is already in place.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use offsync_common::{Error, FilePath, Result};
use offsync_storage::{DocumentRecord, DocumentStore, MetadataPatch, MetadataStore};

use crate::conflict::{ConflictResolution, ConflictResolver, ResolutionAction};
use crate::queue::{OperationType, SyncOperation};

/// Payload of create and update operations.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentPayload {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

/// Payload of move operations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovePayload {
    old_path: FilePath,
    new_path: FilePath,
}

/// Payload of copy operations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyPayload {
    source_id: String,
    new_id: String,
}

fn parse_payload<T: serde::de::DeserializeOwned>(op: &SyncOperation) -> Result<T> {
    serde_json::from_value(op.payload.clone()).map_err(|e| {
        Error::InvalidInput(format!("Invalid {} payload for {}: {}", op.op_type, op.id, e))
    })
}

/// Result of executing one operation.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The operation's effect is now in place.
    Applied {
        /// Automatic conflict resolution applied along the way, if any.
        conflict: Option<ConflictResolution>,
    },
    /// A conflict was resolved in favour of the remote version; the
    /// operation is done without applying its change.
    Superseded(ConflictResolution),
    /// A conflict needs an operator; nothing was changed.
    Deferred(ConflictResolution),
    /// The handler failed.
    Failed(Error),
}

/// Executes operations against the collaborator stores.
pub struct SyncExecutor {
    documents: Arc<dyn DocumentStore>,
    metadata: Arc<dyn MetadataStore>,
    resolver: ConflictResolver,
}

impl SyncExecutor {
    /// Create an executor.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        metadata: Arc<dyn MetadataStore>,
        resolver: ConflictResolver,
    ) -> Self {
        Self {
            documents,
            metadata,
            resolver,
        }
    }

    /// Execute one operation.
    pub async fn execute(&self, op: &SyncOperation) -> ExecutionOutcome {
        debug!("Executing {} {} on {}", op.op_type, op.id, op.target_id);

        let result = match op.op_type {
            OperationType::Create => self.apply_create(op).await,
            OperationType::Update => return self.apply_update(op).await,
            OperationType::Delete => self.apply_delete(op).await,
            OperationType::Move => self.apply_move(op).await,
            OperationType::Copy => self.apply_copy(op).await,
        };

        match result {
            Ok(()) => ExecutionOutcome::Applied { conflict: None },
            Err(e) => ExecutionOutcome::Failed(e),
        }
    }

    async fn apply_create(&self, op: &SyncOperation) -> Result<()> {
        let payload: DocumentPayload = parse_payload(op)?;
        let existing = self.documents.get(&op.target_id).await?;
        let record = Self::upsert(existing, &op.target_id, payload);
        self.documents.put(record).await
    }

    async fn apply_update(&self, op: &SyncOperation) -> ExecutionOutcome {
        let payload: DocumentPayload = match parse_payload(op) {
            Ok(payload) => payload,
            Err(e) => return ExecutionOutcome::Failed(e),
        };

        let existing = match self.documents.get(&op.target_id).await {
            Ok(existing) => existing,
            Err(e) => return ExecutionOutcome::Failed(e),
        };

        let mut conflict = None;
        let base = match existing {
            Some(record) => {
                // An operator's choice replaces the configured default.
                let strategy = op.resolution.unwrap_or(self.resolver.default_strategy());
                match self.resolver.detect_with(&record, strategy) {
                    None => Some(record),
                    Some(resolution) => match self.resolver.resolve(&record, strategy) {
                        ResolutionAction::Defer => {
                            info!("Conflict on {} needs manual resolution", op.target_id);
                            return ExecutionOutcome::Deferred(resolution);
                        }
                        ResolutionAction::Replace(remote) => {
                            info!("Conflict on {} resolved with remote version", op.target_id);
                            return match self.documents.put(remote).await {
                                Ok(()) => ExecutionOutcome::Superseded(resolution),
                                Err(e) => ExecutionOutcome::Failed(e),
                            };
                        }
                        ResolutionAction::Continue(resolved) => {
                            debug!("Conflict on {} resolved as {}", op.target_id, strategy);
                            conflict = Some(resolution);
                            Some(resolved)
                        }
                    },
                }
            }
            None => None,
        };

        let record = Self::upsert(base, &op.target_id, payload);
        match self.documents.put(record).await {
            Ok(()) => ExecutionOutcome::Applied { conflict },
            Err(e) => ExecutionOutcome::Failed(e),
        }
    }

    async fn apply_delete(&self, op: &SyncOperation) -> Result<()> {
        let mut record = self
            .documents
            .get(&op.target_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Document not found: {}", op.target_id)))?;

        let now = Utc::now();
        if !record.deleted {
            record.deleted = true;
            record.version += 1;
            record.mark_synced(now);
            self.documents.put(record).await?;
        }

        let already_marked = matches!(
            self.metadata.get(&op.target_id).await?,
            Some(meta) if meta.deleted
        );
        if !already_marked {
            self.metadata
                .update(
                    &op.target_id,
                    MetadataPatch {
                        deleted: Some(true),
                        deleted_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn apply_move(&self, op: &SyncOperation) -> Result<()> {
        let payload: MovePayload = parse_payload(op)?;
        let meta = self
            .metadata
            .get(&op.target_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Metadata not found: {}", op.target_id)))?;

        if meta.path.as_ref() == Some(&payload.new_path) {
            debug!("{} already at {}", op.target_id, payload.new_path);
            return Ok(());
        }

        self.metadata
            .update(
                &op.target_id,
                MetadataPatch {
                    path: Some(payload.new_path),
                    moved_from: Some(payload.old_path),
                    moved_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn apply_copy(&self, op: &SyncOperation) -> Result<()> {
        let payload: CopyPayload = parse_payload(op)?;

        if self.documents.get(&payload.new_id).await?.is_some() {
            debug!("Copy target {} already exists", payload.new_id);
            return Ok(());
        }

        let source = self
            .documents
            .get(&payload.source_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Copy source not found: {}", payload.source_id)))?;

        let mut copy = DocumentRecord::new(payload.new_id.clone(), source.content)
            .with_metadata(source.metadata);
        copy.mark_synced(Utc::now());
        self.documents.put(copy).await?;

        let source_meta = self.metadata.get(&payload.source_id).await?;
        self.metadata
            .update(
                &payload.new_id,
                MetadataPatch {
                    tags: source_meta.map(|m| m.tags),
                    copied_from: Some(payload.source_id),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Apply a create/update payload on top of an existing record, or start a new one.
    fn upsert(existing: Option<DocumentRecord>, id: &str, payload: DocumentPayload) -> DocumentRecord {
        let mut record = match existing {
            Some(mut record) => {
                record.version += 1;
                record
            }
            None => DocumentRecord::new(id, Value::Null),
        };

        if let Some(content) = payload.content {
            record.content = content;
        }
        if let Some(metadata) = payload.metadata {
            for (key, value) in metadata {
                record.metadata.insert(key, value);
            }
        }
        record.deleted = false;
        record.mark_synced(Utc::now());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use offsync_storage::{MemoryDocumentStore, MemoryMetadataStore, RemoteVersion};
    use serde_json::json;

    struct Fixture {
        documents: Arc<MemoryDocumentStore>,
        metadata: Arc<MemoryMetadataStore>,
        executor: SyncExecutor,
    }

    fn fixture(strategy: ConflictStrategy) -> Fixture {
        let documents = Arc::new(MemoryDocumentStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let executor = SyncExecutor::new(
            documents.clone(),
            metadata.clone(),
            ConflictResolver::new(strategy, std::time::Duration::from_secs(1)),
        );
        Fixture {
            documents,
            metadata,
            executor,
        }
    }

    fn op(op_type: OperationType, target: &str, payload: Value) -> SyncOperation {
        SyncOperation::new(op_type, target, payload, 3)
    }

    async fn seed_conflict(documents: &MemoryDocumentStore) {
        let now = Utc::now();
        let mut record = DocumentRecord::new("doc-1", json!("local"));
        record.local_modified = Some(now);
        record.remote_modified = Some(now - chrono::Duration::seconds(60));
        record.remote = Some(RemoteVersion {
            version: 9,
            content: json!("remote"),
            metadata: Map::new(),
            modified: now - chrono::Duration::seconds(60),
        });
        documents.put(record).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_is_upsert() {
        let f = fixture(ConflictStrategy::Manual);
        let create = op(OperationType::Create, "doc-1", json!({"content": "v1"}));

        assert!(matches!(
            f.executor.execute(&create).await,
            ExecutionOutcome::Applied { .. }
        ));
        assert!(matches!(
            f.executor.execute(&create).await,
            ExecutionOutcome::Applied { .. }
        ));

        let record = f.documents.get("doc-1").await.unwrap().unwrap();
        assert_eq!(record.content, json!("v1"));
        assert_eq!(f.documents.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_metadata_and_bumps_version() {
        let f = fixture(ConflictStrategy::Manual);
        f.executor
            .execute(&op(
                OperationType::Create,
                "doc-1",
                json!({"content": "v1", "metadata": {"title": "a"}}),
            ))
            .await;
        f.executor
            .execute(&op(
                OperationType::Update,
                "doc-1",
                json!({"metadata": {"tag": "b"}}),
            ))
            .await;

        let record = f.documents.get("doc-1").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.content, json!("v1"));
        assert_eq!(record.metadata["title"], json!("a"));
        assert_eq!(record.metadata["tag"], json!("b"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let f = fixture(ConflictStrategy::Manual);
        let outcome = f
            .executor
            .execute(&op(OperationType::Delete, "ghost", Value::Null))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Failed(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_twice_is_idempotent() {
        let f = fixture(ConflictStrategy::Manual);
        f.documents
            .put(DocumentRecord::new("doc-1", json!("body")))
            .await
            .unwrap();

        let delete = op(OperationType::Delete, "doc-1", Value::Null);
        f.executor.execute(&delete).await;
        let first = f.documents.get("doc-1").await.unwrap().unwrap();
        let first_meta = f.metadata.get("doc-1").await.unwrap().unwrap();

        f.executor.execute(&delete).await;
        let second = f.documents.get("doc-1").await.unwrap().unwrap();
        let second_meta = f.metadata.get("doc-1").await.unwrap().unwrap();

        assert!(second.deleted);
        assert_eq!(first.version, second.version);
        assert!(second_meta.deleted);
        assert_eq!(first_meta.deleted_at, second_meta.deleted_at);
    }

    #[tokio::test]
    async fn test_move_records_provenance_once() {
        let f = fixture(ConflictStrategy::Manual);
        f.metadata
            .update(
                "file-1",
                MetadataPatch {
                    path: Some(FilePath::parse("/inbox/a.md").unwrap()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mv = op(
            OperationType::Move,
            "file-1",
            json!({"oldPath": "/inbox/a.md", "newPath": "/archive/a.md"}),
        );
        f.executor.execute(&mv).await;
        let moved = f.metadata.get("file-1").await.unwrap().unwrap();
        f.executor.execute(&mv).await;
        let again = f.metadata.get("file-1").await.unwrap().unwrap();

        assert_eq!(moved.path.as_ref().unwrap().to_string_path(), "/archive/a.md");
        assert_eq!(moved.moved_from.as_ref().unwrap().to_string_path(), "/inbox/a.md");
        assert_eq!(moved.moved_at, again.moved_at);
    }

    #[tokio::test]
    async fn test_move_with_bad_payload_is_invalid_input() {
        let f = fixture(ConflictStrategy::Manual);
        let outcome = f
            .executor
            .execute(&op(OperationType::Move, "file-1", json!({"newPath": "/x"})))
            .await;
        match outcome {
            ExecutionOutcome::Failed(e) => assert!(!e.is_retryable()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_guards_against_duplicates() {
        let f = fixture(ConflictStrategy::Manual);
        f.documents
            .put(DocumentRecord::new("src", json!("original")))
            .await
            .unwrap();

        let copy = op(
            OperationType::Copy,
            "src",
            json!({"sourceId": "src", "newId": "dst"}),
        );
        f.executor.execute(&copy).await;

        // Source changes after the first copy landed; a retried copy must not overwrite.
        let mut source = f.documents.get("src").await.unwrap().unwrap();
        source.content = json!("edited");
        f.documents.put(source).await.unwrap();
        f.executor.execute(&copy).await;

        let dst = f.documents.get("dst").await.unwrap().unwrap();
        assert_eq!(dst.content, json!("original"));
        assert_eq!(
            f.metadata.get("dst").await.unwrap().unwrap().copied_from.as_deref(),
            Some("src")
        );
    }

    #[tokio::test]
    async fn test_update_defers_on_manual_conflict() {
        let f = fixture(ConflictStrategy::Manual);
        seed_conflict(&f.documents).await;

        let update = op(OperationType::Update, "doc-1", json!({"content": "new"}));
        let outcome = f.executor.execute(&update).await;
        assert!(matches!(outcome, ExecutionOutcome::Deferred(_)));

        let record = f.documents.get("doc-1").await.unwrap().unwrap();
        assert_eq!(record.content, json!("local"));
    }

    #[tokio::test]
    async fn test_update_keep_remote_supersedes() {
        let f = fixture(ConflictStrategy::KeepRemote);
        seed_conflict(&f.documents).await;

        let update = op(OperationType::Update, "doc-1", json!({"content": "new"}));
        let outcome = f.executor.execute(&update).await;
        assert!(matches!(outcome, ExecutionOutcome::Superseded(_)));

        let record = f.documents.get("doc-1").await.unwrap().unwrap();
        assert_eq!(record.content, json!("remote"));
        assert_eq!(record.version, 9);
    }

    #[tokio::test]
    async fn test_operator_resolution_overrides_default() {
        let f = fixture(ConflictStrategy::Manual);
        seed_conflict(&f.documents).await;

        let mut update = op(OperationType::Update, "doc-1", json!({"content": "new"}));
        update.resolution = Some(ConflictStrategy::KeepLocal);

        let outcome = f.executor.execute(&update).await;
        match outcome {
            ExecutionOutcome::Applied { conflict } => {
                assert_eq!(conflict.unwrap().strategy, ConflictStrategy::KeepLocal);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let record = f.documents.get("doc-1").await.unwrap().unwrap();
        assert_eq!(record.content, json!("new"));
        assert!(record.remote.is_none());
    }
}
