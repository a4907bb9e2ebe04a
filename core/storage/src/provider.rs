//! Collaborator trait definitions and the records they exchange.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use offsync_common::{FilePath, Result};

/// A versioned document as held by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    /// Document identifier.
    pub id: String,
    /// Monotonic version, bumped on every write through the engine.
    pub version: u64,
    /// Document body.
    pub content: Value,
    /// Flat metadata fields.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted: bool,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// When the local copy was last modified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_modified: Option<DateTime<Utc>>,
    /// When the remote copy was last modified (last known).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_modified: Option<DateTime<Utc>>,
    /// Remote copy, when the store has fetched one that differs locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteVersion>,
}

impl DocumentRecord {
    /// Create a fresh record at version 1.
    pub fn new(id: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            version: 1,
            content,
            metadata: Map::new(),
            deleted: false,
            updated_at: Utc::now(),
            local_modified: None,
            remote_modified: None,
            remote: None,
        }
    }

    /// Set metadata fields.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record that local and remote now agree as of `at`.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.local_modified = Some(at);
        self.remote_modified = Some(at);
        self.remote = None;
    }
}

/// The remote side of a document that diverged from the local copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVersion {
    pub version: u64,
    pub content: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub modified: DateTime<Utc>,
}

/// Per-file attributes tracked by the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<FilePath>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_from: Option<FilePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_from: Option<String>,
}

impl FileMetadata {
    /// Create empty metadata for an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
            tags: Vec::new(),
            deleted: false,
            deleted_at: None,
            moved_from: None,
            moved_at: None,
            copied_from: None,
        }
    }

    /// Apply a partial update. Fields left as `None` are untouched.
    pub fn apply(&mut self, patch: MetadataPatch) {
        if let Some(path) = patch.path {
            self.path = Some(path);
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        if let Some(deleted) = patch.deleted {
            self.deleted = deleted;
        }
        if let Some(deleted_at) = patch.deleted_at {
            self.deleted_at = Some(deleted_at);
        }
        if let Some(moved_from) = patch.moved_from {
            self.moved_from = Some(moved_from);
        }
        if let Some(moved_at) = patch.moved_at {
            self.moved_at = Some(moved_at);
        }
        if let Some(copied_from) = patch.copied_from {
            self.copied_from = Some(copied_from);
        }
    }
}

/// Partial update for [`FileMetadata`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    pub path: Option<FilePath>,
    pub tags: Option<Vec<String>>,
    pub deleted: Option<bool>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub moved_from: Option<FilePath>,
    pub moved_at: Option<DateTime<Utc>>,
    pub copied_from: Option<String>,
}

/// Store of versioned documents, the remote authority operations are replayed against.
///
/// Implementations report unavailability as `Error::Transient` or
/// `Error::Storage` so the sync engine can retry.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Fetch a document by id.
    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>>;

    /// Insert or replace a document, keyed by `record.id`.
    async fn put(&self, record: DocumentRecord) -> Result<()>;

    /// List every stored document.
    async fn list(&self) -> Result<Vec<DocumentRecord>>;
}

/// Store of per-file attributes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch metadata by id.
    async fn get(&self, id: &str) -> Result<Option<FileMetadata>>;

    /// Merge a partial update into the metadata for `id`, creating it if absent.
    ///
    /// # Postconditions
    /// - Returns the metadata after the patch is applied
    async fn update(&self, id: &str, patch: MetadataPatch) -> Result<FileMetadata>;

    /// List every metadata entry.
    async fn list(&self) -> Result<Vec<FileMetadata>>;
}

/// Durable string key-value surface used to persist engine state.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value. Absent keys yield `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a key. Removing an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_record_serialization() {
        let record = DocumentRecord::new("doc-1", json!({"title": "Notes"}));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "doc-1");
        assert_eq!(json["version"], 1);
        assert!(json.get("localModified").is_none());
        assert!(json.get("updatedAt").is_some());

        let back: DocumentRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_metadata_patch_leaves_unset_fields() {
        let mut meta = FileMetadata::new("file-1");
        meta.tags = vec!["work".to_string()];
        meta.path = Some(FilePath::parse("/a.txt").unwrap());

        meta.apply(MetadataPatch {
            deleted: Some(true),
            ..Default::default()
        });

        assert!(meta.deleted);
        assert_eq!(meta.tags, vec!["work".to_string()]);
        assert_eq!(meta.path.unwrap().to_string_path(), "/a.txt");
    }

    #[test]
    fn test_mark_synced_clears_remote() {
        let mut record = DocumentRecord::new("doc-1", json!(null));
        record.remote = Some(RemoteVersion {
            version: 4,
            content: json!("remote"),
            metadata: Map::new(),
            modified: Utc::now(),
        });

        let now = Utc::now();
        record.mark_synced(now);
        assert!(record.remote.is_none());
        assert_eq!(record.local_modified, Some(now));
        assert_eq!(record.remote_modified, Some(now));
    }
}
