//! Local filesystem stores.
//!
//! Each store keeps one JSON file per key inside its own directory. Keys are
//! percent-encoded into file names so arbitrary ids stay on one path level.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::provider::{
    DocumentRecord, DocumentStore, FileMetadata, KeyValueStore, MetadataPatch, MetadataStore,
};
use offsync_common::{Error, Result};

const ENTRY_EXTENSION: &str = "json";

/// A directory holding one file per key.
#[derive(Debug, Clone)]
struct EntryDir {
    root: PathBuf,
}

impl EntryDir {
    fn new(root: PathBuf) -> Result<Self> {
        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        self.root.join(format!("{}.{}", encoded, ENTRY_EXTENSION))
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.entry_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write via a temporary file and rename so readers never see a torn entry.
    async fn write(&self, key: &str, content: &str) -> Result<()> {
        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match percent_decode_str(stem).decode_utf8() {
                Ok(key) => keys.push(key.into_owned()),
                Err(_) => warn!("Skipping undecodable entry {}", path.display()),
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read(key).await? {
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.write(key, &json).await
    }

    async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for key in self.keys().await? {
            if let Some(value) = self.read_json(&key).await? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

/// Document store persisting each document as a JSON file.
pub struct LocalDocumentStore {
    dir: EntryDir,
}

impl LocalDocumentStore {
    /// Create a store rooted at the given directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            dir: EntryDir::new(root.as_ref().to_path_buf())?,
        })
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>> {
        self.dir.read_json(id).await
    }

    async fn put(&self, record: DocumentRecord) -> Result<()> {
        self.dir.write_json(&record.id, &record).await
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>> {
        self.dir.read_all().await
    }
}

/// Metadata store persisting each entry as a JSON file.
pub struct LocalMetadataStore {
    dir: EntryDir,
}

impl LocalMetadataStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            dir: EntryDir::new(root.as_ref().to_path_buf())?,
        })
    }
}

#[async_trait]
impl MetadataStore for LocalMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<FileMetadata>> {
        self.dir.read_json(id).await
    }

    async fn update(&self, id: &str, patch: MetadataPatch) -> Result<FileMetadata> {
        let mut meta = self
            .dir
            .read_json::<FileMetadata>(id)
            .await?
            .unwrap_or_else(|| FileMetadata::new(id));
        meta.apply(patch);
        self.dir.write_json(id, &meta).await?;
        Ok(meta)
    }

    async fn list(&self) -> Result<Vec<FileMetadata>> {
        self.dir.read_all().await
    }
}

/// Key-value store keeping raw string values in files.
pub struct LocalKeyValueStore {
    dir: EntryDir,
}

impl LocalKeyValueStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            dir: EntryDir::new(root.as_ref().to_path_buf())?,
        })
    }
}

#[async_trait]
impl KeyValueStore for LocalKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.dir.read(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.dir.write(key, &value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.dir.remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::FilePath;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_document_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = LocalDocumentStore::new(temp.path().join("documents")).unwrap();

        store
            .put(DocumentRecord::new("notes/today", json!({"text": "hi"})))
            .await
            .unwrap();

        let record = store.get("notes/today").await.unwrap().unwrap();
        assert_eq!(record.content["text"], "hi");
        assert!(store.get("missing").await.unwrap().is_none());

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "notes/today");
    }

    #[tokio::test]
    async fn test_local_metadata_update_persists() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("metadata");

        {
            let store = LocalMetadataStore::new(&root).unwrap();
            store
                .update(
                    "file-1",
                    MetadataPatch {
                        path: Some(FilePath::parse("/a/b.txt").unwrap()),
                        tags: Some(vec!["draft".to_string()]),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let store = LocalMetadataStore::new(&root).unwrap();
        let meta = store.get("file-1").await.unwrap().unwrap();
        assert_eq!(meta.tags, vec!["draft".to_string()]);
        assert_eq!(meta.path.unwrap().to_string_path(), "/a/b.txt");
    }

    #[tokio::test]
    async fn test_local_key_value() {
        let temp = TempDir::new().unwrap();
        let store = LocalKeyValueStore::new(temp.path()).unwrap();

        assert!(store.get("sync_queue").await.unwrap().is_none());
        store.set("sync_queue", "[]".to_string()).await.unwrap();
        assert_eq!(store.get("sync_queue").await.unwrap().as_deref(), Some("[]"));

        store.remove("sync_queue").await.unwrap();
        store.remove("sync_queue").await.unwrap();
        assert!(store.get("sync_queue").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_serialization_error() {
        let temp = TempDir::new().unwrap();
        let store = LocalDocumentStore::new(temp.path()).unwrap();
        std::fs::write(temp.path().join("doc.json"), "{not json").unwrap();

        let err = store.get("doc").await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
