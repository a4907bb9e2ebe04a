//! In-memory stores for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::provider::{
    DocumentRecord, DocumentStore, FileMetadata, KeyValueStore, MetadataPatch, MetadataStore,
};
use offsync_common::{Error, Result};

/// Shared map guarded by a std lock; poisoning surfaces as a storage error.
#[derive(Debug)]
struct SharedMap<V> {
    inner: Arc<RwLock<HashMap<String, V>>>,
}

impl<V> SharedMap<V> {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, V>>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, V>>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

/// In-memory document store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryDocumentStore {
    documents: SharedMap<DocumentRecord>,
}

impl MemoryDocumentStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            documents: SharedMap::new(),
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.documents.read()?.get(id).cloned())
    }

    async fn put(&self, record: DocumentRecord) -> Result<()> {
        self.documents.write()?.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DocumentRecord>> {
        let mut records: Vec<DocumentRecord> = self.documents.read()?.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// In-memory metadata store.
pub struct MemoryMetadataStore {
    entries: SharedMap<FileMetadata>,
}

impl MemoryMetadataStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entries: SharedMap::new(),
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<FileMetadata>> {
        Ok(self.entries.read()?.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: MetadataPatch) -> Result<FileMetadata> {
        let mut entries = self.entries.write()?;
        let entry = entries
            .entry(id.to_string())
            .or_insert_with(|| FileMetadata::new(id));
        entry.apply(patch);
        Ok(entry.clone())
    }

    async fn list(&self) -> Result<Vec<FileMetadata>> {
        let mut entries: Vec<FileMetadata> = self.entries.read()?.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}

/// In-memory key-value store.
///
/// Cloning shares the underlying map, which lets tests reopen an engine
/// against the same "durable" state.
#[derive(Debug)]
pub struct MemoryKeyValueStore {
    values: SharedMap<String>,
}

impl MemoryKeyValueStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            values: SharedMap::new(),
        }
    }
}

impl Clone for MemoryKeyValueStore {
    fn clone(&self) -> Self {
        Self {
            values: SharedMap {
                inner: self.values.inner.clone(),
            },
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values.write()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.write()?.remove(key);
        Ok(())
    }
}
