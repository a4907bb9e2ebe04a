//! Collaborator abstractions consumed by the Offsync engine.
//!
//! This module provides trait-based interfaces for the stores the sync
//! engine replays operations against, plus in-memory and local-directory
//! implementations.
//!
//! # Design Principles
//! - Store isolation: No store-specific logic in the sync engine
//! - Async operations: All I/O operations are async
//! - Unified error semantics: unavailability is reported as retryable errors

pub mod provider;
pub mod memory;
pub mod local;

pub use provider::{
    DocumentRecord, DocumentStore, FileMetadata, KeyValueStore, MetadataPatch, MetadataStore,
    RemoteVersion,
};
pub use memory::{MemoryDocumentStore, MemoryKeyValueStore, MemoryMetadataStore};
pub use local::{LocalDocumentStore, LocalKeyValueStore, LocalMetadataStore};
