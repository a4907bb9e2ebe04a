//! Common utilities and types shared across Offsync modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the error taxonomy the sync engine classifies failures with, and the
//! identifier and path types carried by queued operations.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{FilePath, OperationId};
