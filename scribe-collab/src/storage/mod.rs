//! Persistent storage for documents and their step logs.
//!
//! ```text
//! ┌─────────────┐  commit_steps   ┌────────────────────────────────┐
//! │ Coordinator │ ──────────────► │ DocumentStore                  │
//! └─────────────┘  read_current   │  (version, content) per doc    │
//!                  read_steps     │  step log, contiguous from 1   │
//!                                 └───────┬───────────────┬────────┘
//!                                         ▼               ▼
//!                                   MemoryStore      RocksStore
//! ```
//!
//! `commit_steps` is the only way a document changes. It is a
//! compare-and-commit: the steps and the new content land together, and only
//! if the stored version still equals `expected_base`.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use scribe_core::{DocumentId, DocumentSnapshot, Step};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored version moved past `expected` before the commit landed.
    #[error("version conflict: expected {expected}, stored {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("document already exists: {0}")]
    AlreadyExists(DocumentId),
    /// Concurrent writes kept winning over this one.
    #[error("document {0} is busy with concurrent writes")]
    Contended(DocumentId),
    #[error("non-contiguous steps: expected version {expected}, got {found}")]
    NonContiguous { expected: u64, found: u64 },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

/// Bookkeeping kept next to each document. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    pub version: u64,
    pub step_count: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Stored content size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    pub(crate) fn new(document_id: DocumentId, content_size: u64, compressed_size: u64) -> Self {
        let now = now_secs();
        Self {
            document_id,
            version: 0,
            step_count: 0,
            content_size,
            compressed_size,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a commit of `steps` bringing the document to `version`.
    pub(crate) fn record_commit(
        &mut self,
        version: u64,
        steps: u64,
        content_size: u64,
        compressed_size: u64,
    ) {
        self.version = version;
        self.step_count += steps;
        self.content_size = content_size;
        self.compressed_size = compressed_size;
        self.updated_at = now_secs();
    }
}

/// Persistence contract for documents and step logs.
///
/// Implementations serialise commits per document and never across
/// documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document at version 0 with `initial_content`.
    async fn create_document(
        &self,
        document_id: DocumentId,
        initial_content: Vec<u8>,
    ) -> Result<(), StoreError>;

    /// Remove a document, its metadata and its whole step log.
    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError>;

    /// Current `(version, content)`, read atomically.
    async fn read_current(&self, document_id: DocumentId) -> Result<DocumentSnapshot, StoreError>;

    /// Append `steps` and replace the content, if the stored version is
    /// still `expected_base`. Steps must carry versions
    /// `expected_base + 1 ..= expected_base + steps.len()`.
    ///
    /// Returns the new version. An empty batch only checks the version.
    async fn commit_steps(
        &self,
        document_id: DocumentId,
        expected_base: u64,
        steps: Vec<Step>,
        new_content: Vec<u8>,
    ) -> Result<u64, StoreError>;

    /// Steps with `version > from_version`, ascending.
    async fn read_steps_after(
        &self,
        document_id: DocumentId,
        from_version: u64,
    ) -> Result<Vec<Step>, StoreError>;

    async fn metadata(&self, document_id: DocumentId) -> Result<DocumentMetadata, StoreError>;

    async fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// Check that `steps` continue the log right after `expected_base`.
pub(crate) fn check_contiguous(expected_base: u64, steps: &[Step]) -> Result<(), StoreError> {
    for (i, step) in steps.iter().enumerate() {
        let expected = expected_base + i as u64 + 1;
        if step.version != expected {
            return Err(StoreError::NonContiguous {
                expected,
                found: step.version,
            });
        }
    }
    Ok(())
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
