//! In-memory document store.
//!
//! Each document sits behind its own `RwLock`; the outer map lock is only
//! held long enough to look a document up, so commits to different
//! documents never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use scribe_core::{DocumentId, DocumentSnapshot, Step};

use super::{check_contiguous, DocumentMetadata, DocumentStore, StoreError};

struct MemoryDocument {
    version: u64,
    content: Vec<u8>,
    steps: Vec<Step>,
    metadata: DocumentMetadata,
    /// Set when the document is removed while a caller still holds it.
    deleted: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, Arc<RwLock<MemoryDocument>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn document(
        &self,
        document_id: DocumentId,
    ) -> Result<Arc<RwLock<MemoryDocument>>, StoreError> {
        self.documents
            .read()
            .await
            .get(&document_id)
            .cloned()
            .ok_or(StoreError::NotFound(document_id))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(
        &self,
        document_id: DocumentId,
        initial_content: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&document_id) {
            return Err(StoreError::AlreadyExists(document_id));
        }
        let size = initial_content.len() as u64;
        let doc = MemoryDocument {
            version: 0,
            content: initial_content,
            steps: Vec::new(),
            metadata: DocumentMetadata::new(document_id, size, size),
            deleted: false,
        };
        documents.insert(document_id, Arc::new(RwLock::new(doc)));
        log::debug!("Created document {document_id}");
        Ok(())
    }

    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        let removed = self
            .documents
            .write()
            .await
            .remove(&document_id)
            .ok_or(StoreError::NotFound(document_id))?;
        removed.write().await.deleted = true;
        log::debug!("Deleted document {document_id}");
        Ok(())
    }

    async fn read_current(&self, document_id: DocumentId) -> Result<DocumentSnapshot, StoreError> {
        let doc = self.document(document_id).await?;
        let doc = doc.read().await;
        if doc.deleted {
            return Err(StoreError::NotFound(document_id));
        }
        Ok(DocumentSnapshot::new(doc.version, doc.content.clone()))
    }

    async fn commit_steps(
        &self,
        document_id: DocumentId,
        expected_base: u64,
        steps: Vec<Step>,
        new_content: Vec<u8>,
    ) -> Result<u64, StoreError> {
        check_contiguous(expected_base, &steps)?;

        let doc = self.document(document_id).await?;
        let mut doc = doc.write().await;
        if doc.deleted {
            return Err(StoreError::NotFound(document_id));
        }
        if doc.version != expected_base {
            return Err(StoreError::Conflict {
                expected: expected_base,
                actual: doc.version,
            });
        }
        if steps.is_empty() {
            return Ok(doc.version);
        }

        let new_version = expected_base + steps.len() as u64;
        let size = new_content.len() as u64;
        let count = steps.len() as u64;
        doc.steps.extend(steps);
        doc.content = new_content;
        doc.version = new_version;
        doc.metadata.record_commit(new_version, count, size, size);
        Ok(new_version)
    }

    async fn read_steps_after(
        &self,
        document_id: DocumentId,
        from_version: u64,
    ) -> Result<Vec<Step>, StoreError> {
        let doc = self.document(document_id).await?;
        let doc = doc.read().await;
        if doc.deleted {
            return Err(StoreError::NotFound(document_id));
        }
        // Step n sits at index n - 1.
        let start = usize::try_from(from_version)
            .unwrap_or(usize::MAX)
            .min(doc.steps.len());
        Ok(doc.steps[start..].to_vec())
    }

    async fn metadata(&self, document_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let doc = self.document(document_id).await?;
        let doc = doc.read().await;
        Ok(doc.metadata.clone())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.documents.read().await.keys().copied().collect())
    }
}
