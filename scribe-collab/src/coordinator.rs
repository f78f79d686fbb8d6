//! Synchronization coordinator.
//!
//! Owns the commit protocol for every document:
//!
//! ```text
//! submit(base, ops)
//!   │ read (version, content)
//!   │ base == version?  ── no ──► VersionMismatch
//!   │ engine.apply      ── err ─► InvalidOperation
//!   │ commit_steps(base, steps, content)
//!   │                   ── conflict ─► VersionMismatch
//!   └ publish to room (ordered by the room sequencer)
//! ```
//!
//! The coordinator never retries. A rejected client catches up with
//! `get_steps`, rebases and submits again.
//!
//! A room lives only as long as its document. When the store reports a
//! document missing, or the document is deleted or created through the
//! coordinator, its room is closed so a recreated document starts with a
//! fresh commit sequence.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use scribe_core::{ClientId, DocumentId, Operation, OperationEngine, Step};

use crate::broadcast::{CommitFrame, ConnectionId, RoomError, RoomManager, Subscription};
use crate::storage::{DocumentStore, StoreError};

/// Coordinator timeouts.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bound on reading the document for a join
    pub join_timeout: Duration,
    /// Bound on a whole submit, including the commit
    pub submit_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(10),
        }
    }
}

impl CoordinatorConfig {
    pub fn for_testing() -> Self {
        Self {
            join_timeout: Duration::from_secs(2),
            submit_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("version mismatch: document is at {current_version}")]
    VersionMismatch { current_version: u64 },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("document unavailable: {0}")]
    DocumentUnavailable(DocumentId),
    #[error("room full: {0}")]
    RoomFull(DocumentId),
    #[error("operation timed out")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::DocumentUnavailable(id),
            StoreError::Conflict { actual, .. } => SyncError::VersionMismatch {
                current_version: actual,
            },
            other => SyncError::Storage(other),
        }
    }
}

impl From<RoomError> for SyncError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::Full { document_id, .. } => SyncError::RoomFull(document_id),
        }
    }
}

/// Snapshot handed to a joining connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: Vec<u8>,
}

/// Result of an accepted submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Document version after the commit
    pub version: u64,
    pub steps: Vec<Step>,
}

pub struct Coordinator {
    store: Arc<dyn DocumentStore>,
    engine: Arc<dyn OperationEngine>,
    rooms: Arc<RoomManager>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<dyn OperationEngine>,
        rooms: Arc<RoomManager>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            engine,
            rooms,
            config,
        }
    }

    /// Subscribe `connection` to the document's room and return the current
    /// snapshot.
    ///
    /// Subscribing happens before the read, so every commit after the
    /// snapshot reaches the subscription.
    pub async fn join(
        &self,
        document_id: DocumentId,
        connection: ConnectionId,
    ) -> Result<(JoinAck, Subscription), SyncError> {
        let subscription = self.rooms.join(document_id, connection)?;

        let read = tokio::time::timeout(
            self.config.join_timeout,
            self.store.read_current(document_id),
        )
        .await;
        let snapshot = match read {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(StoreError::NotFound(_))) => {
                self.rooms.close(document_id);
                return Err(SyncError::DocumentUnavailable(document_id));
            }
            Ok(Err(e)) => {
                self.rooms.leave(document_id, connection);
                return Err(e.into());
            }
            Err(_) => {
                self.rooms.leave(document_id, connection);
                log::warn!("Join of {document_id} timed out");
                return Err(SyncError::Timeout);
            }
        };
        self.rooms.seed(document_id, snapshot.version);

        log::debug!(
            "Connection {connection} joined {document_id} at version {}",
            snapshot.version
        );
        Ok((
            JoinAck {
                document_id,
                version: snapshot.version,
                content: snapshot.content,
            },
            subscription,
        ))
    }

    /// Validate, apply, commit and publish a batch based on `base_version`.
    pub async fn submit(
        &self,
        document_id: DocumentId,
        base_version: u64,
        operations: Vec<Operation>,
        origin: ClientId,
    ) -> Result<SubmitOutcome, SyncError> {
        let result = tokio::time::timeout(
            self.config.submit_timeout,
            self.submit_inner(document_id, base_version, operations, origin),
        )
        .await
        .map_err(|_| {
            log::warn!("Submit to {document_id} at base {base_version} timed out");
            SyncError::Timeout
        })?;
        self.close_if_missing(document_id, result)
    }

    async fn submit_inner(
        &self,
        document_id: DocumentId,
        base_version: u64,
        operations: Vec<Operation>,
        origin: ClientId,
    ) -> Result<SubmitOutcome, SyncError> {
        if operations.is_empty() {
            return Err(SyncError::InvalidOperation("empty submission".into()));
        }

        let snapshot = self.store.read_current(document_id).await?;
        if snapshot.version != base_version {
            log::debug!(
                "Rejected submit to {document_id}: base {base_version}, current {}",
                snapshot.version
            );
            return Err(SyncError::VersionMismatch {
                current_version: snapshot.version,
            });
        }

        let new_content = self
            .engine
            .apply(&snapshot.content, &operations)
            .map_err(|e| SyncError::InvalidOperation(e.to_string()))?;

        let steps: Vec<Step> = operations
            .into_iter()
            .enumerate()
            .map(|(i, op)| Step::new(base_version + i as u64 + 1, op, origin.clone()))
            .collect();
        let frame = CommitFrame::encode(document_id, base_version, &steps)
            .map_err(|e| SyncError::Internal(e.to_string()))?;

        let version = self
            .store
            .commit_steps(document_id, base_version, steps.clone(), new_content)
            .await?;
        // Nothing may await between the commit and the publish.
        self.rooms.publish(frame);

        log::debug!(
            "Committed {} step(s) to {document_id}: {base_version} -> {version} from {origin}",
            steps.len()
        );
        Ok(SubmitOutcome { version, steps })
    }

    /// Committed steps after `from_version`, ascending.
    pub async fn get_steps(
        &self,
        document_id: DocumentId,
        from_version: u64,
    ) -> Result<Vec<Step>, SyncError> {
        let result = self
            .store
            .read_steps_after(document_id, from_version)
            .await
            .map_err(SyncError::from);
        self.close_if_missing(document_id, result)
    }

    /// Create a document at version 0.
    ///
    /// A room still open under the same id belongs to an earlier document
    /// and is closed.
    pub async fn create_document(
        &self,
        document_id: DocumentId,
        initial_content: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.store
            .create_document(document_id, initial_content)
            .await?;
        self.rooms.close(document_id);
        Ok(())
    }

    /// Delete a document and close its room.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        let result = self.store.delete_document(document_id).await;
        if matches!(result, Ok(()) | Err(StoreError::NotFound(_))) {
            self.rooms.close(document_id);
        }
        result
    }

    fn close_if_missing<T>(
        &self,
        document_id: DocumentId,
        result: Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        if matches!(result, Err(SyncError::DocumentUnavailable(_))) {
            log::info!("Document {document_id} is gone, closing its room");
            self.rooms.close(document_id);
        }
        result
    }

    pub fn leave(&self, document_id: DocumentId, connection: ConnectionId) {
        self.rooms.leave(document_id, connection);
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        self.rooms.disconnect(connection);
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn OperationEngine> {
        &self.engine
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
