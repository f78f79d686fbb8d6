//! Core identifiers and records shared by every layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque document identity.
pub type DocumentId = Uuid;

/// Identifies the editing session that produced a step.
///
/// Used for echo suppression and UI attribution only; the server never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random client id (UUID v4 text).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An edit operation in the engine's serialized format.
///
/// The sync layer treats it as bytes; only an `OperationEngine` can
/// validate or apply it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation(Vec<u8>);

impl Operation {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Operation {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// One committed operation in a document's step log.
///
/// `version` is the document version *after* this step. Steps of a
/// document are contiguous from 1 and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub version: u64,
    pub operation: Operation,
    pub origin: ClientId,
}

impl Step {
    pub fn new(version: u64, operation: Operation, origin: ClientId) -> Self {
        Self {
            version,
            operation,
            origin,
        }
    }
}

/// Authoritative `(version, content)` pair of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub version: u64,
    pub content: Vec<u8>,
}

impl DocumentSnapshot {
    pub fn new(version: u64, content: Vec<u8>) -> Self {
        Self { version, content }
    }
}
