//! Binary wire protocol.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! [`ClientMessage`] upstream, [`ServerMessage`] downstream.
//!
//! ```text
//! client                          server
//!   │ Authenticate{token}           │
//!   │ Join{document_id} ──────────► │
//!   │ ◄──────── JoinAck{version, content}
//!   │ Submit{base_version, ops} ──► │
//!   │ ◄──── CommitBroadcast{from_version, steps}   (to every member)
//!   │   or  VersionMismatch{current_version}       (to submitter only)
//!   │ GetSteps{from_version} ─────► │
//!   │ ◄──────── StepsResult{steps}  │
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use scribe_core::{ClientId, DocumentId, Operation, Step};

/// Upstream messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Present a credential. Required before anything else when the server
    /// has an authorizer configured.
    Authenticate { token: String },
    Join { document_id: DocumentId },
    Leave { document_id: DocumentId },
    Submit {
        document_id: DocumentId,
        base_version: u64,
        operations: Vec<Operation>,
        client_id: ClientId,
    },
    GetSteps {
        document_id: DocumentId,
        from_version: u64,
    },
    Ping,
}

/// Downstream messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    JoinAck {
        document_id: DocumentId,
        version: u64,
        content: Vec<u8>,
    },
    /// Steps `from_version + 1 ..= from_version + steps.len()`, sent to every
    /// room member including the submitter.
    CommitBroadcast {
        document_id: DocumentId,
        from_version: u64,
        steps: Vec<Step>,
    },
    VersionMismatch {
        document_id: DocumentId,
        current_version: u64,
    },
    InvalidOperation {
        document_id: DocumentId,
        reason: String,
    },
    StepsResult {
        document_id: DocumentId,
        from_version: u64,
        steps: Vec<Step>,
    },
    Error { kind: ErrorKind, message: String },
    Pong,
}

/// Category of a [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DocumentUnavailable,
    Unauthorized,
    NotJoined,
    RoomFull,
    Timeout,
    /// The connection fell behind its room's broadcast buffer and must
    /// catch up with `GetSteps`.
    Lagged,
    Malformed,
    Internal,
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Document this message concerns, if any.
    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            Self::JoinAck { document_id, .. }
            | Self::CommitBroadcast { document_id, .. }
            | Self::VersionMismatch { document_id, .. }
            | Self::InvalidOperation { document_id, .. }
            | Self::StepsResult { document_id, .. } => Some(*document_id),
            Self::Error { .. } | Self::Pong => None,
        }
    }
}

fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_message<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_message(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_message(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message(bytes)
    }
}

/// Protocol and transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
}
