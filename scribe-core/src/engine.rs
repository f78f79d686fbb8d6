//! The operation engine capability.
//!
//! The sync core only needs two things from an edit algebra: apply a list of
//! operations to a content snapshot, and rebase an operation over a
//! concurrently committed one. Everything else about the document format is
//! the engine's business.

use thiserror::Error;

use crate::types::{Operation, Step};

/// Which operation was ordered first when two operations touch the same
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The operation being transformed was ordered first.
    Left,
    /// The `against` operation was ordered first and wins ties.
    Right,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("malformed operation: {0}")]
    Malformed(String),
    #[error("operation out of range: {0}")]
    OutOfRange(String),
    #[error("corrupt document content: {0}")]
    CorruptContent(String),
}

/// Deterministic apply/transform over opaque operations.
///
/// `apply` must yield identical output for identical input; replaying a
/// step log through it is how every replica reaches the same content.
pub trait OperationEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Content of a document with no steps.
    fn empty_document(&self) -> Vec<u8>;

    /// Apply `operations` in order. Any invalid operation fails the whole
    /// call and the input content is left untouched.
    fn apply(&self, content: &[u8], operations: &[Operation]) -> Result<Vec<u8>, EngineError>;

    /// Rebase `op` so it applies after `against`. `None` when `op` is
    /// fully absorbed by `against`.
    fn transform(
        &self,
        op: &Operation,
        against: &Operation,
        side: Side,
    ) -> Result<Option<Operation>, EngineError>;

    /// Replay a step log onto `base`.
    fn replay(&self, base: &[u8], steps: &[Step]) -> Result<Vec<u8>, EngineError> {
        let operations: Vec<Operation> = steps.iter().map(|s| s.operation.clone()).collect();
        self.apply(base, &operations)
    }
}
