//! Yjs update engine.
//!
//! Content is a full Yjs state encoded as a v1 update; each operation is a
//! v1 update produced by a client-side `yrs`/Yjs document. Updates commute,
//! so `transform` is the identity.

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::engine::{EngineError, OperationEngine, Side};
use crate::types::Operation;

#[derive(Debug, Clone, Copy, Default)]
pub struct YrsEngine;

impl YrsEngine {
    pub fn new() -> Self {
        Self
    }

    fn load(content: &[u8]) -> Result<Doc, EngineError> {
        let doc = Doc::new();
        if !content.is_empty() {
            let update = Update::decode_v1(content)
                .map_err(|e| EngineError::CorruptContent(e.to_string()))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::CorruptContent(e.to_string()))?;
        }
        Ok(doc)
    }

    fn encode(doc: &Doc) -> Vec<u8> {
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl OperationEngine for YrsEngine {
    fn name(&self) -> &'static str {
        "yrs"
    }

    fn empty_document(&self) -> Vec<u8> {
        Self::encode(&Doc::new())
    }

    fn apply(&self, content: &[u8], operations: &[Operation]) -> Result<Vec<u8>, EngineError> {
        // Decode everything first so a bad update leaves nothing half-applied.
        let updates = operations
            .iter()
            .map(|op| {
                Update::decode_v1(op.as_bytes()).map_err(|e| EngineError::Malformed(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let doc = Self::load(content)?;
        {
            let mut txn = doc.transact_mut();
            for update in updates {
                txn.apply_update(update)
                    .map_err(|e| EngineError::Malformed(e.to_string()))?;
            }
        }
        Ok(Self::encode(&doc))
    }

    fn transform(
        &self,
        op: &Operation,
        _against: &Operation,
        _side: Side,
    ) -> Result<Option<Operation>, EngineError> {
        Ok(Some(op.clone()))
    }
}
