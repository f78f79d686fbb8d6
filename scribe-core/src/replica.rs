//! Client-side document replica.
//!
//! Tracks the last confirmed server state plus the local operations that
//! have not been committed yet:
//!
//! ```text
//!   confirmed (version v) ── pending[0] ── pending[1] ── ... ──► content
//! ```
//!
//! Foreign steps advance `confirmed` and rebase `pending` over themselves.
//! Our own steps coming back from the server confirm the head of `pending`.
//! The replica is transport-free; a connection layer decides when to send
//! [`Replica::sendable`] and when to fetch missing steps.

use std::sync::Arc;

use crate::engine::{EngineError, OperationEngine, Side};
use crate::types::{ClientId, Operation, Step};

/// Result of feeding committed steps to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Steps were applied. Counts exclude steps already known.
    Applied { remote: usize, confirmed: usize },
    /// Every step was at or below the local version.
    Stale,
    /// The first new step does not follow the local version; fetch the
    /// steps after `from_version` first.
    NeedsCatchUp { from_version: u64 },
}

pub struct Replica {
    engine: Arc<dyn OperationEngine>,
    client_id: ClientId,
    version: u64,
    confirmed: Vec<u8>,
    pending: Vec<Operation>,
    content: Vec<u8>,
}

impl Replica {
    /// Replica of a document at `version` with `content`.
    pub fn new(
        engine: Arc<dyn OperationEngine>,
        client_id: ClientId,
        version: u64,
        content: Vec<u8>,
    ) -> Self {
        Self {
            engine,
            client_id,
            version,
            confirmed: content.clone(),
            pending: Vec::new(),
            content,
        }
    }

    /// Replica of an empty, never-edited document.
    pub fn empty(engine: Arc<dyn OperationEngine>, client_id: ClientId) -> Self {
        let content = engine.empty_document();
        Self::new(engine, client_id, 0, content)
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Last server version this replica has incorporated.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Local view: confirmed content with pending operations applied.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn confirmed_content(&self) -> &[u8] {
        &self.confirmed
    }

    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply a local edit. Rejected edits leave the replica unchanged.
    pub fn apply_local(&mut self, op: Operation) -> Result<(), EngineError> {
        self.content = self
            .engine
            .apply(&self.content, std::slice::from_ref(&op))?;
        self.pending.push(op);
        Ok(())
    }

    /// Base version and operations to submit, if anything is pending.
    pub fn sendable(&self) -> Option<(u64, Vec<Operation>)> {
        self.has_pending()
            .then(|| (self.version, self.pending.clone()))
    }

    /// Incorporate committed steps in version order.
    ///
    /// All or nothing: if any step fails to apply or rebase, the replica is
    /// left exactly as it was.
    pub fn receive(&mut self, steps: &[Step]) -> Result<ReceiveOutcome, EngineError> {
        let fresh: Vec<&Step> = steps.iter().filter(|s| s.version > self.version).collect();
        let Some(first) = fresh.first() else {
            return Ok(ReceiveOutcome::Stale);
        };
        if first.version != self.version + 1 {
            return Ok(ReceiveOutcome::NeedsCatchUp {
                from_version: self.version,
            });
        }

        let mut version = self.version;
        let mut base = self.confirmed.clone();
        let mut pending = self.pending.clone();
        let mut remote = 0;
        let mut own = 0;
        for step in fresh {
            if step.version != version + 1 {
                return Err(EngineError::OutOfRange(format!(
                    "step {} does not follow version {version}",
                    step.version
                )));
            }
            base = self
                .engine
                .apply(&base, std::slice::from_ref(&step.operation))?;
            if step.origin == self.client_id && !pending.is_empty() {
                pending.remove(0);
                own += 1;
            } else {
                pending = self.rebase(&pending, &step.operation)?;
                remote += 1;
            }
            version = step.version;
        }
        let content = self.engine.apply(&base, &pending)?;

        self.version = version;
        self.confirmed = base;
        self.pending = pending;
        self.content = content;
        Ok(ReceiveOutcome::Applied {
            remote,
            confirmed: own,
        })
    }

    /// Adopt a server snapshot wholesale, returning the discarded pending
    /// operations.
    pub fn reset(&mut self, version: u64, content: Vec<u8>) -> Vec<Operation> {
        self.version = version;
        self.confirmed = content.clone();
        self.content = content;
        std::mem::take(&mut self.pending)
    }

    /// Rebase each pending op over `incoming`, carrying `incoming` through
    /// the pending chain as it goes.
    fn rebase(
        &self,
        pending: &[Operation],
        incoming: &Operation,
    ) -> Result<Vec<Operation>, EngineError> {
        let mut incoming = Some(incoming.clone());
        let mut rebased = Vec::with_capacity(pending.len());
        for op in pending {
            match &incoming {
                Some(inc) => {
                    if let Some(moved) = self.engine.transform(op, inc, Side::Right)? {
                        rebased.push(moved);
                    }
                    incoming = self.engine.transform(inc, op, Side::Left)?;
                }
                None => rebased.push(op.clone()),
            }
        }
        if rebased.len() < pending.len() {
            log::debug!(
                "{} pending operation(s) absorbed by a concurrent edit",
                pending.len() - rebased.len()
            );
        }
        Ok(rebased)
    }
}
