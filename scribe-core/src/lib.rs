//! # scribe-core — Document model and operation engines for Scribe
//!
//! Shared vocabulary between the sync server and its clients:
//!
//! - [`types`] — document ids, client ids, opaque operations, committed steps
//! - [`engine`] — the `OperationEngine` capability (apply + transform)
//! - [`text`] — plain-text reference engine (JSON insert/delete operations)
//! - [`yrs_engine`] — Yjs update engine backed by `yrs`
//! - [`replica`] — client-side replica that rebases pending edits
//!
//! ## Convergence model
//!
//! ```text
//!  Replica A ──submit(base=v)──► Coordinator ──commit v+1..v+n──► Step log
//!      ▲                              │
//!      └────── CommitBroadcast ◄──────┴──────► Replica B
//! ```
//!
//! The server never transforms. Replicas rebase their own pending operations
//! over every foreign step they receive, then resubmit against the new base.

pub mod engine;
pub mod replica;
pub mod text;
pub mod types;
pub mod yrs_engine;

pub use engine::{EngineError, OperationEngine, Side};
pub use replica::{ReceiveOutcome, Replica};
pub use text::{TextEngine, TextOp};
pub use types::{ClientId, DocumentId, DocumentSnapshot, Operation, Step};
pub use yrs_engine::YrsEngine;
