//! # scribe-collab — Document synchronization service for Scribe
//!
//! Central authority for collaboratively edited documents. Clients submit
//! operations against a base version; the coordinator accepts a batch only
//! if the base is current, commits it as consecutive steps and broadcasts
//! it to every connection in the document's room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (Replica)   │     Binary Proto    │ (per conn)  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ Coordinator │
//!                                     └──┬───────┬──┘
//!                                        │       │
//!                          ┌─────────────┴─┐   ┌─┴────────────┐
//!                          │ DocumentStore │   │ RoomManager  │
//!                          │ (step log)    │   │ (fan-out)    │
//!                          └───────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`storage`] — Step log and document state (`MemoryStore`, `RocksStore`)
//! - [`broadcast`] — Per-document rooms that release commits in version order
//! - [`coordinator`] — Compare-and-commit of submitted batches
//! - [`auth`] — Token authentication and per-document authorization
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client driving a `Replica`

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AccessList, AllowAll, AuthError, Authorizer, UserId};
pub use broadcast::{BroadcastStats, CommitFrame, ConnectionId, RoomError, RoomManager, Subscription};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use coordinator::{Coordinator, CoordinatorConfig, JoinAck, SubmitOutcome, SyncError};
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError,
};
