//! Per-document rooms and ordered commit fan-out.
//!
//! Every room owns a tokio broadcast channel of pre-encoded frames and a
//! commit sequencer. Commits may finish publishing out of order when several
//! submits race; the sequencer holds a commit back until every earlier one
//! has gone out, so members always see versions in commit order.
//!
//! ```text
//!  publish(from=7) ─┐      ┌──────────── Room ─────────────┐
//!  publish(from=5) ─┼────► │ sequencer: next=5  held={7}   │ ──► members
//!  publish(from=6) ─┘      │ sender: broadcast::Sender     │
//!                          └───────────────────────────────┘
//! ```
//!
//! Locks are `std::sync` and never held across an await, so publishing is
//! synchronous and cannot be cut short by a cancelled caller.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use scribe_core::{DocumentId, Step};

use crate::protocol::{ProtocolError, ServerMessage};

/// Identifies one transport connection.
pub type ConnectionId = Uuid;

/// Encoded `ServerMessage` shared by every receiver.
pub type Frame = Arc<Vec<u8>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("room for {document_id} is full ({limit} connections)")]
    Full { document_id: DocumentId, limit: usize },
}

/// A committed batch ready for fan-out, encoded before the commit so that
/// publishing it afterwards cannot fail.
#[derive(Debug, Clone)]
pub struct CommitFrame {
    pub document_id: DocumentId,
    pub from_version: u64,
    pub to_version: u64,
    pub bytes: Frame,
}

impl CommitFrame {
    pub fn encode(
        document_id: DocumentId,
        from_version: u64,
        steps: &[Step],
    ) -> Result<Self, ProtocolError> {
        let msg = ServerMessage::CommitBroadcast {
            document_id,
            from_version,
            steps: steps.to_vec(),
        };
        Ok(Self {
            document_id,
            from_version,
            to_version: from_version + steps.len() as u64,
            bytes: Arc::new(msg.encode()?),
        })
    }
}

/// Receiving end of a room membership.
#[derive(Debug)]
pub struct Subscription {
    document_id: DocumentId,
    receiver: broadcast::Receiver<Frame>,
}

impl Subscription {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Next frame. `Lagged` means this receiver fell behind the channel
    /// capacity and skipped frames.
    pub async fn recv(&mut self) -> Result<Frame, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

/// Releases commits strictly in version order.
#[derive(Debug, Default)]
struct CommitSequencer {
    /// `from_version` of the next commit to release. `None` until seeded.
    next: Option<u64>,
    held: BTreeMap<u64, (u64, Frame)>,
}

impl CommitSequencer {
    /// First seed wins; later seeds are ignored.
    fn seed(&mut self, version: u64) {
        if self.next.is_none() {
            self.next = Some(version);
        }
    }

    fn push(&mut self, from_version: u64, to_version: u64, frame: Frame) {
        self.held.insert(from_version, (to_version, frame));
    }

    /// Pop everything releasable. Returns `(released, dropped)`.
    fn drain(&mut self) -> (Vec<Frame>, u64) {
        let mut released = Vec::new();
        let mut dropped = 0;
        let Some(mut next) = self.next else {
            return (released, dropped);
        };
        while let Some(entry) = self.held.first_entry() {
            let from = *entry.key();
            if from < next {
                // Already covered by the snapshot the room was seeded with.
                entry.remove();
                dropped += 1;
            } else if from == next {
                let (to, frame) = entry.remove();
                released.push(frame);
                next = to;
            } else {
                break;
            }
        }
        self.next = Some(next);
        (released, dropped)
    }
}

struct RoomState {
    members: HashSet<ConnectionId>,
    sequencer: CommitSequencer,
}

struct Room {
    sender: broadcast::Sender<Frame>,
    state: Mutex<RoomState>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            state: Mutex::new(RoomState {
                members: HashSet::new(),
                sequencer: CommitSequencer::default(),
            }),
        }
    }

    /// Drain the sequencer and send under the room lock so that concurrent
    /// publishers cannot interleave.
    fn release(&self, state: &mut RoomState, stats: &AtomicBroadcastStats) {
        let (frames, dropped) = state.sequencer.drain();
        for frame in frames {
            // No receivers is fine; members may all be mid-reconnect.
            let _ = self.sender.send(frame);
            stats.commits_released.fetch_add(1, Ordering::Relaxed);
        }
        stats.commits_dropped.fetch_add(dropped, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<DocumentId, Arc<Room>>,
    connections: HashMap<ConnectionId, DocumentId>,
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub commits_released: u64,
    pub commits_dropped: u64,
    pub active_rooms: usize,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    commits_released: AtomicU64,
    commits_dropped: AtomicU64,
}

/// Maps documents to rooms and connections to their current room.
///
/// A connection is in at most one room; joining another room leaves the
/// previous one. Rooms are created on first join and removed when the last
/// member leaves or the document is closed.
pub struct RoomManager {
    registry: Mutex<Registry>,
    capacity: usize,
    max_connections_per_room: usize,
    stats: AtomicBroadcastStats,
}

impl RoomManager {
    /// `capacity` frames are buffered per receiver before it lags.
    pub fn new(capacity: usize, max_connections_per_room: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
            max_connections_per_room,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Subscribe `connection` to the room of `document_id`.
    ///
    /// The returned subscription sees every commit released after this
    /// call returns.
    pub fn join(
        &self,
        document_id: DocumentId,
        connection: ConnectionId,
    ) -> Result<Subscription, RoomError> {
        let mut registry = lock(&self.registry);

        if let Some(room) = registry.rooms.get(&document_id) {
            let state = lock(&room.state);
            if !state.members.contains(&connection)
                && state.members.len() >= self.max_connections_per_room
            {
                return Err(RoomError::Full {
                    document_id,
                    limit: self.max_connections_per_room,
                });
            }
        }

        if let Some(previous) = registry.connections.get(&connection).copied() {
            if previous != document_id {
                Self::remove_member(&mut registry, previous, connection);
            }
        }

        let capacity = self.capacity;
        let room = registry
            .rooms
            .entry(document_id)
            .or_insert_with(|| {
                log::debug!("Room {document_id} created");
                Arc::new(Room::new(capacity))
            })
            .clone();
        lock(&room.state).members.insert(connection);
        registry.connections.insert(connection, document_id);

        Ok(Subscription {
            document_id,
            receiver: room.sender.subscribe(),
        })
    }

    /// Leave the room of `document_id`. No-op if not a member.
    pub fn leave(&self, document_id: DocumentId, connection: ConnectionId) {
        let mut registry = lock(&self.registry);
        if registry.connections.get(&connection) == Some(&document_id) {
            registry.connections.remove(&connection);
            Self::remove_member(&mut registry, document_id, connection);
        }
    }

    /// Drop every membership of `connection`.
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut registry = lock(&self.registry);
        if let Some(document_id) = registry.connections.remove(&connection) {
            Self::remove_member(&mut registry, document_id, connection);
        }
    }

    fn remove_member(registry: &mut Registry, document_id: DocumentId, connection: ConnectionId) {
        let now_empty = match registry.rooms.get(&document_id) {
            Some(room) => {
                let mut state = lock(&room.state);
                state.members.remove(&connection);
                state.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            registry.rooms.remove(&document_id);
            log::debug!("Room {document_id} removed (empty)");
        }
    }

    /// Tear down the room of `document_id` and drop every membership.
    ///
    /// The room's sender goes with it, so existing subscriptions drain what
    /// was already sent and then see `Closed`. The next join starts a fresh,
    /// unseeded room. Used when the document behind the room is gone.
    pub fn close(&self, document_id: DocumentId) {
        let mut registry = lock(&self.registry);
        let Some(room) = registry.rooms.remove(&document_id) else {
            return;
        };
        let members = std::mem::take(&mut lock(&room.state).members);
        for connection in &members {
            if registry.connections.get(connection) == Some(&document_id) {
                registry.connections.remove(connection);
            }
        }
        log::debug!("Room {document_id} closed ({} members)", members.len());
    }

    /// Tell the room which version its first member's snapshot was taken
    /// at. Commits before it are dropped; later ones start flowing.
    pub fn seed(&self, document_id: DocumentId, version: u64) {
        let Some(room) = self.room(document_id) else {
            return;
        };
        let mut state = lock(&room.state);
        state.sequencer.seed(version);
        room.release(&mut state, &self.stats);
    }

    /// Queue a commit for ordered fan-out. No-op when nobody is in the room.
    pub fn publish(&self, frame: CommitFrame) {
        let Some(room) = self.room(frame.document_id) else {
            return;
        };
        let mut state = lock(&room.state);
        state
            .sequencer
            .push(frame.from_version, frame.to_version, frame.bytes);
        room.release(&mut state, &self.stats);
        if state.sequencer.held.len() > self.capacity {
            log::warn!(
                "Room {} is holding {} out-of-order commits",
                frame.document_id,
                state.sequencer.held.len()
            );
        }
    }

    fn room(&self, document_id: DocumentId) -> Option<Arc<Room>> {
        lock(&self.registry).rooms.get(&document_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        lock(&self.registry).rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.registry).connections.len()
    }

    pub fn members(&self, document_id: DocumentId) -> Vec<ConnectionId> {
        self.room(document_id)
            .map(|room| lock(&room.state).members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Room the connection currently belongs to.
    pub fn room_of(&self, connection: ConnectionId) -> Option<DocumentId> {
        lock(&self.registry).connections.get(&connection).copied()
    }

    pub fn active_documents(&self) -> Vec<DocumentId> {
        lock(&self.registry).rooms.keys().copied().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        let registry = lock(&self.registry);
        BroadcastStats {
            commits_released: self.stats.commits_released.load(Ordering::Relaxed),
            commits_dropped: self.stats.commits_dropped.load(Ordering::Relaxed),
            active_rooms: registry.rooms.len(),
            active_connections: registry.connections.len(),
        }
    }
}
