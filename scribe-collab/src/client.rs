//! WebSocket sync client.
//!
//! Drives a [`Replica`] against a sync server:
//! - Connection lifecycle (connect, join, disconnect)
//! - Submits pending operations one batch at a time
//! - Catches up with `GetSteps` on version mismatch, lag or a gap
//! - Rejoins (discarding pending edits) when the server rejects a batch
//!
//! The reaction to each server message lives in [`Session`], which holds no
//! I/O and is unit-tested directly.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use scribe_core::{
    ClientId, DocumentId, EngineError, Operation, OperationEngine, ReceiveOutcome, Replica, Step,
};

use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// WebSocket established
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// Snapshot adopted from the server
    Joined { version: u64 },
    /// Our own operations were committed
    Confirmed { version: u64 },
    /// Foreign steps were applied
    RemoteChange { version: u64 },
    /// The server refused a batch; the client rejoins
    Rejected { reason: String },
    /// Pending local operations dropped by a rejoin
    PendingDiscarded(usize),
    ServerError { kind: ErrorKind, message: String },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Messages to send and events to emit after handling one server message.
#[derive(Debug, Default)]
struct Reaction {
    outgoing: Vec<ClientMessage>,
    events: Vec<SyncEvent>,
}

/// Replica plus the submit/catch-up bookkeeping around it.
struct Session {
    document_id: DocumentId,
    replica: Replica,
    joined: bool,
    /// A Submit is awaiting its commit or rejection
    in_flight: bool,
    /// A GetSteps is awaiting its result
    catching_up: bool,
    /// Highest version the server has mentioned
    seen_version: u64,
}

impl Session {
    fn new(document_id: DocumentId, replica: Replica) -> Self {
        Self {
            document_id,
            replica,
            joined: false,
            in_flight: false,
            catching_up: false,
            seen_version: 0,
        }
    }

    fn is_synced(&self) -> bool {
        self.joined
            && !self.in_flight
            && !self.catching_up
            && !self.replica.has_pending()
            && self.seen_version <= self.replica.version()
    }

    fn join(&mut self) -> ClientMessage {
        self.joined = false;
        self.in_flight = false;
        self.catching_up = false;
        ClientMessage::Join {
            document_id: self.document_id,
        }
    }

    /// Submit the pending batch unless one is already outstanding.
    fn flush(&mut self) -> Option<ClientMessage> {
        if !self.joined || self.in_flight || self.catching_up {
            return None;
        }
        let (base_version, operations) = self.replica.sendable()?;
        self.in_flight = true;
        Some(ClientMessage::Submit {
            document_id: self.document_id,
            base_version,
            operations,
            client_id: self.replica.client_id().clone(),
        })
    }

    fn catch_up(&mut self, reaction: &mut Reaction) {
        if self.catching_up {
            return;
        }
        self.catching_up = true;
        reaction.outgoing.push(ClientMessage::GetSteps {
            document_id: self.document_id,
            from_version: self.replica.version(),
        });
    }

    fn absorb(&mut self, steps: &[Step], reaction: &mut Reaction) {
        if let Some(last) = steps.last() {
            self.seen_version = self.seen_version.max(last.version);
        }
        match self.replica.receive(steps) {
            Ok(ReceiveOutcome::Applied { remote, confirmed }) => {
                let version = self.replica.version();
                if confirmed > 0 {
                    self.in_flight = false;
                    reaction.events.push(SyncEvent::Confirmed { version });
                }
                if remote > 0 {
                    reaction.events.push(SyncEvent::RemoteChange { version });
                }
            }
            Ok(ReceiveOutcome::Stale) => {}
            Ok(ReceiveOutcome::NeedsCatchUp { .. }) => self.catch_up(reaction),
            Err(e) => {
                log::error!(
                    "Replica of {} failed to apply steps: {e}; rejoining",
                    self.document_id
                );
                reaction.outgoing.push(self.join());
            }
        }
    }

    fn on_message(&mut self, msg: ServerMessage) -> Reaction {
        let mut reaction = Reaction::default();
        if msg.document_id().is_some_and(|id| id != self.document_id) {
            return reaction;
        }

        match msg {
            ServerMessage::JoinAck {
                version, content, ..
            } => {
                let discarded = self.replica.reset(version, content);
                self.joined = true;
                self.in_flight = false;
                self.catching_up = false;
                self.seen_version = version;
                if !discarded.is_empty() {
                    log::warn!(
                        "Discarded {} pending operation(s) on {}",
                        discarded.len(),
                        self.document_id
                    );
                    reaction
                        .events
                        .push(SyncEvent::PendingDiscarded(discarded.len()));
                }
                reaction.events.push(SyncEvent::Joined { version });
            }
            ServerMessage::CommitBroadcast { steps, .. } => {
                self.absorb(&steps, &mut reaction);
            }
            ServerMessage::StepsResult { steps, .. } => {
                self.catching_up = false;
                self.absorb(&steps, &mut reaction);
                // Broadcasts that arrived mid catch-up may be newer than
                // the result.
                if self.joined && self.seen_version > self.replica.version() {
                    self.catch_up(&mut reaction);
                }
            }
            ServerMessage::VersionMismatch {
                current_version, ..
            } => {
                self.in_flight = false;
                self.seen_version = self.seen_version.max(current_version);
                if current_version > self.replica.version() {
                    self.catch_up(&mut reaction);
                }
            }
            ServerMessage::InvalidOperation { reason, .. } => {
                log::warn!("Batch on {} rejected: {reason}", self.document_id);
                reaction.events.push(SyncEvent::Rejected { reason });
                reaction.outgoing.push(self.join());
            }
            ServerMessage::Error { kind, message } => {
                match kind {
                    ErrorKind::Lagged => self.catch_up(&mut reaction),
                    // The commit may have landed before the deadline.
                    ErrorKind::Timeout => {
                        self.in_flight = false;
                        self.catch_up(&mut reaction);
                    }
                    ErrorKind::DocumentUnavailable
                    | ErrorKind::Unauthorized
                    | ErrorKind::RoomFull
                    | ErrorKind::NotJoined => {
                        self.joined = false;
                        self.in_flight = false;
                        self.catching_up = false;
                    }
                    ErrorKind::Malformed | ErrorKind::Internal => {
                        self.in_flight = false;
                    }
                }
                reaction.events.push(SyncEvent::ServerError { kind, message });
            }
            ServerMessage::Pong => {}
        }

        if let Some(submit) = self.flush() {
            reaction.outgoing.push(submit);
        }
        reaction
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server and keeps a local
/// replica of one document converging with it.
pub struct SyncClient {
    document_id: DocumentId,
    server_url: String,
    token: Option<String>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    session: Arc<Mutex<Session>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        server_url: impl Into<String>,
        document_id: DocumentId,
        engine: Arc<dyn OperationEngine>,
        client_id: ClientId,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let replica = Replica::empty(engine, client_id);
        Self {
            document_id,
            server_url: server_url.into(),
            token: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: Arc::new(Mutex::new(Session::new(document_id, replica))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Authenticate with `token` right after connecting.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, authenticate and join the document.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    /// The replica is usable once [`SyncEvent::Joined`] arrives.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        if let Some(token) = &self.token {
            let auth = ClientMessage::Authenticate {
                token: token.clone(),
            };
            send_encoded(&out_tx, &auth).await?;
        }
        let join = self.session.lock().await.join();
        send_encoded(&out_tx, &join).await?;
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);

        // Reader task: feed server messages to the session
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let session = self.session.clone();
        let document_id = self.document_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let server_msg = match ServerMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Undecodable frame for {document_id}: {e}");
                                continue;
                            }
                        };
                        let reaction = session.lock().await.on_message(server_msg);
                        for event in reaction.events {
                            emit(&event_tx, event);
                        }
                        for out in &reaction.outgoing {
                            if send_encoded(&out_tx, out).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            {
                let mut s = session.lock().await;
                s.joined = false;
                s.in_flight = false;
                s.catching_up = false;
            }
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Apply a local edit and submit it when no other batch is outstanding.
    pub async fn edit(&self, op: Operation) -> Result<(), ClientError> {
        let submit = {
            let mut session = self.session.lock().await;
            if !session.joined {
                return Err(ProtocolError::NotConnected.into());
            }
            session.replica.apply_local(op)?;
            session.flush()
        };
        if let Some(msg) = submit {
            self.send(&msg).await?;
        }
        Ok(())
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let leave = ClientMessage::Leave {
            document_id: self.document_id,
        };
        let result = self.send(&leave).await;
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        result
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => send_encoded(tx, msg).await,
            None => Err(ProtocolError::NotConnected),
        }
    }

    /// Local view of the document, pending edits included.
    pub async fn content(&self) -> Vec<u8> {
        self.session.lock().await.replica.content().to_vec()
    }

    /// Last server version incorporated locally.
    pub async fn version(&self) -> u64 {
        self.session.lock().await.replica.version()
    }

    /// Joined, nothing pending or outstanding, and caught up with every
    /// version the server has announced.
    pub async fn is_synced(&self) -> bool {
        self.session.lock().await.is_synced()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

async fn send_encoded(
    tx: &mpsc::Sender<Vec<u8>>,
    msg: &ClientMessage,
) -> Result<(), ProtocolError> {
    let encoded = msg.encode()?;
    tx.send(encoded)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// Events are advisory; a full channel drops them.
fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = tx.try_send(event) {
        log::debug!("Dropped sync event: {e}");
    }
}
