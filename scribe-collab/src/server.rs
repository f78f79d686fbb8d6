//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                         ┌── DocumentStore
//!            ├── connection task ──► Coordinator
//! Client B ──┘        ▲                └── RoomManager ──┐
//!                     └──────── CommitBroadcast frames ──┘
//! ```
//!
//! One task per connection. Each task selects over incoming frames, its
//! room subscription and a heartbeat timer. The task owns no document
//! state; everything authoritative lives behind the coordinator.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use scribe_core::{DocumentId, OperationEngine};

use crate::auth::{AllowAll, Authorizer, UserId, ANONYMOUS};
use crate::broadcast::{ConnectionId, RoomManager, Subscription};
use crate::coordinator::{Coordinator, CoordinatorConfig, SyncError};
use crate::protocol::{ClientMessage, ErrorKind, ServerMessage};
use crate::storage::{DocumentStore, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per document room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    pub join_timeout: Duration,
    pub submit_timeout: Duration,
    /// Create unknown documents on first Join instead of refusing them
    pub auto_create_documents: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let coordinator = CoordinatorConfig::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            join_timeout: coordinator.join_timeout,
            submit_timeout: coordinator.submit_timeout,
            auto_create_documents: false,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short timeouts.
    pub fn for_testing() -> Self {
        let coordinator = CoordinatorConfig::for_testing();
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval_secs: 0,
            join_timeout: coordinator.join_timeout,
            submit_timeout: coordinator.submit_timeout,
            ..Self::default()
        }
    }

    fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            join_timeout: self.join_timeout,
            submit_timeout: self.submit_timeout,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub commits: u64,
    pub rejected_submits: u64,
    pub active_rooms: usize,
}

/// Everything a connection task needs, cloned into each task.
#[derive(Clone)]
struct ConnectionContext {
    coordinator: Arc<Coordinator>,
    authorizer: Arc<dyn Authorizer>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
}

/// Per-connection session state.
struct Session {
    id: ConnectionId,
    user: Option<UserId>,
    joined: Option<DocumentId>,
    subscription: Option<Subscription>,
}

impl Session {
    fn leave_room(&mut self) {
        self.joined = None;
        self.subscription = None;
    }
}

pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<Coordinator>,
    authorizer: Arc<dyn Authorizer>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        engine: Arc<dyn OperationEngine>,
    ) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        let coordinator = Arc::new(Coordinator::new(
            store,
            engine,
            rooms,
            config.coordinator_config(),
        ));
        Self {
            config,
            coordinator,
            authorizer: Arc::new(AllowAll),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Replace the default allow-all authorizer.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let ctx = ConnectionContext {
                        coordinator: self.coordinator.clone(),
                        authorizer: self.authorizer.clone(),
                        stats: self.stats.clone(),
                        config: self.config.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut session = Session {
            id: Uuid::new_v4(),
            user: None,
            joined: None,
            subscription: None,
        };
        log::info!("WebSocket connection {} established from {addr}", session.id);

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let heartbeat = match ctx.config.heartbeat_interval_secs {
            0 => Duration::from_secs(24 * 60 * 60),
            secs => Duration::from_secs(secs),
        };
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = ctx.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                let replies = match ClientMessage::decode(&bytes) {
                                    Ok(client_msg) => Self::handle_message(&ctx, &mut session, client_msg).await,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        vec![ServerMessage::error(ErrorKind::Malformed, e.to_string())]
                                    }
                                };
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                return Ok(());
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                return Ok(());
                            }
                            _ => {}
                        }
                    }

                    frame = async {
                        match session.subscription.as_mut() {
                            Some(sub) => sub.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Connection {} lagged by {n} commits", session.id);
                                let reply = ServerMessage::error(
                                    ErrorKind::Lagged,
                                    format!("missed {n} commits, fetch steps to catch up"),
                                );
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                            Err(RecvError::Closed) => {
                                // The room was closed because its document went away.
                                if let Some(document_id) = session.joined {
                                    let reply = ServerMessage::error(
                                        ErrorKind::DocumentUnavailable,
                                        format!("document unavailable: {document_id}"),
                                    );
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                                session.leave_room();
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Default::default())).await?;
                    }
                }
            }
        }
        .await;

        ctx.coordinator.disconnect(session.id);
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = ctx.coordinator.rooms().room_count();
        }
        log::debug!("Connection {} cleaned up", session.id);
        result
    }

    /// Handle one client message, returning direct replies.
    async fn handle_message(
        ctx: &ConnectionContext,
        session: &mut Session,
        msg: ClientMessage,
    ) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Authenticate { token } => {
                match ctx.authorizer.authenticate(&token).await {
                    Ok(user) => {
                        log::debug!("Connection {} authenticated as {user}", session.id);
                        session.user = Some(user);
                        Vec::new()
                    }
                    Err(e) => vec![ServerMessage::error(ErrorKind::Unauthorized, e.to_string())],
                }
            }

            ClientMessage::Join { document_id } => {
                if let Err(reply) = Self::check_access(ctx, session, document_id).await {
                    return vec![reply];
                }
                // Joining anywhere drops the previous room.
                if let Some(previous) = session.joined {
                    ctx.coordinator.leave(previous, session.id);
                }
                session.leave_room();

                let mut joined = ctx.coordinator.join(document_id, session.id).await;
                if ctx.config.auto_create_documents
                    && matches!(joined, Err(SyncError::DocumentUnavailable(_)))
                {
                    let content = ctx.coordinator.engine().empty_document();
                    match ctx.coordinator.create_document(document_id, content).await {
                        Ok(()) => log::info!("Created document {document_id} on first join"),
                        Err(StoreError::AlreadyExists(_)) => {}
                        Err(e) => log::error!("Failed to create {document_id}: {e}"),
                    }
                    joined = ctx.coordinator.join(document_id, session.id).await;
                }

                match joined {
                    Ok((ack, subscription)) => {
                        session.joined = Some(document_id);
                        session.subscription = Some(subscription);
                        {
                            let mut s = ctx.stats.write().await;
                            s.active_rooms = ctx.coordinator.rooms().room_count();
                        }
                        vec![ServerMessage::JoinAck {
                            document_id,
                            version: ack.version,
                            content: ack.content,
                        }]
                    }
                    Err(e) => vec![Self::error_reply(document_id, &e)],
                }
            }

            ClientMessage::Leave { document_id } => {
                ctx.coordinator.leave(document_id, session.id);
                if session.joined == Some(document_id) {
                    session.leave_room();
                }
                Vec::new()
            }

            ClientMessage::Submit {
                document_id,
                base_version,
                operations,
                client_id,
            } => {
                if session.joined != Some(document_id) {
                    return vec![ServerMessage::error(
                        ErrorKind::NotJoined,
                        format!("join {document_id} before submitting"),
                    )];
                }
                if let Err(reply) = Self::check_access(ctx, session, document_id).await {
                    ctx.coordinator.leave(document_id, session.id);
                    session.leave_room();
                    return vec![reply];
                }

                // Success needs no reply: the commit reaches this
                // connection through its room like everyone else's.
                match ctx
                    .coordinator
                    .submit(document_id, base_version, operations, client_id)
                    .await
                {
                    Ok(_) => {
                        ctx.stats.write().await.commits += 1;
                        Vec::new()
                    }
                    Err(e) => {
                        ctx.stats.write().await.rejected_submits += 1;
                        if matches!(e, SyncError::DocumentUnavailable(_)) {
                            ctx.coordinator.leave(document_id, session.id);
                            session.leave_room();
                        }
                        vec![Self::error_reply(document_id, &e)]
                    }
                }
            }

            ClientMessage::GetSteps {
                document_id,
                from_version,
            } => {
                if let Err(reply) = Self::check_access(ctx, session, document_id).await {
                    return vec![reply];
                }
                match ctx.coordinator.get_steps(document_id, from_version).await {
                    Ok(steps) => vec![ServerMessage::StepsResult {
                        document_id,
                        from_version,
                        steps,
                    }],
                    Err(e) => vec![Self::error_reply(document_id, &e)],
                }
            }

            ClientMessage::Ping => vec![ServerMessage::Pong],
        }
    }

    /// Resolve the session user and check entitlement to `document_id`.
    async fn check_access(
        ctx: &ConnectionContext,
        session: &Session,
        document_id: DocumentId,
    ) -> Result<(), ServerMessage> {
        let user = match (&session.user, ctx.authorizer.requires_authentication()) {
            (Some(user), _) => user.clone(),
            (None, false) => ANONYMOUS.to_string(),
            (None, true) => {
                return Err(ServerMessage::error(
                    ErrorKind::Unauthorized,
                    "authenticate first",
                ))
            }
        };
        ctx.authorizer
            .authorize(&user, document_id)
            .await
            .map_err(|e| {
                log::debug!("Connection {} denied {document_id}: {e}", session.id);
                ServerMessage::error(ErrorKind::Unauthorized, e.to_string())
            })
    }

    fn error_reply(document_id: DocumentId, err: &SyncError) -> ServerMessage {
        match err {
            SyncError::VersionMismatch { current_version } => ServerMessage::VersionMismatch {
                document_id,
                current_version: *current_version,
            },
            SyncError::InvalidOperation(reason) => ServerMessage::InvalidOperation {
                document_id,
                reason: reason.clone(),
            },
            SyncError::DocumentUnavailable(_) => {
                ServerMessage::error(ErrorKind::DocumentUnavailable, err.to_string())
            }
            SyncError::RoomFull(_) => ServerMessage::error(ErrorKind::RoomFull, err.to_string()),
            SyncError::Timeout => ServerMessage::error(ErrorKind::Timeout, err.to_string()),
            SyncError::Storage(e) => {
                log::error!("Storage failure on {document_id}: {e}");
                ServerMessage::error(ErrorKind::Internal, "storage failure")
            }
            SyncError::Internal(e) => {
                log::error!("Internal failure on {document_id}: {e}");
                ServerMessage::error(ErrorKind::Internal, "internal error")
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        self.coordinator.rooms()
    }
}
