//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

use scribe_collab::auth::AccessList;
use scribe_collab::client::{ConnectionState, SyncClient, SyncEvent};
use scribe_collab::protocol::{ClientMessage, ErrorKind, ServerMessage};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_collab::storage::{DocumentStore, MemoryStore};
use scribe_collab::Authorizer;
use scribe_core::{ClientId, DocumentId, TextEngine, TextOp};

struct TestServer {
    url: String,
    store: Arc<MemoryStore>,
}

/// Start a server on a free port.
async fn start_server(config: ServerConfig, authorizer: Option<Arc<dyn Authorizer>>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store = Arc::new(MemoryStore::new());

    let mut server = SyncServer::new(config, store.clone(), Arc::new(TextEngine::new()));
    if let Some(authorizer) = authorizer {
        server = server.with_authorizer(authorizer);
    }
    tokio::spawn(async move {
        server
            .serve(listener, std::future::pending())
            .await
            .unwrap();
    });

    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        store,
    }
}

async fn start_test_server() -> TestServer {
    start_server(ServerConfig::for_testing(), None).await
}

async fn create_document(server: &TestServer, text: &str) -> DocumentId {
    let id = DocumentId::new_v4();
    server
        .store
        .create_document(id, text.as_bytes().to_vec())
        .await
        .unwrap();
    id
}

fn client(server: &TestServer, doc: DocumentId, name: &str) -> SyncClient {
    SyncClient::new(
        server.url.clone(),
        doc,
        Arc::new(TextEngine::new()),
        ClientId::new(name),
    )
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until every client is idle at the committed version.
async fn wait_synced(server: &TestServer, doc: DocumentId, clients: &[&SyncClient]) {
    timeout(Duration::from_secs(5), async {
        loop {
            let committed = server.store.read_current(doc).await.unwrap().version;
            let mut synced = true;
            for c in clients {
                synced &= c.is_synced().await && c.version().await == committed;
            }
            if synced {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients never settled");
}

type RawSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn raw_send(ws: &mut RawSocket, msg: &ClientMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn raw_recv(ws: &mut RawSocket) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Binary(data) = frame {
            let bytes: Vec<u8> = data.into();
            return ServerMessage::decode(&bytes).unwrap();
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server().await;
    let result = tokio_tungstenite::connect_async(server.url.as_str()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_existing_document() {
    let server = start_test_server().await;
    let doc = create_document(&server, "draft").await;

    let mut c = client(&server, doc, "alice");
    let mut events = c.take_event_rx().unwrap();
    c.connect().await.unwrap();

    let joined = wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
    assert_eq!(joined, SyncEvent::Joined { version: 0 });
    assert_eq!(c.connection_state().await, ConnectionState::Connected);
    assert_eq!(c.content().await, b"draft");
}

#[tokio::test]
async fn test_join_unknown_document_refused() {
    let server = start_test_server().await;

    let mut c = client(&server, DocumentId::new_v4(), "alice");
    let mut events = c.take_event_rx().unwrap();
    c.connect().await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, SyncEvent::ServerError { .. })).await;
    assert!(matches!(
        event,
        SyncEvent::ServerError {
            kind: ErrorKind::DocumentUnavailable,
            ..
        }
    ));
    assert!(!c.is_synced().await);
}

#[tokio::test]
async fn test_auto_create_on_first_join() {
    let config = ServerConfig {
        auto_create_documents: true,
        ..ServerConfig::for_testing()
    };
    let server = start_server(config, None).await;
    let doc = DocumentId::new_v4();

    let mut c = client(&server, doc, "alice");
    let mut events = c.take_event_rx().unwrap();
    c.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;

    assert_eq!(server.store.read_current(doc).await.unwrap().version, 0);
}

#[tokio::test]
async fn test_edit_reaches_other_client() {
    let server = start_test_server().await;
    let doc = create_document(&server, "").await;

    let mut alice = client(&server, doc, "alice");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Joined { .. })).await;

    let mut bob = client(&server, doc, "bob");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Joined { .. })).await;

    alice
        .edit(TextOp::insert(0, "hi").to_operation())
        .await
        .unwrap();

    let confirmed = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Confirmed { .. })).await;
    assert_eq!(confirmed, SyncEvent::Confirmed { version: 1 });
    let change = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteChange { .. })).await;
    assert_eq!(change, SyncEvent::RemoteChange { version: 1 });
    assert_eq!(bob.content().await, b"hi");
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let server = start_test_server().await;
    let doc = create_document(&server, "").await;

    let mut alice = client(&server, doc, "alice");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Joined { .. })).await;

    let mut bob = client(&server, doc, "bob");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Joined { .. })).await;

    for i in 0..10 {
        alice
            .edit(TextOp::insert(0, "A").to_operation())
            .await
            .unwrap();
        bob.edit(TextOp::insert(i, "b").to_operation())
            .await
            .unwrap();
    }

    wait_synced(&server, doc, &[&alice, &bob]).await;

    let committed = server.store.read_current(doc).await.unwrap();
    assert_eq!(committed.version, 20);
    assert_eq!(alice.version().await, 20);
    assert_eq!(bob.version().await, 20);
    assert_eq!(alice.content().await, committed.content);
    assert_eq!(bob.content().await, committed.content);

    let text = String::from_utf8(committed.content).unwrap();
    assert_eq!(text.matches('A').count(), 10);
    assert_eq!(text.matches('b').count(), 10);
}

#[tokio::test]
async fn test_access_list_enforced() {
    let acl = Arc::new(AccessList::new());
    acl.add_token("t-alice", "alice").await;
    let server = start_server(ServerConfig::for_testing(), Some(acl.clone() as Arc<dyn Authorizer>)).await;
    let doc = create_document(&server, "").await;

    // No token at all
    let mut anon = client(&server, doc, "anon");
    let mut anon_events = anon.take_event_rx().unwrap();
    anon.connect().await.unwrap();
    let event = wait_for(&mut anon_events, |e| matches!(e, SyncEvent::ServerError { .. })).await;
    assert!(matches!(
        event,
        SyncEvent::ServerError {
            kind: ErrorKind::Unauthorized,
            ..
        }
    ));

    // Valid token, granted document
    acl.grant("alice", doc).await;
    let mut alice = client(&server, doc, "alice").with_token("t-alice");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Joined { .. })).await;

    // Revoked mid-session: the next submit is refused
    acl.revoke("alice", doc).await;
    alice
        .edit(TextOp::insert(0, "x").to_operation())
        .await
        .unwrap();
    let event = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ServerError { .. })).await;
    assert!(matches!(
        event,
        SyncEvent::ServerError {
            kind: ErrorKind::Unauthorized,
            ..
        }
    ));
    assert_eq!(server.store.read_current(doc).await.unwrap().version, 0);
}

#[tokio::test]
async fn test_malformed_frame_reported() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str())
        .await
        .unwrap();

    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into()))
        .await
        .unwrap();
    assert!(matches!(
        raw_recv(&mut ws).await,
        ServerMessage::Error {
            kind: ErrorKind::Malformed,
            ..
        }
    ));

    // The connection survives
    raw_send(&mut ws, &ClientMessage::Ping).await;
    assert_eq!(raw_recv(&mut ws).await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_submit_requires_join() {
    let server = start_test_server().await;
    let doc = create_document(&server, "").await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str())
        .await
        .unwrap();

    let submit = ClientMessage::Submit {
        document_id: doc,
        base_version: 0,
        operations: vec![TextOp::insert(0, "x").to_operation()],
        client_id: ClientId::new("raw"),
    };
    raw_send(&mut ws, &submit).await;
    assert!(matches!(
        raw_recv(&mut ws).await,
        ServerMessage::Error {
            kind: ErrorKind::NotJoined,
            ..
        }
    ));

    raw_send(&mut ws, &ClientMessage::Join { document_id: doc }).await;
    assert!(matches!(
        raw_recv(&mut ws).await,
        ServerMessage::JoinAck { version: 0, .. }
    ));

    // The submitter receives its own commit through the room.
    raw_send(&mut ws, &submit).await;
    match raw_recv(&mut ws).await {
        ServerMessage::CommitBroadcast {
            from_version,
            steps,
            ..
        } => {
            assert_eq!(from_version, 0);
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].origin, ClientId::new("raw"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // Stale base
    raw_send(&mut ws, &submit).await;
    assert_eq!(
        raw_recv(&mut ws).await,
        ServerMessage::VersionMismatch {
            document_id: doc,
            current_version: 1
        }
    );

    raw_send(
        &mut ws,
        &ClientMessage::GetSteps {
            document_id: doc,
            from_version: 0,
        },
    )
    .await;
    match raw_recv(&mut ws).await {
        ServerMessage::StepsResult { steps, .. } => assert_eq!(steps.len(), 1),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_room_members_told_when_document_vanishes() {
    let server = start_test_server().await;
    let doc = create_document(&server, "").await;
    let (mut a, _) = tokio_tungstenite::connect_async(server.url.as_str())
        .await
        .unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(server.url.as_str())
        .await
        .unwrap();
    for ws in [&mut a, &mut b] {
        raw_send(ws, &ClientMessage::Join { document_id: doc }).await;
        assert!(matches!(raw_recv(ws).await, ServerMessage::JoinAck { .. }));
    }

    server.store.delete_document(doc).await.unwrap();
    raw_send(
        &mut a,
        &ClientMessage::GetSteps {
            document_id: doc,
            from_version: 0,
        },
    )
    .await;
    assert!(matches!(
        raw_recv(&mut a).await,
        ServerMessage::Error {
            kind: ErrorKind::DocumentUnavailable,
            ..
        }
    ));
    // B never asked, but its room is gone.
    assert!(matches!(
        raw_recv(&mut b).await,
        ServerMessage::Error {
            kind: ErrorKind::DocumentUnavailable,
            ..
        }
    ));

    // A document recreated under the same id starts over at version 0.
    server
        .store
        .create_document(doc, Vec::new())
        .await
        .unwrap();
    raw_send(&mut b, &ClientMessage::Join { document_id: doc }).await;
    assert!(matches!(
        raw_recv(&mut b).await,
        ServerMessage::JoinAck { version: 0, .. }
    ));
    raw_send(
        &mut b,
        &ClientMessage::Submit {
            document_id: doc,
            base_version: 0,
            operations: vec![TextOp::insert(0, "again").to_operation()],
            client_id: ClientId::new("b"),
        },
    )
    .await;
    assert!(matches!(
        raw_recv(&mut b).await,
        ServerMessage::CommitBroadcast {
            from_version: 0,
            ..
        }
    ));
}
