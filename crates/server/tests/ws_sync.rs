// End-to-end synchronization over real WebSocket connections

use futures_util::{SinkExt, StreamExt};
use ot::OpKind;
use protocol::{ClientMessage, ErrorKind, OperationRequest, ServerMessage};
use server::auth::StaticTokens;
use server::document::DocumentStore;
use server::file_store::FileStore;
use server::oplog::MemoryLog;
use server::server::{serve, ServerState};
use server::{GatewaySettings, SyncGateway};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a test server and return its address.
async fn start_test_server() -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let gateway = SyncGateway::new(
        Arc::new(DocumentStore::new()),
        Arc::new(MemoryLog::new()),
        Arc::new(FileStore::new(dir.path()).await.unwrap()),
        GatewaySettings::default(),
    );
    let tokens = StaticTokens::default()
        .with("alice-token", "alice")
        .with("bob-token", "bob");
    let state = ServerState::new(Arc::new(gateway), Arc::new(tokens));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });

    (addr, dir)
}

async fn connect(addr: SocketAddr, token: &str) -> Ws {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        tungstenite::http::header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: ClientMessage) {
    let json = serde_json::to_string(&msg).unwrap();
    ws.send(Message::text(json)).await.unwrap();
}

/// Receive next server message with timeout.
async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        match tokio::time::timeout(TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(text.as_str()).unwrap()
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("WebSocket error: {}", e),
            Ok(None) => panic!("Connection closed"),
            Err(_) => panic!("Timeout waiting for WebSocket message"),
        }
    }
}

/// Skip messages until one matches
async fn recv_until(ws: &mut Ws, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    loop {
        let msg = recv(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

fn submit(kind: OpKind, position: i64, length: i64, text: &str, base: u64, seq: u64) -> ClientMessage {
    ClientMessage::SubmitOperation {
        doc_id: "groceries".to_string(),
        operation: OperationRequest {
            kind,
            position,
            length,
            text: text.to_string(),
            base_version: base,
            client_seq: seq,
        },
    }
}

fn join(since_version: Option<u64>) -> ClientMessage {
    ClientMessage::JoinDocument {
        doc_id: "groceries".to_string(),
        since_version,
    }
}

async fn snapshot_of(ws: &mut Ws) -> (String, u64) {
    send(
        ws,
        ClientMessage::RequestSnapshot {
            doc_id: "groceries".to_string(),
        },
    )
    .await;
    match recv_until(ws, |m| matches!(m, ServerMessage::Snapshot { .. })).await {
        ServerMessage::Snapshot {
            content, version, ..
        } => (content, version),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_two_clients_stay_in_sync() {
    let (addr, _dir) = start_test_server().await;

    // Alice creates the note by joining it
    let mut alice = connect(addr, "alice-token").await;
    send(&mut alice, join(None)).await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::Joined { .. }));
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::Snapshot { version: 0, .. }
    ));
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::CaughtUp { version: 0, .. }
    ));

    send(&mut alice, submit(OpKind::Insert, 0, 0, "hello", 0, 1)).await;
    match recv(&mut alice).await {
        ServerMessage::Accepted {
            client_seq,
            operation,
            ..
        } => {
            assert_eq!(client_seq, 1);
            assert_eq!(operation.version, 1);
            assert_eq!(operation.user_id, "alice");
        }
        other => panic!("unexpected {other:?}"),
    }

    // Bob joins late and replays from version 0
    let mut bob = connect(addr, "bob-token").await;
    send(&mut bob, join(Some(0))).await;
    match recv(&mut bob).await {
        ServerMessage::Joined { collaborators, .. } => {
            assert_eq!(collaborators.len(), 1);
            assert_eq!(collaborators[0].user_id, "alice");
        }
        other => panic!("unexpected {other:?}"),
    }
    match recv(&mut bob).await {
        ServerMessage::OperationApplied { operation, .. } => {
            assert_eq!(operation.version, 1);
            assert_eq!(operation.operation.text, "hello");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        recv(&mut bob).await,
        ServerMessage::CaughtUp { version: 1, .. }
    ));
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::UserJoined { collaborator, .. } if collaborator.user_id == "bob"
    ));

    // Bob's edit reaches Alice
    send(&mut bob, submit(OpKind::Insert, 5, 0, " world", 1, 1)).await;
    assert!(matches!(
        recv(&mut bob).await,
        ServerMessage::Accepted { client_seq: 1, .. }
    ));
    match recv(&mut alice).await {
        ServerMessage::OperationApplied { operation, .. } => {
            assert_eq!(operation.version, 2);
            assert_eq!(operation.operation.position, 5);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Concurrent edits against version 2
    send(&mut alice, submit(OpKind::Insert, 11, 0, "!", 2, 2)).await;
    send(&mut bob, submit(OpKind::Delete, 0, 1, "", 2, 2)).await;
    // One of them sees version 4 as its acknowledgement, the other as a broadcast
    for ws in [&mut alice, &mut bob] {
        recv_until(ws, |m| match m {
            ServerMessage::Accepted { operation, .. }
            | ServerMessage::OperationApplied { operation, .. } => operation.version == 4,
            _ => false,
        })
        .await;
    }

    let from_alice = snapshot_of(&mut alice).await;
    let from_bob = snapshot_of(&mut bob).await;
    assert_eq!(from_alice, ("ello world!".to_string(), 4));
    assert_eq!(from_alice, from_bob);
}

#[tokio::test]
async fn test_invalid_operation_is_rejected() {
    let (addr, _dir) = start_test_server().await;
    let mut alice = connect(addr, "alice-token").await;
    send(&mut alice, join(None)).await;
    recv_until(&mut alice, |m| matches!(m, ServerMessage::CaughtUp { .. })).await;

    send(&mut alice, submit(OpKind::Delete, -1, 1, "", 0, 7)).await;
    match recv(&mut alice).await {
        ServerMessage::Rejected {
            client_seq, kind, ..
        } => {
            assert_eq!(client_seq, 7);
            assert_eq!(kind, ErrorKind::Validation);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Unparseable frames get an error but keep the connection open
    alice.send(Message::text("{not json")).await.unwrap();
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::Error {
            kind: ErrorKind::Validation,
            ..
        }
    ));

    send(&mut alice, ClientMessage::Ping).await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::Pong));
    assert_eq!(snapshot_of(&mut alice).await, (String::new(), 0));
}

#[tokio::test]
async fn test_submit_before_join_is_rejected() {
    let (addr, _dir) = start_test_server().await;
    let mut bob = connect(addr, "bob-token").await;

    send(&mut bob, submit(OpKind::Insert, 0, 0, "x", 0, 1)).await;
    assert!(matches!(
        recv(&mut bob).await,
        ServerMessage::Rejected {
            kind: ErrorKind::NotJoined,
            ..
        }
    ));
}

#[tokio::test]
async fn test_presence() {
    let (addr, _dir) = start_test_server().await;
    let mut alice = connect(addr, "alice-token").await;
    let mut bob = connect(addr, "bob-token").await;

    send(&mut alice, join(None)).await;
    recv_until(&mut alice, |m| matches!(m, ServerMessage::CaughtUp { .. })).await;
    send(&mut bob, join(None)).await;
    recv_until(&mut bob, |m| matches!(m, ServerMessage::CaughtUp { .. })).await;

    send(
        &mut alice,
        ClientMessage::ListCollaborators {
            doc_id: "groceries".to_string(),
        },
    )
    .await;
    match recv_until(&mut alice, |m| matches!(m, ServerMessage::Collaborators { .. })).await {
        ServerMessage::Collaborators { collaborators, .. } => {
            let users: Vec<_> = collaborators.iter().map(|c| c.user_id.as_str()).collect();
            assert_eq!(users, vec!["alice", "bob"]);
        }
        _ => unreachable!(),
    }

    // Dropping the connection leaves the note
    bob.close(None).await.unwrap();
    assert!(matches!(
        recv_until(&mut alice, |m| matches!(m, ServerMessage::UserLeft { .. })).await,
        ServerMessage::UserLeft { collaborator, .. } if collaborator.user_id == "bob"
    ));
}

#[tokio::test]
async fn test_connection_without_token_is_refused() {
    let (addr, _dir) = start_test_server().await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("unexpected {other:?}"),
    }

    // The query parameter works where headers cannot be set
    let (ws, _) = tokio_test::assert_ok!(
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=bob-token")).await
    );
    drop(ws);
}
