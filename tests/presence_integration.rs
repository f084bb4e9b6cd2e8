//! Presence and permission integration tests.
//!
//! These tests start a real hub and connect real clients, verifying
//! join/leave broadcasts, the inline peer list, viewer write blocking,
//! and awareness relay through the full network stack.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::{Doc, ReadTxn, Text, Transact, WriteTxn};

use cowrite::auth::issue_token;
use cowrite::{
    ClientMessage, CollabHub, DocumentRecord, HubConfig, MemoryStore, Role, ServerMessage, User,
};

const SECRET: &str = "presence-secret";
const DOC: &str = "doc-1";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn user(id: &str) -> User {
    User {
        id: id.into(),
        name: format!("User {id}"),
        email: format!("{id}@example.com"),
    }
}

fn token(user_id: &str) -> String {
    issue_token(SECRET, user_id, 300).unwrap()
}

async fn start_hub() -> (CollabHub, u16, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for id in ["alice", "bob", "carol"] {
        store.insert_user(user(id)).await;
    }
    store
        .insert_document(
            DocumentRecord::new(DOC, "Presence Notes", "alice")
                .with_collaborator("bob", Role::Editor)
                .with_collaborator("carol", Role::Viewer),
        )
        .await
        .unwrap();

    let hub = CollabHub::new(
        HubConfig {
            jwt_secret: SECRET.into(),
            ..HubConfig::default()
        },
        store.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let runner = hub.clone();
    tokio::spawn(async move {
        let _ = runner.serve(listener).await;
    });
    (hub, port, store)
}

async fn ws_connect(port: u16, user_id: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/?token={}", token(user_id));
    let (ws, _resp) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn ws_send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn ws_recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(txt) = frame {
            return ServerMessage::decode(txt.as_str()).unwrap();
        }
    }
}

async fn ws_join(ws: &mut Ws, document_id: &str) -> Vec<cowrite::PeerIdentity> {
    ws_send(
        ws,
        &ClientMessage::JoinDocument {
            document_id: document_id.into(),
        },
    )
    .await;
    match ws_recv(ws).await {
        ServerMessage::YjsSync { .. } => {}
        other => panic!("expected yjs-sync, got {other:?}"),
    }
    match ws_recv(ws).await {
        ServerMessage::JoinAck { success: true, users, .. } => users.unwrap(),
        other => panic!("expected join-ack, got {other:?}"),
    }
}

fn mirror_insert(doc: &Doc, at: u32, text: &str) -> Vec<u8> {
    let sv = {
        let txn = doc.transact();
        txn.state_vector()
    };
    {
        let mut txn = doc.transact_mut();
        let t = txn.get_or_insert_text("content");
        t.insert(&mut txn, at, text);
    }
    let txn = doc.transact();
    txn.encode_diff_v1(&sv)
}

// ─── Presence broadcasts ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_ack_carries_peer_list_inline() {
    let (_hub, port, _store) = start_hub().await;

    let mut alice = ws_connect(port, "alice").await;
    let users = ws_join(&mut alice, DOC).await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id, "alice");
    assert_eq!(users[0].role, Role::Owner);

    let mut bob = ws_connect(port, "bob").await;
    let users = ws_join(&mut bob, DOC).await;
    let mut ids: Vec<&str> = users.iter().map(|u| u.user_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["alice", "bob"]);

    // Alice hears about Bob exactly once — and never about herself.
    match ws_recv(&mut alice).await {
        ServerMessage::UserJoined {
            user_id,
            display_name,
            email,
            ..
        } => {
            assert_eq!(user_id, "bob");
            assert_eq!(display_name, "User bob");
            assert_eq!(email, "bob@example.com");
        }
        other => panic!("expected user-joined, got {other:?}"),
    }
    assert!(
        timeout(Duration::from_millis(200), alice.next()).await.is_err(),
        "no further presence frames expected"
    );
}

#[tokio::test]
async fn test_leave_document_broadcasts_user_left() {
    let (hub, port, _store) = start_hub().await;

    let mut alice = ws_connect(port, "alice").await;
    ws_join(&mut alice, DOC).await;
    let mut bob = ws_connect(port, "bob").await;
    ws_join(&mut bob, DOC).await;
    match ws_recv(&mut alice).await {
        ServerMessage::UserJoined { .. } => {}
        other => panic!("expected user-joined, got {other:?}"),
    }

    ws_send(
        &mut bob,
        &ClientMessage::LeaveDocument {
            document_id: DOC.into(),
        },
    )
    .await;

    match ws_recv(&mut alice).await {
        ServerMessage::UserLeft { user_id, .. } => assert_eq!(user_id, "bob"),
        other => panic!("expected user-left, got {other:?}"),
    }
    // Presence now lists Alice alone.
    let users = hub.rooms().users_in(DOC).await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id, "alice");
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_left_once() {
    let (hub, port, _store) = start_hub().await;

    let mut alice = ws_connect(port, "alice").await;
    ws_join(&mut alice, DOC).await;
    let mut bob = ws_connect(port, "bob").await;
    ws_join(&mut bob, DOC).await;
    match ws_recv(&mut alice).await {
        ServerMessage::UserJoined { .. } => {}
        other => panic!("expected user-joined, got {other:?}"),
    }

    // Bob's socket dies without a leave-document.
    drop(bob);

    match ws_recv(&mut alice).await {
        ServerMessage::UserLeft { user_id, .. } => assert_eq!(user_id, "bob"),
        other => panic!("expected user-left, got {other:?}"),
    }
    assert!(
        timeout(Duration::from_millis(200), alice.next()).await.is_err(),
        "exactly one user-left expected"
    );
    assert_eq!(hub.rooms().users_in(DOC).await.len(), 1);
}

#[tokio::test]
async fn test_leave_without_join_is_silent() {
    let (_hub, port, _store) = start_hub().await;
    let mut ws = ws_connect(port, "alice").await;

    ws_send(
        &mut ws,
        &ClientMessage::LeaveDocument {
            document_id: DOC.into(),
        },
    )
    .await;
    // No ack, no error — the connection just stays healthy.
    assert!(timeout(Duration::from_millis(200), ws.next()).await.is_err());
    ws_join(&mut ws, DOC).await;
}

// ─── Viewer permissions ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_viewer_update_blocked() {
    let (hub, port, _store) = start_hub().await;

    // Alice seeds the document with "hello".
    let alice_mirror = Doc::new();
    let mut alice = ws_connect(port, "alice").await;
    ws_join(&mut alice, DOC).await;
    ws_send(
        &mut alice,
        &ClientMessage::YjsUpdate {
            document_id: DOC.into(),
            update: mirror_insert(&alice_mirror, 0, "hello"),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Carol (viewer) joins and tries to append "!".
    let mut carol = ws_connect(port, "carol").await;
    ws_join(&mut carol, DOC).await;
    match ws_recv(&mut alice).await {
        ServerMessage::UserJoined { user_id, .. } => assert_eq!(user_id, "carol"),
        other => panic!("expected user-joined, got {other:?}"),
    }

    let slot = hub.replicas().peek(DOC).await.unwrap();
    let state_before = slot.state_vector().await;

    let carol_mirror = Doc::new();
    ws_send(
        &mut carol,
        &ClientMessage::YjsUpdate {
            document_id: DOC.into(),
            update: mirror_insert(&carol_mirror, 0, "!"),
        },
    )
    .await;

    // Carol receives exactly one permission-denied…
    match ws_recv(&mut carol).await {
        ServerMessage::PermissionDenied {
            document_id,
            message,
        } => {
            assert_eq!(document_id, DOC);
            assert!(message.contains("cannot edit"), "message: {message}");
        }
        other => panic!("expected permission-denied, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(200), carol.next()).await.is_err());

    // …the replica state vector is unchanged…
    assert_eq!(slot.state_vector().await, state_before);

    // …and Alice sees no yjs-update.
    assert!(
        timeout(Duration::from_millis(200), alice.next()).await.is_err(),
        "no broadcast may result from a viewer update"
    );
}

// ─── Awareness relay ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_awareness_relayed_to_peers_only() {
    let (_hub, port, _store) = start_hub().await;

    let mut alice = ws_connect(port, "alice").await;
    ws_join(&mut alice, DOC).await;
    let mut bob = ws_connect(port, "bob").await;
    ws_join(&mut bob, DOC).await;
    match ws_recv(&mut alice).await {
        ServerMessage::UserJoined { .. } => {}
        other => panic!("expected user-joined, got {other:?}"),
    }

    // Awareness payloads are opaque to the hub; any bytes relay verbatim.
    let payload = vec![7, 7, 7, 1, 2, 3];
    ws_send(
        &mut alice,
        &ClientMessage::YjsAwareness {
            document_id: DOC.into(),
            update: payload.clone(),
        },
    )
    .await;

    match ws_recv(&mut bob).await {
        ServerMessage::YjsAwareness {
            update, user_id, ..
        } => {
            assert_eq!(update, payload);
            assert_eq!(user_id, "alice");
        }
        other => panic!("expected yjs-awareness, got {other:?}"),
    }
    // Never echoed back to the sender.
    assert!(timeout(Duration::from_millis(200), alice.next()).await.is_err());
}

#[tokio::test]
async fn test_viewer_awareness_allowed() {
    let (_hub, port, _store) = start_hub().await;

    let mut alice = ws_connect(port, "alice").await;
    ws_join(&mut alice, DOC).await;
    let mut carol = ws_connect(port, "carol").await;
    ws_join(&mut carol, DOC).await;
    match ws_recv(&mut alice).await {
        ServerMessage::UserJoined { .. } => {}
        other => panic!("expected user-joined, got {other:?}"),
    }

    // Viewers may broadcast presence even though they cannot edit.
    ws_send(
        &mut carol,
        &ClientMessage::YjsAwareness {
            document_id: DOC.into(),
            update: vec![9, 9],
        },
    )
    .await;
    match ws_recv(&mut alice).await {
        ServerMessage::YjsAwareness { user_id, .. } => assert_eq!(user_id, "carol"),
        other => panic!("expected yjs-awareness, got {other:?}"),
    }
}

#[tokio::test]
async fn test_awareness_requires_membership() {
    let (_hub, port, _store) = start_hub().await;
    let mut ws = ws_connect(port, "alice").await;

    // Not joined: the frame is dropped without closing the connection.
    ws_send(
        &mut ws,
        &ClientMessage::YjsAwareness {
            document_id: DOC.into(),
            update: vec![1],
        },
    )
    .await;
    assert!(timeout(Duration::from_millis(200), ws.next()).await.is_err());
    ws_join(&mut ws, DOC).await;
}

// ─── Room isolation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_hub, port, store) = start_hub().await;
    store
        .insert_document(DocumentRecord::new("doc-2", "Other Notes", "alice"))
        .await
        .unwrap();

    let mut watcher = ws_connect(port, "alice").await;
    ws_join(&mut watcher, "doc-2").await;

    let mut editor = ws_connect(port, "bob").await;
    ws_join(&mut editor, DOC).await;
    let mirror = Doc::new();
    ws_send(
        &mut editor,
        &ClientMessage::YjsUpdate {
            document_id: DOC.into(),
            update: mirror_insert(&mirror, 0, "elsewhere"),
        },
    )
    .await;

    // Activity in doc-1 never reaches the doc-2 room.
    assert!(timeout(Duration::from_millis(300), watcher.next()).await.is_err());
}
