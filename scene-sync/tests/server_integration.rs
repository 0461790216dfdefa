//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect raw WebSocket clients,
//! verifying the full sync pipeline over the JSON protocol.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scene_sync::patch::PatchOperation;
use scene_sync::protocol::{
    ClientMessage, CollaborationEvent, Collaborator, Element, ElementPatch, Reply, SceneEvent,
    ServerMessage,
};
use scene_sync::server::{ServerConfig, SyncServer};
use scene_sync::storage::{MemoryStorage, SceneStorage};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and a handle to it.
async fn start_test_server(storage: Arc<dyn SceneStorage>) -> (u16, Arc<SyncServer>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        snapshot_batch_size: None,
        persist_interval_ms: 0,
        storage_path: None,
    };
    let server = Arc::new(SyncServer::with_backend(config, storage));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (port, server)
}

async fn connect(port: u16, scene: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/scene/{scene}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, message: ClientMessage) {
    let text = message.encode().unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            return ServerMessage::decode(&text).unwrap();
        }
    }
}

/// Connect and join, consuming the initial `scene-synced`.
async fn join(port: u16, scene: &str, id: &str) -> (Ws, ServerMessage) {
    let mut ws = connect(port, scene).await;
    send(&mut ws, ClientMessage::Join(Collaborator::new(id))).await;
    let synced = recv(&mut ws).await;
    (ws, synced)
}

fn upsert(id: &str, updated: i64) -> BTreeMap<String, ElementPatch> {
    let mut patch = BTreeMap::new();
    patch.insert(
        id.to_string(),
        Element::new(id, updated).with_field("x", json!(10)).into(),
    );
    patch
}

#[tokio::test]
async fn test_join_receives_snapshot() {
    let (port, _server) = start_test_server(Arc::new(MemoryStorage::new())).await;
    let (_ws, synced) = join(port, "board", "alice").await;

    match synced {
        ServerMessage::Scene(SceneEvent::SceneSynced { elements, collaborators, version }) => {
            assert!(elements.is_empty());
            assert_eq!(version, 0);
            assert!(collaborators.contains_key("alice"));
        }
        other => panic!("expected scene-synced, got {other:?}"),
    }
}

#[tokio::test]
async fn test_edits_fan_out_to_all_clients() {
    let (port, _server) = start_test_server(Arc::new(MemoryStorage::new())).await;
    let (mut alice, _) = join(port, "board", "alice").await;
    let (mut bob, _) = join(port, "board", "bob").await;

    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::from(CollaborationEvent::CollaboratorUpdated(Collaborator::new("bob")))
    );

    send(&mut bob, ClientMessage::PatchElements(upsert("rect", 1))).await;

    let expected: ServerMessage = SceneEvent::SceneElementsDiff {
        diff: upsert("rect", 1),
        version: 1,
    }
    .into();
    assert_eq!(recv(&mut alice).await, expected);
    assert_eq!(recv(&mut bob).await, expected);
}

#[tokio::test]
async fn test_scenes_are_isolated() {
    let (port, _server) = start_test_server(Arc::new(MemoryStorage::new())).await;
    let (mut first, _) = join(port, "one", "alice").await;
    let (mut second, _) = join(port, "two", "bob").await;

    send(&mut first, ClientMessage::PatchElements(upsert("a", 1))).await;
    recv(&mut first).await;

    send(&mut second, ClientMessage::Ping).await;
    // Only the pong arrives: nothing from scene "one".
    assert_eq!(recv(&mut second).await, ServerMessage::from(Reply::Pong));
}

#[tokio::test]
async fn test_structural_conflict_answered_to_sender() {
    let storage = Arc::new(MemoryStorage::new());
    let (port, server) = start_test_server(storage).await;
    let (mut alice, _) = join(port, "board", "alice").await;

    send(&mut alice, ClientMessage::PatchElements(upsert("a", 1))).await;
    recv(&mut alice).await;

    let stale = vec![
        PatchOperation::Test {
            path: "/version".into(),
            value: json!(0),
        },
        PatchOperation::Remove {
            path: "/elements/a".into(),
        },
    ];
    send(&mut alice, ClientMessage::Patch(stale)).await;

    match recv(&mut alice).await {
        ServerMessage::Reply(Reply::Conflict { elements, version }) => {
            assert_eq!(version, 1);
            assert!(elements.contains_key("a"));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(server.stats().await.conflicts, 1);

    let fresh = vec![
        PatchOperation::Test {
            path: "/version".into(),
            value: json!(1),
        },
        PatchOperation::Remove {
            path: "/elements/a".into(),
        },
    ];
    send(&mut alice, ClientMessage::Patch(fresh)).await;
    match recv(&mut alice).await {
        ServerMessage::Scene(SceneEvent::SceneElementsSynced { elements, version }) => {
            assert!(elements.is_empty());
            assert_eq!(version, 2);
        }
        other => panic!("expected scene-elements-synced, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_before_join_is_ignored() {
    let (port, _server) = start_test_server(Arc::new(MemoryStorage::new())).await;
    let (mut alice, _) = join(port, "board", "alice").await;

    let mut bob = connect(port, "board").await;
    let mut early = Collaborator::new("bob");
    early.username = Some("too early".into());
    send(&mut bob, ClientMessage::Update(early)).await;
    send(&mut bob, ClientMessage::Join(Collaborator::new("bob"))).await;

    // Alice's first message is the plain join, not the early update.
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::from(CollaborationEvent::CollaboratorUpdated(Collaborator::new("bob")))
    );
}

#[tokio::test]
async fn test_presence_update_and_leave() {
    let (port, _server) = start_test_server(Arc::new(MemoryStorage::new())).await;
    let (mut alice, _) = join(port, "board", "alice").await;
    let (mut bob, _) = join(port, "board", "bob").await;
    recv(&mut alice).await;

    let mut moved = Collaborator::new("bob");
    moved.pointer = Some(json!({"x": 3, "y": 4}));
    send(&mut bob, ClientMessage::Update(moved.clone())).await;
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::from(CollaborationEvent::CollaboratorUpdated(moved))
    );

    bob.close(None).await.unwrap();
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::from(CollaborationEvent::CollaboratorLeft("bob".into()))
    );
}

#[tokio::test]
async fn test_malformed_message_gets_error() {
    let (port, _server) = start_test_server(Arc::new(MemoryStorage::new())).await;
    let mut ws = connect(port, "board").await;

    ws.send(Message::Text("{\"type\":\"nonsense\"}".into())).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Reply(Reply::Error(_))));

    send(&mut ws, ClientMessage::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::from(Reply::Pong));
}

#[tokio::test]
async fn test_storage_failure_reported() {
    let storage = Arc::new(MemoryStorage::new());
    let (port, _server) = start_test_server(storage.clone()).await;
    let (mut alice, _) = join(port, "board", "alice").await;

    storage.set_fail_saves(true);
    send(&mut alice, ClientMessage::PatchElements(upsert("a", 1))).await;

    // The merge is kept and broadcast, and the sender learns it was not saved.
    let received = [recv(&mut alice).await, recv(&mut alice).await];
    assert!(received.iter().any(|m| matches!(
        m,
        ServerMessage::Scene(SceneEvent::SceneElementsDiff { version: 1, .. })
    )));
    assert!(received
        .iter()
        .any(|m| matches!(m, ServerMessage::Reply(Reply::Error(_)))));
}

#[tokio::test]
async fn test_unknown_path_rejected() {
    let (port, _server) = start_test_server(Arc::new(MemoryStorage::new())).await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_last_disconnect_persists_and_closes_room() {
    let storage = Arc::new(MemoryStorage::new());
    let (port, server) = start_test_server(storage.clone()).await;

    let (mut alice, _) = join(port, "board", "alice").await;
    send(&mut alice, ClientMessage::PatchElements(upsert("kept", 7))).await;
    recv(&mut alice).await;
    alice.close(None).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while server.rooms().room_count().await > 0 || server.stats().await.active_connections > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room was not closed");

    let saved = storage.get("board").unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(saved.elements["kept"].updated, 7);

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 0);

    // A new connection resumes from storage.
    let (_ws, synced) = join(port, "board", "bob").await;
    assert!(matches!(
        synced,
        ServerMessage::Scene(SceneEvent::SceneSynced { version: 1, .. })
    ));
}
