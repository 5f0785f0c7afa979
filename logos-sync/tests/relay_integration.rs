//! Integration tests for sessions over the WebSocket relay.
//!
//! These tests start a real relay and connect real `WsTransport` clients,
//! verifying the full pipeline from session to socket and back.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use logos_sync::storage::MemoryStore;
use logos_sync::transport::frame::{ClientFrame, ServerFrame};
use logos_sync::transport::{Transport, WsTransport};
use logos_sync::{
    ConnectionState, RelayConfig, RelayServer, Session, SyncConfig, SyncError, SyncedItem,
    TransportError,
};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Start a relay on a free port, return it with its websocket URL.
async fn start_test_relay(config: RelayConfig) -> (Arc<RelayServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(RelayServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (server, url)
}

async fn join(url: &str, store: &Arc<MemoryStore>, user: &str) -> Session {
    let transport = Arc::new(WsTransport::new(url).with_ack_timeout(Duration::from_secs(2)));
    Session::join(transport, store.clone(), SyncConfig::default(), "r1", user, user)
        .await
        .unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let result = timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_session_connects_through_relay() {
    let (server, url) = start_test_relay(RelayConfig::default()).await;
    let store = Arc::new(MemoryStore::new());

    let alice = join(&url, &store, "alice").await;
    assert_eq!(alice.connection_state(), ConnectionState::Connected);

    let stats = server.hub().channel_stats("room:r1").unwrap();
    assert_eq!(stats.subscribers, 1);
    assert_eq!(stats.tracked, 1);
    assert_eq!(server.stats().active_connections, 1);
}

#[tokio::test]
async fn test_presence_and_items_through_relay() {
    let (_server, url) = start_test_relay(RelayConfig::default()).await;
    let store = Arc::new(MemoryStore::new());

    let alice = join(&url, &store, "alice").await;
    let bob = join(&url, &store, "bob").await;

    eventually("alice sees bob", || alice.others().len() == 1).await;
    eventually("bob sees alice", || bob.others().len() == 1).await;
    assert_eq!(bob.others()[0].user_id, "alice");

    let note = SyncedItem::new("x1", "note").with_field("text", "over the wire");
    alice.broadcast_item_create(note.clone()).unwrap();
    eventually("bob has x1", || bob.item("x1").is_some()).await;
    assert_eq!(bob.item("x1"), Some(note));

    alice.leave().await;
    eventually("alice gone", || bob.others().is_empty()).await;
}

#[tokio::test]
async fn test_unreachable_relay_fails_join() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = Arc::new(WsTransport::new(url));
    let err = Session::join(
        transport,
        Arc::new(MemoryStore::new()),
        SyncConfig::default(),
        "r1",
        "alice",
        "Alice",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SyncError::Transport(TransportError::Unreachable(_))));
}

#[tokio::test]
async fn test_full_channel_rejected() {
    let config = RelayConfig {
        max_peers_per_channel: 1,
        ..RelayConfig::default()
    };
    let (_server, url) = start_test_relay(config).await;
    let store = Arc::new(MemoryStore::new());

    let _alice = join(&url, &store, "alice").await;
    let transport = Arc::new(WsTransport::new(url.as_str()));
    let err = transport.open_channel("room:r1").await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected(_)));
    assert_eq!(transport.connection_count(), 0);
}

#[tokio::test]
async fn test_relay_requires_open_first() {
    let (server, url) = start_test_relay(RelayConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let frame = ClientFrame::Track { payload: b"{}".to_vec() };
    ws.send(Message::Binary(frame.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match reply {
        Message::Binary(data) => {
            assert!(matches!(ServerFrame::decode(&data).unwrap(), ServerFrame::Error { .. }));
        }
        other => panic!("expected error frame, got {other:?}"),
    }
    eventually("rejection counted", || server.stats().frames_rejected == 1).await;
}

#[tokio::test]
async fn test_relay_survives_garbage_frames() {
    let (server, url) = start_test_relay(RelayConfig::default()).await;
    let store = Arc::new(MemoryStore::new());
    let bob = join(&url, &store, "bob").await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into())).await.unwrap();
    ws.send(Message::Text("hello".into())).await.unwrap();
    drop(ws);

    eventually("garbage counted", || server.stats().frames_rejected >= 1).await;
    let alice = join(&url, &store, "alice").await;
    eventually("bob sees alice", || bob.others().len() == 1).await;
    assert_eq!(alice.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_server_drop_releases_client_connection() {
    let (server, url) = start_test_relay(RelayConfig::default()).await;
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(WsTransport::new(url.as_str()).with_ack_timeout(Duration::from_secs(2)));

    for _ in 0..3 {
        let session = Session::join(transport.clone(), store.clone(), SyncConfig::default(), "r1", "alice", "Alice")
            .await
            .unwrap();
        let handle = session.channel_handle().unwrap();
        assert_eq!(transport.connection_count(), 1);

        assert!(server.hub().disconnect(&handle));
        eventually("session disconnected", || {
            session.connection_state() == ConnectionState::Disconnected
        })
        .await;
        session.leave().await;
        eventually("client connection released", || transport.connection_count() == 0).await;
    }
}

#[tokio::test]
async fn test_dropped_session_leaves_relay_room() {
    let (server, url) = start_test_relay(RelayConfig::default()).await;
    let store = Arc::new(MemoryStore::new());

    let alice = join(&url, &store, "alice").await;
    let bob = join(&url, &store, "bob").await;
    eventually("alice sees bob", || alice.others().len() == 1).await;

    drop(bob);

    eventually("alice sees bob leave", || alice.others().is_empty()).await;
    eventually("relay drops bob", || {
        server.hub().channel_stats("room:r1").map(|s| s.subscribers) == Some(1)
    })
    .await;
}
