// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end tests: real WebSocket clients against a relay on localhost.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use duet_core::{
    IdentityDirectory, MemoryIdentityDirectory, MemoryMessageStore, MessageStore, RelayOptions,
    SessionManager, SqliteIdentityDirectory, SqliteMessageStore,
};
use duet_relay::connection_limit::ConnectionLimiter;
use duet_relay::handler::RelayContext;
use duet_relay::metrics::RelayMetrics;
use duet_relay::rate_limit::RateLimiter;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_MESSAGE_SIZE: usize = 4096;

fn options() -> RelayOptions {
    RelayOptions {
        push_timeout: Duration::from_secs(1),
        store_timeout: Duration::from_secs(1),
        backlog_limit: 100,
    }
}

async fn start_relay(
    directory: Arc<dyn IdentityDirectory>,
    store: Arc<dyn MessageStore>,
) -> SocketAddr {
    let ctx = Arc::new(RelayContext {
        manager: Arc::new(SessionManager::new(directory, store, options())),
        rate_limiter: Arc::new(RateLimiter::new(1000)),
        metrics: RelayMetrics::new().unwrap(),
        max_message_size: MAX_MESSAGE_SIZE,
        history_max: 100,
        auto_register: false,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(duet_relay::serve(listener, ctx, ConnectionLimiter::new(16)));
    addr
}

async fn start_memory_relay() -> SocketAddr {
    let directory =
        MemoryIdentityDirectory::with_handles(["alice", "bob", "carol"]).unwrap();
    start_relay(Arc::new(directory), Arc::new(MemoryMessageStore::new())).await
}

async fn start_sqlite_relay(path: &Path) -> SocketAddr {
    let directory = SqliteIdentityDirectory::open(path).unwrap();
    let store = SqliteMessageStore::open(path, Duration::from_secs(1)).unwrap();
    start_relay(Arc::new(directory), Arc::new(store)).await
}

async fn connect(addr: SocketAddr, handle: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws/{}", addr, handle))
        .await
        .unwrap();
    ws
}

/// Connects and waits until the relay has registered the session.
async fn connect_online(addr: SocketAddr, handle: &str) -> Client {
    let mut ws = connect(addr, handle).await;
    send(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut ws).await["type"], "pong");
    ws
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn recv(ws: &mut Client) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_online_recipient_receives_push() {
    let addr = start_memory_relay().await;
    let mut bob = connect_online(addr, "bob").await;
    let mut alice = connect_online(addr, "alice").await;

    send(&mut alice, json!({"recipient": "bob", "body": "hi bob"})).await;

    let ack = recv(&mut alice).await;
    assert_eq!(ack["type"], "sent");
    assert_eq!(ack["recipient"], "bob");

    let chat = recv(&mut bob).await;
    assert_eq!(chat["type"], "chat");
    assert_eq!(chat["sender"], "alice");
    assert_eq!(chat["body"], "hi bob");
    assert_eq!(chat["id"], ack["id"]);
}

#[tokio::test]
async fn test_offline_recipient_gets_backlog_and_history() {
    let addr = start_memory_relay().await;
    let mut alice = connect_online(addr, "alice").await;

    send(&mut alice, json!({"type": "chat", "recipient": "bob", "body": "hi"})).await;
    assert_eq!(recv(&mut alice).await["type"], "sent");

    let mut bob = connect(addr, "bob").await;
    let chat = recv(&mut bob).await;
    assert_eq!(chat["type"], "chat");
    assert_eq!(chat["body"], "hi");

    send(&mut bob, json!({"type": "history", "with": "alice", "limit": 10})).await;
    let history = recv(&mut bob).await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["with"], "alice");
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["body"], "hi");
    assert_eq!(messages[0]["sender"], "alice");
    assert_eq!(messages[0]["recipient"], "bob");
    assert_eq!(messages[0]["delivered"], true);
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let addr = start_memory_relay().await;
    let mut first = connect_online(addr, "bob").await;
    let mut second = connect(addr, "bob").await;

    let closed = timeout(Duration::from_secs(5), first.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match closed {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4000);
            assert_eq!(frame.reason, "superseded");
        }
        other => panic!("expected close frame, got {:?}", other),
    }

    let mut alice = connect_online(addr, "alice").await;
    send(&mut alice, json!({"recipient": "bob", "body": "to the new one"})).await;
    assert_eq!(recv(&mut alice).await["type"], "sent");

    let chat = recv(&mut second).await;
    assert_eq!(chat["body"], "to the new one");
}

#[tokio::test]
async fn test_unknown_recipient_reports_error() {
    let addr = start_memory_relay().await;
    let mut alice = connect_online(addr, "alice").await;

    send(&mut alice, json!({"recipient": "mallory", "body": "hi"})).await;

    let error = recv(&mut alice).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["reason"], "recipient_not_found");
}

#[tokio::test]
async fn test_invalid_and_oversized_frames_report_errors() {
    let addr = start_memory_relay().await;
    let mut alice = connect_online(addr, "alice").await;

    send(&mut alice, json!({"target_id": "bob", "message": "hi"})).await;
    assert_eq!(recv(&mut alice).await["reason"], "invalid_frame");

    let body = "x".repeat(MAX_MESSAGE_SIZE + 1);
    send(&mut alice, json!({"recipient": "bob", "body": body})).await;
    assert_eq!(recv(&mut alice).await["reason"], "message_too_large");

    send(&mut alice, json!({"recipient": "alice", "body": "me"})).await;
    assert_eq!(recv(&mut alice).await["reason"], "invalid_message");
}

#[tokio::test]
async fn test_unknown_handle_rejected_at_handshake() {
    let addr = start_memory_relay().await;

    match connect_async(format!("ws://{}/ws/mallory", addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
    }
    match connect_async(format!("ws://{}/chat", addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_stored_message_survives_relay_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("duet.db");
    SqliteIdentityDirectory::open(&path)
        .unwrap()
        .register("alice")
        .unwrap();
    SqliteIdentityDirectory::open(&path)
        .unwrap()
        .register("bob")
        .unwrap();

    let first = start_sqlite_relay(&path).await;
    let mut alice = connect_online(first, "alice").await;
    send(&mut alice, json!({"recipient": "bob", "body": "while you were out"})).await;
    assert_eq!(recv(&mut alice).await["type"], "sent");

    let second = start_sqlite_relay(&path).await;
    let mut bob = connect(second, "bob").await;
    let chat = recv(&mut bob).await;
    assert_eq!(chat["body"], "while you were out");
    assert_eq!(chat["sender"], "alice");
}
