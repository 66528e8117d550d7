//! Integration tests for the WebSocket relay: handshake, forwarding, supersession,
//! failure isolation, and keepalive.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_server::auth::jwt::{issue_access_token, JwtVerifier};
use relay_server::config::{ForwardMode, SessionConfig};
use relay_server::db::init_memory_db;
use relay_server::db::models::{StoredMessage, UserId};
use relay_server::db::store::{MessageStore, SqliteMessageStore};
use relay_server::error::StoreError;
use relay_server::state::AppState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &[u8] = b"relay-integration-test-secret-32b";

/// Store that refuses any message whose body is "boom".
struct FlakyStore {
    inner: SqliteMessageStore,
}

impl MessageStore for FlakyStore {
    fn append(
        &self,
        sender: UserId,
        receiver: UserId,
        body: &str,
    ) -> Result<StoredMessage, StoreError> {
        if body == "boom" {
            return Err(StoreError::Unavailable("refusing boom".to_string()));
        }
        self.inner.append(sender, receiver, body)
    }

    fn history(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.history(a, b)
    }

    fn recent_contacts(&self, user: UserId) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.recent_contacts(user)
    }
}

fn sqlite_store() -> SqliteMessageStore {
    SqliteMessageStore::new(init_memory_db().expect("Failed to init DB"))
}

/// Helper: start the server on a random port and return (addr, state).
async fn start_test_server_with(
    store: Arc<dyn MessageStore>,
    session: SessionConfig,
) -> (SocketAddr, AppState) {
    let state = AppState::new(Arc::new(JwtVerifier::new(SECRET)), store, session);

    let app = relay_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, state)
}

async fn start_test_server() -> (SocketAddr, AppState) {
    start_test_server_with(Arc::new(sqlite_store()), SessionConfig::default()).await
}

fn token_for(user_id: UserId) -> String {
    issue_access_token(SECRET, user_id, Some("tester"), 3600).unwrap()
}

async fn connect_raw(addr: SocketAddr, query: &str) -> WsStream {
    let ws_url = format!("ws://{}/ws{}", addr, query);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Connect as `user_id` and wait until the registry holds a live handle for it.
async fn connect_as(addr: SocketAddr, state: &AppState, user_id: UserId) -> WsStream {
    let previous = state.connections.get(user_id).map(|h| h.id());
    let ws = connect_raw(addr, &format!("?token={}", token_for(user_id))).await;

    for _ in 0..100 {
        if let Some(handle) = state.connections.get(user_id) {
            if Some(handle.id()) != previous {
                return ws;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("user {} never registered", user_id);
}

/// Next non-control frame, or None on timeout.
async fn next_frame(ws: &mut WsStream, wait: Duration) -> Option<Message> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        match msg {
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(msg) => return Some(msg),
            Err(_) => return None,
        }
    }
}

async fn expect_text(ws: &mut WsStream) -> String {
    match next_frame(ws, Duration::from_secs(2)).await {
        Some(Message::Text(text)) => text.as_str().to_string(),
        other => panic!("Expected text frame, got: {:?}", other),
    }
}

async fn expect_close_code(ws: &mut WsStream, code: u16) {
    match next_frame(ws, Duration::from_secs(2)).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(frame.code, CloseCode::from(code), "unexpected close code");
        }
        other => panic!("Expected close frame {}, got: {:?}", code, other),
    }
}

async fn wait_until_gone(state: &AppState, user_id: UserId) {
    for _ in 0..300 {
        if !state.connections.contains(user_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("user {} was never unregistered", user_id);
}

#[tokio::test]
async fn test_message_forwarded_verbatim_and_persisted() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    let raw = r#"{"receiver_id":2,"msg":"hi"}"#;
    alice.send(Message::Text(raw.into())).await.unwrap();
    assert_eq!(expect_text(&mut bob).await, raw);

    // Bob goes away; the reply is stored but reaches nobody
    bob.close(None).await.unwrap();
    wait_until_gone(&state, 2).await;

    alice
        .send(Message::Text(r#"{"receiver_id":2,"msg":"bye"}"#.into()))
        .await
        .unwrap();

    let mut history = Vec::new();
    for _ in 0..100 {
        history = state.store.history(1, 2).unwrap();
        if history.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let bodies: Vec<_> = history.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, ["hi", "bye"]);
    assert!(history.iter().all(|m| m.sender_id == 1 && m.receiver_id == 2));

    // Nothing was echoed back to the sender
    assert!(next_frame(&mut alice, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_sender_cannot_be_spoofed() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    alice
        .send(Message::Text(
            r#"{"sender_id":99,"receiver_id":2,"msg":"it's me"}"#.into(),
        ))
        .await
        .unwrap();
    expect_text(&mut bob).await;

    let history = state.store.history(1, 2).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender_id, 1);
    assert!(state.store.history(99, 2).unwrap().is_empty());
}

#[tokio::test]
async fn test_enriched_mode_sends_persisted_record() {
    let session = SessionConfig {
        forward_mode: ForwardMode::Enriched,
        ..SessionConfig::default()
    };
    let (addr, state) = start_test_server_with(Arc::new(sqlite_store()), session).await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    alice
        .send(Message::Text(r#"{"receiver":2,"body":"hey"}"#.into()))
        .await
        .unwrap();

    let value: serde_json::Value = serde_json::from_str(&expect_text(&mut bob).await).unwrap();
    assert_eq!(value["sender_id"], 1);
    assert_eq!(value["receiver_id"], 2);
    assert_eq!(value["msg"], "hey");
    assert!(value["id"].as_i64().is_some());
}

#[tokio::test]
async fn test_per_sender_order_is_preserved() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    for i in 0..20 {
        let frame = format!(r#"{{"receiver_id":2,"msg":"m{}"}}"#, i);
        alice.send(Message::Text(frame.into())).await.unwrap();
    }

    for i in 0..20 {
        let value: serde_json::Value =
            serde_json::from_str(&expect_text(&mut bob).await).unwrap();
        assert_eq!(value["msg"], format!("m{}", i));
    }
}

#[tokio::test]
async fn test_self_addressed_message_is_dropped() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    alice
        .send(Message::Text(r#"{"receiver_id":1,"msg":"self"}"#.into()))
        .await
        .unwrap();
    let raw = r#"{"receiver_id":2,"msg":"after self"}"#;
    alice.send(Message::Text(raw.into())).await.unwrap();

    // The session keeps relaying, and the self-addressed frame left no trace
    assert_eq!(expect_text(&mut bob).await, raw);
    assert!(next_frame(&mut alice, Duration::from_millis(300)).await.is_none());
    assert!(state.store.history(1, 1).unwrap().is_empty());
    let bodies: Vec<_> = state
        .store
        .history(1, 2)
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, ["after self"]);
    assert!(state.connections.contains(1));
}

#[tokio::test]
async fn test_handshake_rejections_use_close_codes() {
    let (addr, _state) = start_test_server().await;

    let mut ws = connect_raw(addr, "?token=invalid_jwt_token").await;
    expect_close_code(&mut ws, 4002).await;

    let mut ws = connect_raw(addr, "").await;
    expect_close_code(&mut ws, 4002).await;

    let expired = issue_access_token(SECRET, 1, None, -3600).unwrap();
    let mut ws = connect_raw(addr, &format!("?token={}", expired)).await;
    expect_close_code(&mut ws, 4001).await;

    let foreign = issue_access_token(b"some-other-secret", 1, None, 3600).unwrap();
    let mut ws = connect_raw(addr, &format!("?token={}", foreign)).await;
    expect_close_code(&mut ws, 4002).await;
}

#[tokio::test]
async fn test_bearer_header_handshake() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let (addr, state) = start_test_server().await;
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", token_for(7)).parse().unwrap(),
    );
    let (_ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("Failed to connect with bearer header");

    for _ in 0..100 {
        if state.connections.contains(7) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bearer-authenticated user never registered");
}

#[tokio::test]
async fn test_newer_connection_supersedes_older() {
    let (addr, state) = start_test_server().await;
    let mut first = connect_as(addr, &state, 1).await;
    let first_id = state.connections.get(1).unwrap().id();

    let mut second = connect_as(addr, &state, 1).await;
    expect_close_code(&mut first, 4000).await;

    // The loser's cleanup must not evict the winner
    tokio::time::sleep(Duration::from_millis(200)).await;
    let live = state.connections.get(1).expect("successor still registered");
    assert_ne!(live.id(), first_id);
    assert_eq!(state.connections.len(), 1);

    let mut bob = connect_as(addr, &state, 2).await;
    let raw = r#"{"receiver_id":1,"msg":"which one?"}"#;
    bob.send(Message::Text(raw.into())).await.unwrap();
    assert_eq!(expect_text(&mut second).await, raw);
}

#[tokio::test]
async fn test_superseded_connection_relays_nothing_further() {
    let (addr, state) = start_test_server().await;
    let mut bob = connect_as(addr, &state, 2).await;

    for round in 0..5 {
        let mut old = connect_as(addr, &state, 1).await;
        let mut current = connect_as(addr, &state, 1).await;

        // Replaced before these are sent, so none of them may reach bob
        for i in 0..20 {
            let frame = format!(r#"{{"receiver_id":2,"msg":"stale {}-{}"}}"#, round, i);
            let _ = old.send(Message::Text(frame.into())).await;
        }
        expect_close_code(&mut old, 4000).await;

        let fresh = format!(r#"{{"receiver_id":2,"msg":"fresh {}"}}"#, round);
        current.send(Message::Text(fresh.clone().into())).await.unwrap();
        assert_eq!(expect_text(&mut bob).await, fresh);
    }

    let stale = state
        .store
        .history(1, 2)
        .unwrap()
        .into_iter()
        .filter(|m| m.body.starts_with("stale"))
        .count();
    assert_eq!(stale, 0);
}

#[tokio::test]
async fn test_malformed_frame_does_not_end_session() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    for bad in ["not json", r#"{"msg":"no receiver"}"#, r#"{"receiver_id":0,"msg":"x"}"#] {
        alice.send(Message::Text(bad.into())).await.unwrap();
    }
    let raw = r#"{"receiver_id":2,"msg":"still here"}"#;
    alice.send(Message::Text(raw.into())).await.unwrap();

    assert_eq!(expect_text(&mut bob).await, raw);
    assert!(state.connections.contains(1));
    assert_eq!(state.store.history(1, 2).unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_failure_drops_message_but_not_session() {
    let store = Arc::new(FlakyStore {
        inner: sqlite_store(),
    });
    let (addr, state) = start_test_server_with(store, SessionConfig::default()).await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    alice
        .send(Message::Text(r#"{"receiver_id":2,"msg":"boom"}"#.into()))
        .await
        .unwrap();
    let raw = r#"{"receiver_id":2,"msg":"after"}"#;
    alice.send(Message::Text(raw.into())).await.unwrap();

    // The failed message is never forwarded
    assert_eq!(expect_text(&mut bob).await, raw);
    let bodies: Vec<_> = state
        .store
        .history(1, 2)
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, ["after"]);
}

#[tokio::test]
async fn test_binary_frame_relayed_as_binary() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;
    let mut bob = connect_as(addr, &state, 2).await;

    let raw = br#"{"receiver_id":2,"msg":"bytes"}"#.to_vec();
    alice.send(Message::Binary(raw.clone().into())).await.unwrap();

    match next_frame(&mut bob, Duration::from_secs(2)).await {
        Some(Message::Binary(data)) => assert_eq!(data.as_ref(), raw.as_slice()),
        other => panic!("Expected binary frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_unregisters_user() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;

    alice.close(None).await.unwrap();
    wait_until_gone(&state, 1).await;

    // Reconnect should work fine (connection was cleaned up)
    let _alice = connect_as(addr, &state, 1).await;
    assert!(state.connections.contains(1));
}

#[tokio::test]
async fn test_client_ping_gets_pong() {
    let (addr, state) = start_test_server().await;
    let mut alice = connect_as(addr, &state, 1).await;

    alice
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .expect("Failed to send ping");

    let msg = tokio::time::timeout(Duration::from_secs(2), alice.next())
        .await
        .expect("Expected pong within timeout");
    match msg {
        Some(Ok(Message::Pong(data))) => assert_eq!(data.as_ref(), &[42, 43, 44]),
        other => panic!("Expected Pong message, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_unresponsive_client_is_dropped() {
    let session = SessionConfig {
        ping_interval_secs: 1,
        pong_timeout_secs: 1,
        ..SessionConfig::default()
    };
    let (addr, state) = start_test_server_with(Arc::new(sqlite_store()), session).await;

    // Never polled, so server pings go unanswered
    let _silent = connect_as(addr, &state, 1).await;

    for _ in 0..50 {
        if !state.connections.contains(1) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("unresponsive client was never dropped");
}
