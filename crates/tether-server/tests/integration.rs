//! End-to-end tests against a real server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use tether_server::config::ServerConfig;
use tether_server::server::TetherServer;
use tether_server::websocket::dispatch::{
    HandlerError, HandlerRegistry, InboundContext, MessageHandler,
};
use tether_session::{DeltaEngine, SessionStore, TokenIssuer};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    ws_url: String,
    http_url: String,
    server: Arc<TetherServer>,
}

// ── Test handlers ──

struct ExplodingHandler;

#[async_trait]
impl MessageHandler for ExplodingHandler {
    async fn handle(
        &self,
        _data: Value,
        _ctx: &InboundContext,
    ) -> Result<Option<Value>, HandlerError> {
        panic!("handler blew up");
    }
}

/// Routes `data.text` to `data.to` through the registry.
struct RelayHandler;

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn handle(
        &self,
        data: Value,
        ctx: &InboundContext,
    ) -> Result<Option<Value>, HandlerError> {
        let to = data["to"].as_str().ok_or_else(|| HandlerError::Invalid("missing to".into()))?;
        let delivered = ctx.registry.send_to(
            to,
            &json!({"type": "relay", "data": {"from": ctx.client_id, "text": data["text"]}}),
        );
        Ok(Some(json!({ "delivered": delivered })))
    }
}

// ── Helpers ──

async fn boot_with(config: ServerConfig) -> TestServer {
    let store = Arc::new(SessionStore::new(30, Arc::new(TokenIssuer::random())));
    let mut handlers = HandlerRegistry::with_builtin(config.handler_timeout());
    handlers.register("explode", ExplodingHandler);
    handlers.register("relay", RelayHandler);

    let server = Arc::new(TetherServer::new(config, store, Arc::new(DeltaEngine::new()), handlers));
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        ws_url: format!("ws://{addr}/ws"),
        http_url: format!("http://{addr}"),
        server,
    }
}

async fn boot() -> TestServer {
    boot_with(ServerConfig::default()).await
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: &Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn recv_close(ws: &mut WsStream) -> (u16, String) {
    loop {
        match timeout(TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (frame.code.into(), frame.reason.as_str().to_owned());
            }
            Some(Ok(Message::Close(None))) | None | Some(Err(_)) => {
                panic!("closed without a close frame")
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Connect and complete the handshake.
async fn handshake(url: &str, client_id: &str, session_id: Option<&str>) -> WsStream {
    let mut ws = connect(url).await;
    let mut hello = json!({"type": "connect", "client_id": client_id, "token": "tok"});
    if let Some(sid) = session_id {
        hello["session_id"] = json!(sid);
    }
    send_json(&mut ws, &hello).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "connected", "handshake failed for {client_id}: {ack}");
    ws
}

async fn wait_until_gone(server: &TetherServer, client_id: &str) {
    timeout(TIMEOUT, async {
        while server.registry().contains(client_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn init_session(http_url: &str, body: &Value) -> Value {
    reqwest::Client::new()
        .post(format!("{http_url}/session/init"))
        .json(body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// ── Handshake ──

#[tokio::test]
async fn handshake_is_acknowledged() {
    let ts = boot().await;
    let mut ws = connect(&ts.ws_url).await;
    send_json(&mut ws, &json!({"type": "connect", "client_id": "alpha", "token": "t"})).await;

    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "connected");
    assert_eq!(ack["data"]["client_id"], "alpha");
    assert_eq!(ack["data"]["message"], "Welcome, alpha");
    assert!(ts.server.registry().contains("alpha"));
}

#[tokio::test]
async fn non_connect_first_message_is_rejected() {
    let ts = boot().await;
    let mut ws = connect(&ts.ws_url).await;
    send_json(&mut ws, &json!({"type": "ping"})).await;
    assert_eq!(recv_close(&mut ws).await, (1008, "expected connect message".into()));
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let ts = boot().await;
    let mut ws = connect(&ts.ws_url).await;
    send_json(&mut ws, &json!({"type": "connect", "client_id": "alpha"})).await;
    assert_eq!(recv_close(&mut ws).await, (1008, "missing token".into()));
    assert!(!ts.server.registry().contains("alpha"));
}

#[tokio::test]
async fn binary_handshake_is_accepted_when_utf8() {
    let ts = boot().await;
    let mut ws = connect(&ts.ws_url).await;
    let hello = json!({"type": "connect", "client_id": "bin", "token": "t"}).to_string();
    ws.send(Message::Binary(hello.into_bytes().into())).await.unwrap();
    assert_eq!(recv_json(&mut ws).await["type"], "connected");
}

#[tokio::test]
async fn handshake_timeout_closes_with_4408() {
    let ts = boot_with(ServerConfig {
        handshake_timeout_ms: 200,
        ..ServerConfig::default()
    })
    .await;
    let mut ws = connect(&ts.ws_url).await;
    assert_eq!(recv_close(&mut ws).await, (4408, "handshake timeout".into()));
}

#[tokio::test]
async fn duplicate_client_id_is_rejected_until_first_disconnects() {
    let ts = boot().await;
    let mut first = handshake(&ts.ws_url, "X", None).await;

    let mut second = connect(&ts.ws_url).await;
    send_json(&mut second, &json!({"type": "connect", "client_id": "X", "token": "t"})).await;
    assert_eq!(recv_close(&mut second).await, (1008, "client_id already connected".into()));

    // The original connection is untouched.
    send_json(&mut first, &json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut first).await["type"], "ping.result");

    first.close(None).await.unwrap();
    wait_until_gone(&ts.server, "X").await;

    let mut third = handshake(&ts.ws_url, "X", None).await;
    send_json(&mut third, &json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut third).await["type"], "ping.result");
}

#[tokio::test]
async fn capacity_limit_rejects_with_1013() {
    let ts = boot_with(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let _first = handshake(&ts.ws_url, "one", None).await;

    let mut second = connect(&ts.ws_url).await;
    send_json(&mut second, &json!({"type": "connect", "client_id": "two", "token": "t"})).await;
    assert_eq!(recv_close(&mut second).await, (1013, "server at capacity".into()));
}

// ── Heartbeat ──

#[tokio::test]
async fn silent_client_is_closed_with_heartbeat_timeout() {
    // The first check lands one interval in, already past the timeout, so
    // at most one Ping precedes the close frame.
    let ts = boot_with(ServerConfig {
        heartbeat_interval_ms: 300,
        heartbeat_timeout_ms: 100,
        ..ServerConfig::default()
    })
    .await;
    let mut ws = handshake(&ts.ws_url, "silent", None).await;

    // Not reading means no Pong goes back.
    wait_until_gone(&ts.server, "silent").await;
    assert_eq!(recv_close(&mut ws).await, (1001, "heartbeat timeout".into()));
    assert_eq!(ts.server.registry().count(), 0);
}

#[tokio::test]
async fn responsive_client_survives_heartbeats() {
    let ts = boot_with(ServerConfig {
        heartbeat_interval_ms: 100,
        heartbeat_timeout_ms: 400,
        ..ServerConfig::default()
    })
    .await;
    let mut ws = handshake(&ts.ws_url, "chatty", None).await;

    // Reading lets the client answer each Ping.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(900);
    while tokio::time::Instant::now() < deadline {
        if let Ok(frame) = tokio::time::timeout_at(deadline, ws.next()).await {
            assert!(matches!(frame, Some(Ok(Message::Ping(_)))), "unexpected frame: {frame:?}");
        }
    }
    assert!(ts.server.registry().contains("chatty"));
    send_json(&mut ws, &json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "ping.result");
}

// ── Dispatch ──

#[tokio::test]
async fn unknown_type_keeps_connection_open() {
    let ts = boot().await;
    let mut ws = handshake(&ts.ws_url, "c", None).await;

    send_json(&mut ws, &json!({"type": "does.not.exist", "request_id": "r1"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "UNKNOWN_TYPE");
    assert_eq!(reply["request_id"], "r1");

    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(recv_json(&mut ws).await["data"]["code"], "INVALID_MESSAGE");

    send_json(&mut ws, &json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "ping.result");
}

#[tokio::test]
async fn handler_panic_closes_only_that_connection() {
    let ts = boot().await;
    let mut doomed = handshake(&ts.ws_url, "doomed", None).await;
    let mut bystander = handshake(&ts.ws_url, "bystander", None).await;

    send_json(&mut doomed, &json!({"type": "explode"})).await;
    assert_eq!(recv_close(&mut doomed).await, (1011, "internal error".into()));
    wait_until_gone(&ts.server, "doomed").await;

    send_json(&mut bystander, &json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut bystander).await["type"], "ping.result");
    assert!(ts.server.registry().contains("bystander"));
}

#[tokio::test]
async fn handlers_can_route_to_other_clients() {
    let ts = boot().await;
    let mut sender = handshake(&ts.ws_url, "sender", None).await;
    let mut receiver = handshake(&ts.ws_url, "receiver", None).await;

    let relay = json!({"type": "relay", "data": {"to": "receiver", "text": "hi"}});
    send_json(&mut sender, &relay).await;
    let ack = recv_json(&mut sender).await;
    assert_eq!(ack["type"], "relay.result");
    assert_eq!(ack["data"]["delivered"], true);

    let relayed = recv_json(&mut receiver).await;
    assert_eq!(relayed["type"], "relay");
    assert_eq!(relayed["data"]["from"], "sender");
    assert_eq!(relayed["data"]["text"], "hi");
}

#[tokio::test]
async fn context_delta_over_websocket() {
    let ts = boot().await;
    let init = init_session(&ts.http_url, &json!({})).await;
    let sid = init["session_id"].as_str().unwrap();
    let mut ws = handshake(&ts.ws_url, "chat", Some(sid)).await;

    let delta = json!({"type": "context.delta", "request_id": 1, "data": {"messages": [
        {"timestamp": 1_640_995_200_000_i64, "content": "a"},
        {"timestamp": 1_640_995_201, "content": "b"},
        {"timestamp": "1640995202000", "content": "c"},
    ]}});
    send_json(&mut ws, &delta).await;
    let first = recv_json(&mut ws).await;
    assert_eq!(first["type"], "context.delta.result");
    assert_eq!(first["request_id"], 1);
    assert_eq!(first["data"]["full_context"], true);
    assert_eq!(first["data"]["messages"].as_array().unwrap().len(), 3);
    assert_eq!(first["data"]["baseline"], 1_640_995_202_000_i64);

    send_json(&mut ws, &delta).await;
    let second = recv_json(&mut ws).await;
    assert_eq!(second["data"]["full_context"], false);
    assert!(second["data"]["messages"].as_array().unwrap().is_empty());

    send_json(&mut ws, &json!({"type": "context.reset"})).await;
    assert_eq!(recv_json(&mut ws).await["data"]["reset"], true);

    send_json(&mut ws, &delta).await;
    assert_eq!(recv_json(&mut ws).await["data"]["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn shutdown_closes_connections_with_1001() {
    let ts = boot().await;
    let mut ws = handshake(&ts.ws_url, "c", None).await;

    ts.server.shutdown().shutdown();
    assert_eq!(recv_close(&mut ws).await, (1001, "server shutting down".into()));
    assert!(ts.server.drain_connections(TIMEOUT).await);
    assert_eq!(ts.server.registry().count(), 0);
}

// ── HTTP ──

#[tokio::test]
async fn init_with_unknown_id_creates_fresh_session() {
    let ts = boot().await;
    let request = json!({"extend_existing": true, "session_id": "unknown"});
    let body = init_session(&ts.http_url, &request).await;
    assert_eq!(body["was_extended"], false);
    let sid = body["session_id"].as_str().unwrap();
    assert_ne!(sid, "unknown");
    assert!(sid.starts_with("sess_"));
    assert!(!body["csrf_token"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn init_extends_and_info_requires_token() {
    let ts = boot().await;
    let created = init_session(&ts.http_url, &json!({})).await;
    let sid = created["session_id"].as_str().unwrap().to_owned();

    let request = json!({"extend_existing": true, "session_id": sid});
    let extended = init_session(&ts.http_url, &request).await;
    assert_eq!(extended["was_extended"], true);
    assert_eq!(extended["session_id"], sid.as_str());
    let token = extended["csrf_token"].as_str().unwrap();

    let client = reqwest::Client::new();
    let url = format!("{}/session/{sid}", ts.http_url);

    let forbidden = client.get(&url).send().await.unwrap();
    assert_eq!(forbidden.status().as_u16(), 403);

    let info = client.get(&url).header("x-csrf-token", token).send().await.unwrap();
    assert_eq!(info.status().as_u16(), 200);
    let info: Value = info.json().await.unwrap();
    assert_eq!(info["session_id"], sid.as_str());
    assert!(info["expires_at"].is_string());
}

#[tokio::test]
async fn health_reports_connections_and_sessions() {
    let ts = boot().await;
    let _ = init_session(&ts.http_url, &json!({})).await;
    let _ws = handshake(&ts.ws_url, "h", None).await;

    let health: Value = reqwest::get(format!("{}/health", ts.http_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["active_sessions"], 1);
}
