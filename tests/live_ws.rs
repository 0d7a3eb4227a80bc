//! Live WebSocket protocol over a real server: connect, auth, subscribe,
//! broadcast delivery, and reconnect detection.

use futures_util::{SinkExt, StreamExt};
use marketsim_backend::dispatch::CircuitRegistry;
use marketsim_backend::live::{
    BroadcastHub, BroadcastKind, BusMessage, InProcessBus, LiveState, PubSub,
};
use marketsim_backend::models::Agent;
use marketsim_backend::server::{router, AppState};
use marketsim_backend::store::SqliteStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    addr: std::net::SocketAddr,
    bus: Arc<InProcessBus>,
    store: SqliteStore,
    current_tick: Arc<AtomicU64>,
}

async fn start_server() -> TestServer {
    let store = SqliteStore::open(":memory:").unwrap();
    let bus = Arc::new(InProcessBus::new(256));
    let current_tick = Arc::new(AtomicU64::new(10));
    let live = LiveState::new(
        Arc::new(BroadcastHub::new()),
        bus.clone(),
        store.clone(),
        Arc::clone(&current_tick),
    );
    let state = AppState {
        store: store.clone(),
        live,
        prices: Arc::new(arc_swap::ArcSwap::from_pointee(HashMap::new())),
        circuits: Arc::new(CircuitRegistry::new(Default::default())),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    TestServer {
        addr,
        bus,
        store,
        current_tick,
    }
}

async fn connect(server: &TestServer) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect("websocket connect");
    ws
}

async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("server sent valid json");
        }
    }
}

async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn live_agent(store: &SqliteStore) -> Agent {
    let mut agent = Agent::new("live", 0.0, 0.0);
    agent.ws_api_key = Some(format!("wss_{}_streamsecret", agent.id));
    store.insert_agent(&agent).unwrap();
    agent
}

#[tokio::test]
async fn connect_greets_and_answers_ping() {
    let server = start_server().await;
    let mut ws = connect(&server).await;

    let connected = recv_json(&mut ws).await;
    assert_eq!(connected["type"], "CONNECTED");
    assert_eq!(connected["authenticated"], false);
    assert!(connected["publicChannels"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c == "prices"));
    assert!(connected["timestamp"].is_string());

    send_json(&mut ws, serde_json::json!({"type": "PING"})).await;
    let pong = recv_json(&mut ws).await;
    assert_eq!(pong["type"], "PONG");
}

#[tokio::test]
async fn tick_update_reaches_fresh_session_without_subscribe() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    recv_json(&mut ws).await; // CONNECTED

    // Ping round-trip guarantees the session loop is live before publishing.
    send_json(&mut ws, serde_json::json!({"type": "PING"})).await;
    recv_json(&mut ws).await;

    server.bus.publish(BusMessage::new(
        "tick_updates",
        BroadcastKind::TickUpdate,
        serde_json::json!({"tick": 11, "marketOpen": true}),
    ));

    let update = recv_json(&mut ws).await;
    assert_eq!(update["type"], "TICK_UPDATE");
    assert_eq!(update["tick"], 11);
}

#[tokio::test]
async fn private_subscribe_requires_auth_and_partial_success_works() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    recv_json(&mut ws).await;

    send_json(
        &mut ws,
        serde_json::json!({"type": "SUBSCRIBE", "channels": ["prices", "portfolio"]}),
    )
    .await;
    let subscribed = recv_json(&mut ws).await;
    assert_eq!(subscribed["type"], "SUBSCRIBED");
    assert_eq!(subscribed["channels"], serde_json::json!(["prices"]));
    assert_eq!(subscribed["failed"][0]["channel"], "portfolio");
    assert_eq!(subscribed["failed"][0]["reason"], "Authentication required");
}

#[tokio::test]
async fn auth_flow_rejects_bad_keys_and_accepts_good_ones() {
    let server = start_server().await;
    let agent = live_agent(&server.store);
    let mut ws = connect(&server).await;
    recv_json(&mut ws).await;

    send_json(
        &mut ws,
        serde_json::json!({"type": "AUTH", "apiKey": "garbage"}),
    )
    .await;
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "AUTH_ERROR");
    assert_eq!(error["message"], "Invalid API key");

    send_json(
        &mut ws,
        serde_json::json!({"type": "AUTH", "apiKey": agent.ws_api_key.clone().unwrap()}),
    )
    .await;
    let success = recv_json(&mut ws).await;
    assert_eq!(success["type"], "AUTH_SUCCESS");
    assert_eq!(success["agentId"], agent.id.as_str());
    assert!(success["privateChannels"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c == &format!("agent:{}", agent.id)));

    // Private subscribe now succeeds.
    send_json(
        &mut ws,
        serde_json::json!({"type": "SUBSCRIBE", "channels": ["portfolio"]}),
    )
    .await;
    let subscribed = recv_json(&mut ws).await;
    assert_eq!(subscribed["channels"], serde_json::json!(["portfolio"]));
    assert!(subscribed.get("failed").is_none());
}

#[tokio::test]
async fn reconnect_after_full_disconnect_emits_agent_reconnected() {
    let server = start_server().await;
    let agent = live_agent(&server.store);
    let auth = serde_json::json!({"type": "AUTH", "apiKey": agent.ws_api_key.clone().unwrap()});

    let mut first = connect(&server).await;
    recv_json(&mut first).await;
    send_json(&mut first, auth.clone()).await;
    let success = recv_json(&mut first).await;
    assert_eq!(success["type"], "AUTH_SUCCESS");

    first.close(None).await.unwrap();
    // Give the server a moment to process the close and stamp the disconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.current_tick.store(15, Ordering::SeqCst);

    let mut second = connect(&server).await;
    recv_json(&mut second).await;
    send_json(&mut second, auth).await;
    let success = recv_json(&mut second).await;
    assert_eq!(success["type"], "AUTH_SUCCESS");
    let reconnected = recv_json(&mut second).await;
    assert_eq!(reconnected["type"], "AGENT_RECONNECTED");
    assert_eq!(reconnected["agentId"], agent.id.as_str());
    assert_eq!(reconnected["missedTicks"], 5);
    assert!(reconnected["disconnectDurationMs"].as_i64().unwrap() >= 0);
}

#[tokio::test]
async fn unsubscribed_topics_are_not_delivered() {
    let server = start_server().await;
    let mut ws = connect(&server).await;
    recv_json(&mut ws).await;

    send_json(&mut ws, serde_json::json!({"type": "PING"})).await;
    recv_json(&mut ws).await;

    // Not subscribed to trades; only the tick update should arrive.
    server.bus.publish(BusMessage::new(
        "trades",
        BroadcastKind::Trade,
        serde_json::json!({"symbol": "AAPL"}),
    ));
    server.bus.publish(BusMessage::new(
        "tick_updates",
        BroadcastKind::TickUpdate,
        serde_json::json!({"tick": 12}),
    ));

    let update = recv_json(&mut ws).await;
    assert_eq!(update["type"], "TICK_UPDATE");
    assert_eq!(update["tick"], 12);
}
