//! HTTP/WebSocket server surface: health, observability reads, and the live
//! stream upgrade.

use crate::dispatch::CircuitRegistry;
use crate::live::{handle_socket, LiveState};
use crate::store::SqliteStore;
use arc_swap::ArcSwap;
use axum::{
    extract::ws::WebSocketUpgrade,
    extract::State,
    response::{Json, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Application state shared across handlers and session tasks.
#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub live: LiveState,
    pub prices: Arc<ArcSwap<HashMap<String, f64>>>,
    pub circuits: Arc<CircuitRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/prices", get(prices))
        .route("/circuits", get(circuits))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "tick": state.live.current_tick.load(Ordering::SeqCst),
        "sessions": state.live.hub.session_count(),
    }))
}

/// Latest per-symbol prices from the lock-free cache.
async fn prices(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.prices.load();
    Json(serde_json::json!({ "prices": &**snapshot }))
}

/// Circuit breaker snapshot for operators.
async fn circuits(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "open": state.circuits.open_ids(),
        "breakers": state.circuits.stats(),
    }))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let live = state.live.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, live))
}
