//! One task per live socket: inbound protocol handling and filtered relay of
//! bus publications.

use crate::live::bus::{BroadcastKind, BusMessage, PubSub};
use crate::live::hub::{BroadcastHub, PRIVATE_CHANNELS, PUBLIC_CHANNELS};
use crate::live::protocol::{now_timestamp, ClientMessage, ServerMessage, SubscribeFailure};
use crate::store::SqliteStore;
use axum::extract::ws::{Message, WebSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything a session task needs, shared across the server.
#[derive(Clone)]
pub struct LiveState {
    pub hub: Arc<BroadcastHub>,
    pub bus: Arc<dyn PubSub>,
    pub store: SqliteStore,
    pub current_tick: Arc<AtomicU64>,
}

impl LiveState {
    pub fn new(
        hub: Arc<BroadcastHub>,
        bus: Arc<dyn PubSub>,
        store: SqliteStore,
        current_tick: Arc<AtomicU64>,
    ) -> Self {
        Self {
            hub,
            bus,
            store,
            current_tick,
        }
    }
}

/// Parse `wss_<agentId>_<secret>` into the claimed agent id.
fn agent_id_from_key(api_key: &str) -> Option<&str> {
    let rest = api_key.strip_prefix("wss_")?;
    let (agent_id, secret) = rest.split_once('_')?;
    if agent_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some(agent_id)
}

/// Apply one inbound message and produce the replies for this socket.
pub fn handle_client_message(
    state: &LiveState,
    socket_id: &str,
    text: &str,
) -> Vec<ServerMessage> {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(socket = socket_id, error = %e, "unparseable client message");
            return Vec::new();
        }
    };

    match parsed {
        ClientMessage::Ping => vec![ServerMessage::Pong {
            timestamp: now_timestamp(),
        }],
        ClientMessage::Auth { api_key } => handle_auth(state, socket_id, &api_key),
        ClientMessage::Subscribe { channels } => {
            let (ok, failed) = state.hub.subscribe(socket_id, &channels);
            let failed = if failed.is_empty() {
                None
            } else {
                Some(
                    failed
                        .into_iter()
                        .map(|(channel, reason)| SubscribeFailure { channel, reason })
                        .collect(),
                )
            };
            vec![ServerMessage::Subscribed {
                channels: ok,
                failed,
                timestamp: now_timestamp(),
            }]
        }
        ClientMessage::Unsubscribe { channels } => {
            let channels = state.hub.unsubscribe(socket_id, &channels);
            vec![ServerMessage::Unsubscribed {
                channels,
                timestamp: now_timestamp(),
            }]
        }
    }
}

fn handle_auth(state: &LiveState, socket_id: &str, api_key: &str) -> Vec<ServerMessage> {
    let invalid = || {
        vec![ServerMessage::AuthError {
            message: "Invalid API key".to_string(),
            timestamp: now_timestamp(),
        }]
    };

    let Some(agent_id) = agent_id_from_key(api_key) else {
        return invalid();
    };
    let agent = match state.store.get_agent(agent_id) {
        Ok(Some(agent)) => agent,
        Ok(None) => return invalid(),
        Err(e) => {
            warn!(socket = socket_id, error = %e, "auth lookup failed");
            return invalid();
        }
    };
    if agent.ws_api_key.as_deref() != Some(api_key) {
        return invalid();
    }

    let tick = state.current_tick.load(Ordering::SeqCst);
    let notice = state.hub.authenticate(socket_id, &agent.id, tick);

    let mut private_channels: Vec<String> =
        PRIVATE_CHANNELS.iter().map(|c| c.to_string()).collect();
    private_channels.push(format!("agent:{}", agent.id));

    let mut replies = vec![ServerMessage::AuthSuccess {
        agent_id: agent.id.clone(),
        private_channels,
        timestamp: now_timestamp(),
    }];

    if let Some(notice) = notice {
        replies.push(ServerMessage::AgentReconnected {
            agent_id: notice.agent_id,
            previous_disconnect_time: notice.previous_disconnect_time.to_rfc3339(),
            disconnect_duration_ms: notice.disconnect_duration_ms,
            missed_ticks: notice.missed_ticks,
            timestamp: now_timestamp(),
        });
    }
    replies
}

/// Run one socket to completion.
pub async fn handle_socket(mut socket: WebSocket, state: LiveState) {
    let socket_id = Uuid::new_v4().to_string();
    state.hub.register(&socket_id);

    let connected = ServerMessage::Connected {
        socket_id: socket_id.clone(),
        authenticated: false,
        public_channels: PUBLIC_CHANNELS.iter().map(|c| c.to_string()).collect(),
        message: "Connected to market stream".to_string(),
        timestamp: now_timestamp(),
    };
    if send(&mut socket, &connected).await.is_err() {
        state.hub.remove(&socket_id, state.current_tick.load(Ordering::SeqCst));
        return;
    }

    let mut rx = state.bus.subscribe();
    loop {
        tokio::select! {
            published = rx.recv() => {
                match published {
                    Ok(msg) => {
                        if state.hub.should_deliver(&socket_id, &msg)
                            && send(&mut socket, &msg.to_server_message()).await.is_err()
                        {
                            break;
                        }
                    }
                    // Lagged receivers resubscribe at the stream head; the
                    // client recovers state from the next tick update.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(socket = %socket_id, skipped, "session lagged behind broadcast");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        for reply in handle_client_message(&state, &socket_id, &text) {
                            if send(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(socket = %socket_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    let tick = state.current_tick.load(Ordering::SeqCst);
    let closed = state.hub.remove(&socket_id, tick);
    if let Some(agent_id) = closed.agent_id {
        if closed.remaining_sessions > 0 {
            state.bus.publish(BusMessage::new(
                format!("agent:{agent_id}"),
                BroadcastKind::SessionDisconnected,
                serde_json::json!({
                    "socketId": socket_id,
                    "reason": "disconnect",
                    "remainingSessions": closed.remaining_sessions,
                }),
            ));
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::bus::InProcessBus;
    use crate::models::Agent;

    fn state_with_agent() -> (LiveState, Agent) {
        let store = SqliteStore::open(":memory:").unwrap();
        let mut agent = Agent::new("live", 0.0, 0.0);
        agent.ws_api_key = Some(format!("wss_{}_topsecret", agent.id));
        store.insert_agent(&agent).unwrap();

        let state = LiveState::new(
            Arc::new(BroadcastHub::new()),
            Arc::new(InProcessBus::new(16)),
            store,
            Arc::new(AtomicU64::new(40)),
        );
        (state, agent)
    }

    #[test]
    fn ping_pongs_with_timestamp() {
        let (state, _) = state_with_agent();
        state.hub.register("s1");
        let replies = handle_client_message(&state, "s1", r#"{"type":"PING"}"#);
        assert!(matches!(replies[0], ServerMessage::Pong { .. }));
    }

    #[test]
    fn malformed_api_key_yields_auth_error() {
        let (state, _) = state_with_agent();
        state.hub.register("s1");
        for key in ["", "wss_", "wss_onlyid", "nonsense"] {
            let text = serde_json::json!({"type": "AUTH", "apiKey": key}).to_string();
            let replies = handle_client_message(&state, "s1", &text);
            match &replies[0] {
                ServerMessage::AuthError { message, .. } => {
                    assert_eq!(message, "Invalid API key")
                }
                other => panic!("expected AUTH_ERROR, got {other:?}"),
            }
        }
        assert!(state.hub.agent_of("s1").is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (state, agent) = state_with_agent();
        state.hub.register("s1");
        let text = serde_json::json!({
            "type": "AUTH",
            "apiKey": format!("wss_{}_wrong", agent.id)
        })
        .to_string();
        let replies = handle_client_message(&state, "s1", &text);
        assert!(matches!(replies[0], ServerMessage::AuthError { .. }));
    }

    #[test]
    fn valid_key_authenticates_and_lists_private_channels() {
        let (state, agent) = state_with_agent();
        state.hub.register("s1");
        let text = serde_json::json!({
            "type": "AUTH",
            "apiKey": agent.ws_api_key.clone().unwrap()
        })
        .to_string();
        let replies = handle_client_message(&state, "s1", &text);
        match &replies[0] {
            ServerMessage::AuthSuccess {
                agent_id,
                private_channels,
                ..
            } => {
                assert_eq!(agent_id, &agent.id);
                assert!(private_channels.contains(&"portfolio".to_string()));
                assert!(private_channels.contains(&format!("agent:{}", agent.id)));
            }
            other => panic!("expected AUTH_SUCCESS, got {other:?}"),
        }
        assert_eq!(state.hub.agent_of("s1").as_deref(), Some(agent.id.as_str()));
    }

    #[test]
    fn reconnect_emits_agent_reconnected_once() {
        let (state, agent) = state_with_agent();
        let auth = serde_json::json!({
            "type": "AUTH",
            "apiKey": agent.ws_api_key.clone().unwrap()
        })
        .to_string();

        state.hub.register("s1");
        handle_client_message(&state, "s1", &auth);
        state.hub.remove("s1", 30);

        state.current_tick.store(42, Ordering::SeqCst);
        state.hub.register("s2");
        let replies = handle_client_message(&state, "s2", &auth);
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            ServerMessage::AgentReconnected {
                agent_id,
                missed_ticks,
                disconnect_duration_ms,
                ..
            } => {
                assert_eq!(agent_id, &agent.id);
                assert_eq!(*missed_ticks, Some(12));
                assert!(*disconnect_duration_ms >= 0);
            }
            other => panic!("expected AGENT_RECONNECTED, got {other:?}"),
        }

        // A further session sees no stale notice.
        state.hub.register("s3");
        let replies = handle_client_message(&state, "s3", &auth);
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn subscribe_reports_partial_success() {
        let (state, _) = state_with_agent();
        state.hub.register("s1");
        let text = serde_json::json!({
            "type": "SUBSCRIBE",
            "channels": ["prices", "portfolio"]
        })
        .to_string();
        let replies = handle_client_message(&state, "s1", &text);
        match &replies[0] {
            ServerMessage::Subscribed {
                channels, failed, ..
            } => {
                assert_eq!(channels, &vec!["prices".to_string()]);
                let failed = failed.as_ref().unwrap();
                assert_eq!(failed[0].channel, "portfolio");
                assert_eq!(failed[0].reason, "Authentication required");
            }
            other => panic!("expected SUBSCRIBED, got {other:?}"),
        }
    }

    #[test]
    fn garbage_input_is_ignored() {
        let (state, _) = state_with_agent();
        state.hub.register("s1");
        assert!(handle_client_message(&state, "s1", "not json").is_empty());
        assert!(handle_client_message(&state, "s1", r#"{"type":"NOPE"}"#).is_empty());
    }
}
