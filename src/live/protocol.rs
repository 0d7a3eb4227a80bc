//! Wire protocol for live sessions. Inbound and outbound messages are JSON
//! objects tagged by `type`; every outbound message carries a timestamp.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Messages a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "AUTH", rename_all = "camelCase")]
    Auth { api_key: String },
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { channels: Vec<String> },
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe { channels: Vec<String> },
}

/// Per-channel subscription rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeFailure {
    pub channel: String,
    pub reason: String,
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "CONNECTED", rename_all = "camelCase")]
    Connected {
        socket_id: String,
        authenticated: bool,
        public_channels: Vec<String>,
        message: String,
        timestamp: String,
    },
    #[serde(rename = "PONG")]
    Pong { timestamp: String },
    #[serde(rename = "AUTH_SUCCESS", rename_all = "camelCase")]
    AuthSuccess {
        agent_id: String,
        private_channels: Vec<String>,
        timestamp: String,
    },
    #[serde(rename = "AUTH_ERROR")]
    AuthError { message: String, timestamp: String },
    #[serde(rename = "SUBSCRIBED")]
    Subscribed {
        channels: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed: Option<Vec<SubscribeFailure>>,
        timestamp: String,
    },
    #[serde(rename = "UNSUBSCRIBED")]
    Unsubscribed {
        channels: Vec<String>,
        timestamp: String,
    },
    #[serde(rename = "TICK_UPDATE")]
    TickUpdate {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "PRICE_UPDATE")]
    PriceUpdate {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "MARKET_UPDATE")]
    MarketUpdate {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "TRADE")]
    Trade {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "NEWS")]
    News {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "LEADERBOARD")]
    Leaderboard {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "EVENT")]
    Event {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "AGENT_UPDATE")]
    AgentUpdate {
        #[serde(flatten)]
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "AGENT_SESSION_DISCONNECTED", rename_all = "camelCase")]
    AgentSessionDisconnected {
        socket_id: String,
        reason: String,
        remaining_sessions: usize,
        timestamp: String,
    },
    #[serde(rename = "AGENT_RECONNECTED", rename_all = "camelCase")]
    AgentReconnected {
        agent_id: String,
        previous_disconnect_time: String,
        disconnect_duration_ms: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        missed_ticks: Option<u64>,
        timestamp: String,
    },
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_messages_parse_by_type_tag() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let auth: ClientMessage =
            serde_json::from_str(r#"{"type":"AUTH","apiKey":"wss_a1_xyz"}"#).unwrap();
        match auth {
            ClientMessage::Auth { api_key } => assert_eq!(api_key, "wss_a1_xyz"),
            other => panic!("unexpected {other:?}"),
        }

        let sub: ClientMessage =
            serde_json::from_str(r#"{"type":"SUBSCRIBE","channels":["prices","news"]}"#).unwrap();
        match sub {
            ClientMessage::Subscribe { channels } => assert_eq!(channels.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn outbound_tick_update_flattens_payload() {
        let msg = ServerMessage::TickUpdate {
            data: serde_json::json!({"tick": 9, "marketOpen": true}),
            timestamp: now_timestamp(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "TICK_UPDATE");
        assert_eq!(json["tick"], 9);
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn subscribed_omits_failed_when_clean() {
        let msg = ServerMessage::Subscribed {
            channels: vec!["prices".into()],
            failed: None,
            timestamp: now_timestamp(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("failed").is_none());
    }
}
