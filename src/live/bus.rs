//! Engine-to-broadcast pub/sub.
//!
//! The engine publishes topic messages; each live session holds a receiver
//! and filters by its subscriptions. The trait seam lets a shared adapter
//! fan a single engine publication across multiple broadcast nodes without
//! changing client-visible semantics.

use crate::live::protocol::{now_timestamp, ServerMessage};
use serde::Serialize;
use tokio::sync::broadcast;

/// What kind of client message a bus publication turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BroadcastKind {
    TickUpdate,
    PriceUpdate,
    MarketUpdate,
    Trade,
    News,
    Leaderboard,
    Event,
    AgentUpdate,
    SessionDisconnected,
}

/// One published message on a named topic.
#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub topic: String,
    pub kind: BroadcastKind,
    pub payload: serde_json::Value,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, kind: BroadcastKind, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            kind,
            payload,
        }
    }

    /// Wrap the payload in the outbound message shape for this kind.
    pub fn to_server_message(&self) -> ServerMessage {
        let timestamp = now_timestamp();
        let data = self.payload.clone();
        match self.kind {
            BroadcastKind::TickUpdate => ServerMessage::TickUpdate { data, timestamp },
            BroadcastKind::PriceUpdate => ServerMessage::PriceUpdate { data, timestamp },
            BroadcastKind::MarketUpdate => ServerMessage::MarketUpdate { data, timestamp },
            BroadcastKind::Trade => ServerMessage::Trade { data, timestamp },
            BroadcastKind::News => ServerMessage::News { data, timestamp },
            BroadcastKind::Leaderboard => ServerMessage::Leaderboard { data, timestamp },
            BroadcastKind::Event => ServerMessage::Event { data, timestamp },
            BroadcastKind::AgentUpdate => ServerMessage::AgentUpdate { data, timestamp },
            BroadcastKind::SessionDisconnected => ServerMessage::AgentSessionDisconnected {
                socket_id: data
                    .get("socketId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                reason: data
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("disconnect")
                    .to_string(),
                remaining_sessions: data
                    .get("remainingSessions")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize,
                timestamp,
            },
        }
    }
}

/// Abstract bus between the engine and broadcast sessions.
pub trait PubSub: Send + Sync {
    fn publish(&self, msg: BusMessage);
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// Single-process bus over a tokio broadcast channel.
pub struct InProcessBus {
    tx: broadcast::Sender<BusMessage>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PubSub for InProcessBus {
    fn publish(&self, msg: BusMessage) {
        // No subscribers is fine; the engine never blocks on delivery.
        let _ = self.tx.send(msg);
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = InProcessBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(BusMessage::new(
            "tick_updates",
            BroadcastKind::TickUpdate,
            serde_json::json!({"tick": 1}),
        ));

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a.topic, "tick_updates");
        assert_eq!(got_b.payload["tick"], 1);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = InProcessBus::new(16);
        bus.publish(BusMessage::new(
            "prices",
            BroadcastKind::PriceUpdate,
            serde_json::json!({}),
        ));
    }

    #[test]
    fn bus_message_wraps_into_typed_server_message() {
        let msg = BusMessage::new(
            "trades",
            BroadcastKind::Trade,
            serde_json::json!({"symbol": "AAPL"}),
        );
        let json = serde_json::to_value(msg.to_server_message()).unwrap();
        assert_eq!(json["type"], "TRADE");
        assert_eq!(json["symbol"], "AAPL");
    }
}
