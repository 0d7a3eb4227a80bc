//! Broadcast hub state: sessions, channel memberships, participant session
//! counts, and disconnect bookkeeping for reconnect detection.

use crate::live::bus::{BroadcastKind, BusMessage};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Channels every new session joins automatically.
pub const AUTO_JOIN_CHANNELS: &[&str] = &["tick", "tick_updates"];

/// Public channels offered in the CONNECTED greeting.
pub const PUBLIC_CHANNELS: &[&str] = &[
    "tick",
    "tick_updates",
    "prices",
    "market:all",
    "news",
    "leaderboard",
    "trades",
    "events",
];

/// Private channels unlocked by authentication.
pub const PRIVATE_CHANNELS: &[&str] = &[
    "portfolio",
    "orders",
    "messages",
    "alerts",
    "investigations",
];

fn is_public_channel(name: &str) -> bool {
    PUBLIC_CHANNELS.contains(&name)
        || name.starts_with("market:")
        || name.starts_with("symbol:")
}

fn is_private_channel(name: &str) -> bool {
    PRIVATE_CHANNELS.contains(&name) || name.starts_with("agent:")
}

#[derive(Debug, Clone)]
struct SessionInfo {
    agent_id: Option<String>,
    channels: HashSet<String>,
}

#[derive(Debug, Clone)]
struct DisconnectInfo {
    disconnect_time: DateTime<Utc>,
    tick_at_disconnect: u64,
}

/// Emitted to a freshly authenticated session when the participant had fully
/// disconnected earlier.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectNotice {
    pub agent_id: String,
    pub previous_disconnect_time: DateTime<Utc>,
    pub disconnect_duration_ms: i64,
    /// Only present when positive.
    pub missed_ticks: Option<u64>,
}

/// Result of removing a session.
#[derive(Debug, Clone, Default)]
pub struct SessionClosed {
    pub agent_id: Option<String>,
    /// Sessions the participant still has open.
    pub remaining_sessions: usize,
}

#[derive(Default)]
pub struct BroadcastHub {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    agent_sessions: RwLock<HashMap<String, HashSet<String>>>,
    disconnects: RwLock<HashMap<String, DisconnectInfo>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Register a new session with the auto-joined public channels.
    pub fn register(&self, socket_id: &str) {
        let channels = AUTO_JOIN_CHANNELS
            .iter()
            .map(|c| c.to_string())
            .collect::<HashSet<_>>();
        self.sessions.write().insert(
            socket_id.to_string(),
            SessionInfo {
                agent_id: None,
                channels,
            },
        );
    }

    /// Bind an authenticated participant to the session. Returns the
    /// reconnect notice when this ends a full disconnect, at most once.
    pub fn authenticate(
        &self,
        socket_id: &str,
        agent_id: &str,
        current_tick: u64,
    ) -> Option<ReconnectNotice> {
        {
            let mut sessions = self.sessions.write();
            let session = sessions.get_mut(socket_id)?;
            session.agent_id = Some(agent_id.to_string());
        }
        self.agent_sessions
            .write()
            .entry(agent_id.to_string())
            .or_default()
            .insert(socket_id.to_string());

        let info = self.disconnects.write().remove(agent_id)?;
        let now = Utc::now();
        let duration_ms = (now - info.disconnect_time).num_milliseconds().max(0);
        let missed = current_tick.saturating_sub(info.tick_at_disconnect);
        Some(ReconnectNotice {
            agent_id: agent_id.to_string(),
            previous_disconnect_time: info.disconnect_time,
            disconnect_duration_ms: duration_ms,
            missed_ticks: (missed > 0).then_some(missed),
        })
    }

    /// Apply subscription rules; returns accepted channels and per-channel
    /// failures. Partial success is normal.
    pub fn subscribe(
        &self,
        socket_id: &str,
        channels: &[String],
    ) -> (Vec<String>, Vec<(String, String)>) {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(socket_id) else {
            return (
                ok,
                channels
                    .iter()
                    .map(|c| (c.clone(), "Unknown session".to_string()))
                    .collect(),
            );
        };

        for channel in channels {
            if is_public_channel(channel) {
                session.channels.insert(channel.clone());
                ok.push(channel.clone());
                continue;
            }
            if !is_private_channel(channel) {
                failed.push((channel.clone(), "Unknown channel".to_string()));
                continue;
            }
            let Some(agent_id) = session.agent_id.as_deref() else {
                failed.push((channel.clone(), "Authentication required".to_string()));
                continue;
            };
            if let Some(owner) = channel.strip_prefix("agent:") {
                if owner != agent_id {
                    failed.push((
                        channel.clone(),
                        "Can only subscribe to own agent channel".to_string(),
                    ));
                    continue;
                }
            }
            session.channels.insert(channel.clone());
            ok.push(channel.clone());
        }
        (ok, failed)
    }

    /// Drop channel memberships. Unknown channels are ignored; the returned
    /// list echoes what was requested and is idempotent.
    pub fn unsubscribe(&self, socket_id: &str, channels: &[String]) -> Vec<String> {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(socket_id) {
            for channel in channels {
                session.channels.remove(channel);
            }
        }
        channels.to_vec()
    }

    pub fn channels_of(&self, socket_id: &str) -> HashSet<String> {
        self.sessions
            .read()
            .get(socket_id)
            .map(|s| s.channels.clone())
            .unwrap_or_default()
    }

    pub fn agent_of(&self, socket_id: &str) -> Option<String> {
        self.sessions.read().get(socket_id)?.agent_id.clone()
    }

    /// Remove the session; stamps disconnect info when it was the
    /// participant's last one.
    pub fn remove(&self, socket_id: &str, current_tick: u64) -> SessionClosed {
        let removed = self.sessions.write().remove(socket_id);
        let Some(session) = removed else {
            return SessionClosed::default();
        };
        let Some(agent_id) = session.agent_id else {
            return SessionClosed::default();
        };

        let remaining = {
            let mut agents = self.agent_sessions.write();
            let remaining = if let Some(set) = agents.get_mut(&agent_id) {
                set.remove(socket_id);
                set.len()
            } else {
                0
            };
            if remaining == 0 {
                agents.remove(&agent_id);
            }
            remaining
        };

        if remaining == 0 {
            self.disconnects.write().insert(
                agent_id.clone(),
                DisconnectInfo {
                    disconnect_time: Utc::now(),
                    tick_at_disconnect: current_tick,
                },
            );
        }

        SessionClosed {
            agent_id: Some(agent_id),
            remaining_sessions: remaining,
        }
    }

    /// Delivery check for one published message against one session.
    pub fn should_deliver(&self, socket_id: &str, msg: &BusMessage) -> bool {
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(socket_id) else {
            return false;
        };

        if let Some(owner) = msg.topic.strip_prefix("agent:") {
            // Agent-scoped messages only ever reach that participant.
            if session.agent_id.as_deref() != Some(owner) {
                return false;
            }
            // Session-control notices reach every session of the participant.
            if msg.kind == BroadcastKind::SessionDisconnected {
                return true;
            }
            if session.channels.contains(&msg.topic) {
                return true;
            }
            // Private shortcut channels map to agent-scoped kinds.
            return match msg.kind {
                BroadcastKind::AgentUpdate => {
                    session.channels.iter().any(|c| {
                        PRIVATE_CHANNELS.contains(&c.as_str())
                    })
                }
                _ => false,
            };
        }

        if session.channels.contains(&msg.topic) {
            return true;
        }

        // Legacy aliases and the market umbrella channel.
        match msg.topic.as_str() {
            "tick_updates" => session.channels.contains("tick"),
            "tick" => session.channels.contains("tick_updates"),
            topic => {
                if let Some(symbol) = topic.strip_prefix("market:") {
                    session.channels.contains(&format!("symbol:{symbol}"))
                        || session.channels.contains("market:all")
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, kind: BroadcastKind) -> BusMessage {
        BusMessage::new(topic, kind, serde_json::json!({}))
    }

    #[test]
    fn new_sessions_auto_join_tick_channels() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        let channels = hub.channels_of("s1");
        assert!(channels.contains("tick"));
        assert!(channels.contains("tick_updates"));
        assert!(hub.should_deliver("s1", &msg("tick_updates", BroadcastKind::TickUpdate)));
    }

    #[test]
    fn unauthenticated_private_subscribe_fails_per_channel() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        let (ok, failed) = hub.subscribe(
            "s1",
            &["prices".to_string(), "portfolio".to_string()],
        );
        assert_eq!(ok, vec!["prices".to_string()]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "portfolio");
        assert_eq!(failed[0].1, "Authentication required");
    }

    #[test]
    fn agent_channel_restricted_to_owner() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        hub.authenticate("s1", "a1", 10);

        let (ok, failed) = hub.subscribe(
            "s1",
            &["agent:a1".to_string(), "agent:a2".to_string()],
        );
        assert_eq!(ok, vec!["agent:a1".to_string()]);
        assert_eq!(failed[0].1, "Can only subscribe to own agent channel");
    }

    #[test]
    fn unknown_channel_fails() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        let (ok, failed) = hub.subscribe("s1", &["mystery".to_string()]);
        assert!(ok.is_empty());
        assert_eq!(failed[0].1, "Unknown channel");
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_channel_set() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        let before = hub.channels_of("s1");
        hub.subscribe("s1", &["prices".to_string()]);
        hub.unsubscribe("s1", &["prices".to_string()]);
        assert_eq!(hub.channels_of("s1"), before);
        // Unsubscribing again is harmless.
        hub.unsubscribe("s1", &["prices".to_string()]);
        assert_eq!(hub.channels_of("s1"), before);
    }

    #[test]
    fn private_messages_never_reach_other_agents() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        hub.register("s2");
        hub.authenticate("s1", "a1", 0);
        hub.authenticate("s2", "a2", 0);
        hub.subscribe("s1", &["agent:a1".to_string()]);
        hub.subscribe("s2", &["agent:a2".to_string()]);

        let m = msg("agent:a1", BroadcastKind::AgentUpdate);
        assert!(hub.should_deliver("s1", &m));
        assert!(!hub.should_deliver("s2", &m));
    }

    #[test]
    fn private_shortcut_channels_receive_agent_updates() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        hub.authenticate("s1", "a1", 0);
        hub.subscribe("s1", &["portfolio".to_string()]);
        assert!(hub.should_deliver("s1", &msg("agent:a1", BroadcastKind::AgentUpdate)));
    }

    #[test]
    fn market_symbol_topics_honor_aliases_and_umbrella() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        hub.subscribe("s1", &["symbol:AAPL".to_string()]);
        assert!(hub.should_deliver("s1", &msg("market:AAPL", BroadcastKind::MarketUpdate)));

        hub.register("s2");
        hub.subscribe("s2", &["market:all".to_string()]);
        assert!(hub.should_deliver("s2", &msg("market:TSLA", BroadcastKind::MarketUpdate)));
        assert!(!hub.should_deliver("s2", &msg("agent:a1", BroadcastKind::AgentUpdate)));
    }

    #[test]
    fn reconnect_notice_only_after_last_session_closes() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        hub.register("s2");
        hub.authenticate("s1", "a1", 5);
        hub.authenticate("s2", "a1", 5);

        // Closing one of two sessions: no disconnect stamp.
        let closed = hub.remove("s1", 7);
        assert_eq!(closed.remaining_sessions, 1);
        hub.register("s3");
        assert!(hub.authenticate("s3", "a1", 8).is_none());

        // Close everything: the next auth gets exactly one notice.
        hub.remove("s2", 9);
        hub.remove("s3", 9);
        hub.register("s4");
        let notice = hub.authenticate("s4", "a1", 12).expect("reconnect notice");
        assert_eq!(notice.agent_id, "a1");
        assert_eq!(notice.missed_ticks, Some(3));
        assert!(notice.disconnect_duration_ms >= 0);

        // Repeating auth does not produce a second notice.
        hub.register("s5");
        assert!(hub.authenticate("s5", "a1", 13).is_none());
    }

    #[test]
    fn missed_ticks_omitted_when_not_positive() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        hub.authenticate("s1", "a1", 5);
        hub.remove("s1", 5);
        hub.register("s2");
        let notice = hub.authenticate("s2", "a1", 5).unwrap();
        assert_eq!(notice.missed_ticks, None);
    }

    #[test]
    fn remove_cleans_all_memberships() {
        let hub = BroadcastHub::new();
        hub.register("s1");
        hub.subscribe("s1", &["prices".to_string()]);
        let closed = hub.remove("s1", 1);
        assert!(closed.agent_id.is_none());
        assert!(hub.channels_of("s1").is_empty());
        assert!(!hub.should_deliver("s1", &msg("prices", BroadcastKind::PriceUpdate)));
        assert_eq!(hub.session_count(), 0);
    }
}
