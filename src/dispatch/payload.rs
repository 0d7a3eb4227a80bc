//! Per-participant webhook payload assembly.
//!
//! The engine builds one immutable TickSnapshot per tick; the builder resolves
//! it into a per-participant payload (portfolio, open orders, filtered trades,
//! news, messages, investigations, prior action results).

use crate::models::{
    ActionResult, Agent, DirectMessage, Investigation, MarketEvent, MarketIndex, NewsItem, Order,
    StockQuote, Trade, WorldState,
};
use crate::store::SqliteStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// How many of the participant's own trades ride along per payload.
const RECENT_TRADES_LIMIT: usize = 50;

/// Tick-wide data shared by every recipient's payload.
#[derive(Debug, Clone)]
pub struct TickSnapshot {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub world: WorldState,
    pub quotes: Vec<StockQuote>,
    pub indices: Vec<MarketIndex>,
    /// Latest price per symbol for marking positions.
    pub prices: HashMap<String, f64>,
    pub trades: Vec<Trade>,
    pub news: Vec<NewsItem>,
    pub events: Vec<MarketEvent>,
    /// Results of the previous tick's ingested actions, per participant.
    pub action_results: HashMap<String, Vec<ActionResult>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEntry {
    pub symbol: String,
    pub shares: i64,
    pub average_cost: f64,
    pub current_price: f64,
    pub market_value: f64,
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: f64,
    #[serde(rename = "unrealizedPnLPercent")]
    pub unrealized_pnl_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSection {
    pub agent_id: String,
    pub cash: f64,
    pub margin_used: f64,
    pub margin_available: f64,
    pub net_worth: f64,
    pub positions: Vec<PositionEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSection {
    pub indices: Vec<MarketIndex>,
    pub watchlist: Vec<StockQuote>,
    pub recent_trades: Vec<Trade>,
}

/// The webhook body delivered to one participant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickPayload {
    pub tick: u64,
    pub timestamp: String,
    pub portfolio: PortfolioSection,
    pub orders: Vec<Order>,
    pub market: MarketSection,
    pub world: WorldState,
    pub news: Vec<NewsItem>,
    pub messages: Vec<DirectMessage>,
    pub alerts: Vec<serde_json::Value>,
    pub investigations: Vec<Investigation>,
    pub action_results: Vec<ActionResult>,
}

pub struct PayloadBuilder {
    store: SqliteStore,
}

impl PayloadBuilder {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn build(&self, agent: &Agent, snapshot: &TickSnapshot) -> Result<TickPayload> {
        let holdings = self.store.holdings_for_agent(&agent.id)?;
        let mut positions = Vec::with_capacity(holdings.len());
        let mut position_value = 0.0;
        for h in holdings {
            let current_price = snapshot.prices.get(&h.symbol).copied().unwrap_or(0.0);
            let market_value = current_price * h.quantity as f64;
            let cost_basis = h.average_cost * h.quantity as f64;
            let unrealized = market_value - cost_basis;
            position_value += market_value;
            positions.push(PositionEntry {
                symbol: h.symbol,
                shares: h.quantity,
                average_cost: h.average_cost,
                current_price,
                market_value,
                unrealized_pnl: unrealized,
                unrealized_pnl_percent: if cost_basis.abs() > f64::EPSILON {
                    unrealized / cost_basis.abs() * 100.0
                } else {
                    0.0
                },
            });
        }

        let portfolio = PortfolioSection {
            agent_id: agent.id.clone(),
            cash: agent.cash,
            margin_used: agent.margin_used,
            margin_available: agent.margin_available(),
            net_worth: agent.cash + position_value,
            positions,
        };

        let market = MarketSection {
            indices: snapshot.indices.clone(),
            watchlist: snapshot.quotes.clone(),
            recent_trades: self
                .store
                .recent_trades_for_agent(&agent.id, RECENT_TRADES_LIMIT)?,
        };

        Ok(TickPayload {
            tick: snapshot.tick,
            timestamp: snapshot.timestamp.to_rfc3339(),
            portfolio,
            orders: self.store.non_terminal_orders_for_agent(&agent.id)?,
            market,
            world: snapshot.world.clone(),
            news: snapshot.news.clone(),
            messages: self.store.messages_for_agent_since(&agent.id, snapshot.tick)?,
            alerts: Vec::new(),
            investigations: self.store.open_investigations_for_agent(&agent.id)?,
            action_results: snapshot
                .action_results
                .get(&agent.id)
                .cloned()
                .unwrap_or_default(),
        })
    }
}
