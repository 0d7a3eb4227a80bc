//! Multi-symbol matching pass over per-symbol books.
//!
//! The tick engine hands each symbol's matchable orders (pending orders plus
//! unfinished market remainders) to `run_symbol` in FIFO submission order and
//! persists the returned trades and order snapshots as one batch.

use crate::matching::book::{OrderBook, RestingUpdate};
use crate::models::{Order, OrderStatus, OrderType, Side, Trade};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Validation and policy knobs applied before an order reaches a book.
#[derive(Debug, Clone)]
pub struct MatchingPolicy {
    pub allow_self_trading: bool,
    pub max_quantity: i64,
    pub max_price: f64,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            allow_self_trading: true,
            max_quantity: 1_000_000,
            max_price: 1_000_000.0,
        }
    }
}

/// Delta emitted for every resting order touched by a match cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedRestingOrder {
    pub order_id: String,
    pub filled_this_cycle: i64,
    pub cumulative_filled_quantity: i64,
    pub cumulative_avg_fill_price: f64,
}

impl AffectedRestingOrder {
    fn from_update(update: &RestingUpdate) -> Self {
        Self {
            order_id: update.order.id.clone(),
            filled_this_cycle: update.filled_this_cycle,
            cumulative_filled_quantity: update.order.filled_quantity,
            cumulative_avg_fill_price: update.order.avg_fill_price.unwrap_or(0.0),
        }
    }
}

/// Everything one symbol's matching pass produced.
#[derive(Debug, Default)]
pub struct SymbolPassResult {
    pub trades: Vec<Trade>,
    /// Final snapshot per touched order (incoming and resting), deduplicated.
    pub order_updates: Vec<Order>,
    pub affected: Vec<AffectedRestingOrder>,
    /// Last trade price of the pass, if any trade printed.
    pub last_trade_price: Option<f64>,
    /// Signed aggressor volume: incoming buys add, incoming sells subtract.
    pub net_aggressor_volume: i64,
    /// Total quantity traded in the pass.
    pub traded_volume: i64,
}

/// Orchestrates per-symbol books. Books are created on demand and persist
/// resting liquidity across ticks; the store is the recovery source.
pub struct MatchingEngine {
    policy: MatchingPolicy,
    books: HashMap<String, OrderBook>,
}

impl MatchingEngine {
    pub fn new(policy: MatchingPolicy) -> Self {
        Self {
            policy,
            books: HashMap::new(),
        }
    }

    pub fn book(&self, symbol: &str) -> Option<&OrderBook> {
        self.books.get(symbol)
    }

    fn book_mut(&mut self, symbol: &str) -> &mut OrderBook {
        let allow_self_trading = self.policy.allow_self_trading;
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| OrderBook::new(symbol, allow_self_trading))
    }

    /// Rebuild one symbol's ladder from open/partial limit orders loaded from
    /// the store (startup recovery).
    pub fn restore_resting(&mut self, symbol: &str, orders: Vec<Order>) {
        let book = self.book_mut(symbol);
        for order in orders {
            if order.order_type == OrderType::Limit && order.status.can_cancel() {
                book.restore(order);
            }
        }
    }

    /// Run one symbol's matching pass. `last_price` is the previous tick's
    /// price, used for stop triggers; it advances with each trade printed
    /// inside the pass.
    pub fn run_symbol(
        &mut self,
        symbol: &str,
        matchable: Vec<Order>,
        last_price: f64,
        tick: u64,
    ) -> SymbolPassResult {
        let mut result = SymbolPassResult::default();
        let mut updates: HashMap<String, Order> = HashMap::new();
        let mut update_order: Vec<String> = Vec::new();
        let mut mark = last_price;

        for mut order in matchable {
            if let Some(reason) = self.validate(&order) {
                debug!(symbol, order = %order.id, reason, "order rejected");
                order.status = OrderStatus::Rejected;
                record_update(&mut updates, &mut update_order, order);
                continue;
            }

            if order.order_type == OrderType::Stop && !stop_triggered(&order, mark) {
                // Untriggered stops stay pending in the store; nothing to do.
                continue;
            }

            let side = order.side;
            let outcome = self.book_mut(symbol).submit(order, tick);

            for trade in &outcome.trades {
                result.net_aggressor_volume += side.sign() * trade.quantity;
                result.traded_volume += trade.quantity;
            }
            for update in &outcome.resting_updates {
                result.affected.push(AffectedRestingOrder::from_update(update));
                record_update(&mut updates, &mut update_order, update.order.clone());
            }
            if let Some(last) = outcome.trades.last() {
                mark = last.price;
                result.last_trade_price = Some(last.price);
            }
            result.trades.extend(outcome.trades);
            record_update(&mut updates, &mut update_order, outcome.incoming);
        }

        result.order_updates = update_order
            .into_iter()
            .filter_map(|id| updates.remove(&id))
            .collect();
        result
    }

    /// Remove a resting order from its book, if present.
    pub fn cancel_resting(&mut self, symbol: &str, order_id: &str) -> Option<Order> {
        self.books.get_mut(symbol)?.remove(order_id)
    }

    fn validate(&self, order: &Order) -> Option<&'static str> {
        if order.quantity <= 0 {
            return Some("non-positive quantity");
        }
        if order.quantity > self.policy.max_quantity {
            return Some("quantity above limit");
        }
        match order.order_type {
            OrderType::Limit => match order.price {
                None => Some("limit order without price"),
                Some(p) if p <= 0.0 || p > self.policy.max_price => Some("price out of bounds"),
                _ => None,
            },
            OrderType::Market => None,
            OrderType::Stop => match order.stop_price {
                None => Some("stop order without stop price"),
                Some(p) if p <= 0.0 || p > self.policy.max_price => {
                    Some("stop price out of bounds")
                }
                _ => match order.price {
                    Some(p) if p <= 0.0 || p > self.policy.max_price => {
                        Some("price out of bounds")
                    }
                    _ => None,
                },
            },
        }
    }
}

/// BUY stop triggers at last price >= stop; SELL stop at last price <= stop.
fn stop_triggered(order: &Order, last_price: f64) -> bool {
    let Some(stop) = order.stop_price else {
        return false;
    };
    match order.side {
        Side::Buy => last_price >= stop,
        Side::Sell => last_price <= stop,
    }
}

fn record_update(
    updates: &mut HashMap<String, Order>,
    order_ids: &mut Vec<String>,
    order: Order,
) {
    if !updates.contains_key(&order.id) {
        order_ids.push(order.id.clone());
    }
    updates.insert(order.id.clone(), order);
}
