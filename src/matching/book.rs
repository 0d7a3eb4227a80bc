//! Price-time priority limit order book for a single symbol.
//!
//! Ladder keys are integer cents so BTreeMap ordering is exact; each level is
//! a FIFO queue of resting limit orders. Market and stop orders never rest
//! here: unfilled market remainders stay pending off-book, and stops are held
//! by the store until their trigger fires.

use crate::models::{Order, OrderStatus, Side, Trade};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

/// Convert a price to integer cents for ladder keys.
#[inline]
pub fn price_to_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

/// Convert ladder cents back to a price.
#[inline]
pub fn cents_to_price(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// A single price level with FIFO order queue.
#[derive(Debug, Default)]
struct PriceLevel {
    orders: VecDeque<Order>,
    total_quantity: i64,
}

impl PriceLevel {
    fn add(&mut self, order: Order) {
        self.total_quantity += order.remaining();
        self.orders.push_back(order);
    }

    fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// One resting order touched by a match cycle, with its post-fill snapshot.
#[derive(Debug, Clone)]
pub struct RestingUpdate {
    pub order: Order,
    pub filled_this_cycle: i64,
}

/// Result of submitting one incoming order.
#[derive(Debug)]
pub struct SubmitOutcome {
    /// Incoming order with updated fills and status.
    pub incoming: Order,
    pub trades: Vec<Trade>,
    pub resting_updates: Vec<RestingUpdate>,
    /// True when the incoming remainder now rests on the ladder.
    pub rested: bool,
}

/// The book for one symbol.
pub struct OrderBook {
    pub symbol: String,
    /// Bids keyed by cents; best bid is the highest key.
    bids: BTreeMap<i64, PriceLevel>,
    /// Asks keyed by cents; best ask is the lowest key.
    asks: BTreeMap<i64, PriceLevel>,
    /// Order id -> (side, level key) for cancels.
    index: HashMap<String, (Side, i64)>,
    /// When false, the matching loop skips resting orders owned by the
    /// incoming agent and continues down the price-time queue.
    allow_self_trading: bool,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>, allow_self_trading: bool) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            allow_self_trading,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().copied().map(cents_to_price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().copied().map(cents_to_price)
    }

    pub fn resting_order_count(&self) -> usize {
        self.index.len()
    }

    /// Rest an already-validated open/partial limit order without matching,
    /// used to rebuild the ladder from the store after a restart.
    pub fn restore(&mut self, order: Order) {
        if let Some(price) = order.price {
            let key = price_to_cents(price);
            self.index.insert(order.id.clone(), (order.side, key));
            self.side_mut(order.side).entry(key).or_default().add(order);
        }
    }

    /// Process one incoming pending order against the opposite half-book.
    ///
    /// The caller is responsible for stop-trigger conversion; by the time an
    /// order reaches here it is a plain market or limit order. `tick` stamps
    /// the trades and terminal fills.
    pub fn submit(&mut self, mut incoming: Order, tick: u64) -> SubmitOutcome {
        let limit_cents = match incoming.price {
            Some(p) => price_to_cents(p),
            // Market orders sweep the whole opposite ladder.
            None => match incoming.side {
                Side::Buy => i64::MAX,
                Side::Sell => i64::MIN,
            },
        };

        let mut trades = Vec::new();
        let mut resting_updates = Vec::new();

        while incoming.remaining() > 0 {
            let Some((level_key, queue_pos)) = self.next_candidate(&incoming, limit_cents) else {
                break;
            };

            let opposite = match incoming.side {
                Side::Buy => &mut self.asks,
                Side::Sell => &mut self.bids,
            };
            let Some(level) = opposite.get_mut(&level_key) else {
                break;
            };
            let Some(resting) = level.orders.get_mut(queue_pos) else {
                break;
            };

            let qty = incoming.remaining().min(resting.remaining());
            // Resting-side price priority: trade at the resting price.
            let price = cents_to_price(level_key);

            let (buyer, seller) = match incoming.side {
                Side::Buy => (&incoming, &*resting),
                Side::Sell => (&*resting, &incoming),
            };
            trades.push(Trade {
                id: Uuid::new_v4().to_string(),
                tick,
                symbol: self.symbol.clone(),
                buyer_id: buyer.agent_id.clone(),
                seller_id: seller.agent_id.clone(),
                buyer_order_id: buyer.id.clone(),
                seller_order_id: seller.id.clone(),
                price,
                quantity: qty,
                created_at: Utc::now(),
            });

            resting.apply_fill(qty, price, tick);
            let resting_snapshot = resting.clone();
            let resting_done = resting.remaining() == 0;

            level.total_quantity -= qty;
            resting_updates.push(RestingUpdate {
                order: resting_snapshot,
                filled_this_cycle: qty,
            });

            if resting_done {
                if let Some(done) = level.orders.remove(queue_pos) {
                    self.index.remove(&done.id);
                }
                if level.is_empty() {
                    opposite.remove(&level_key);
                }
            }

            incoming.apply_fill(qty, price, tick);
        }

        let rested = self.place_remainder(&mut incoming);

        SubmitOutcome {
            incoming,
            trades,
            resting_updates,
            rested,
        }
    }

    /// Remove a resting order from the ladder. Returns the removed order.
    pub fn remove(&mut self, order_id: &str) -> Option<Order> {
        let (side, key) = self.index.remove(order_id)?;
        let half = self.side_mut(side);
        let level = half.get_mut(&key)?;
        let pos = level.orders.iter().position(|o| o.id == order_id)?;
        let order = level.orders.remove(pos)?;
        level.total_quantity -= order.remaining();
        if level.is_empty() {
            half.remove(&key);
        }
        Some(order)
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<i64, PriceLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Best price-time candidate on the opposite half-book that crosses the
    /// incoming limit, honoring the self-trade policy. Returns the level key
    /// and position within the level's queue.
    fn next_candidate(&self, incoming: &Order, limit_cents: i64) -> Option<(i64, usize)> {
        let levels: Box<dyn Iterator<Item = (&i64, &PriceLevel)>> = match incoming.side {
            // Buy walks asks from the lowest price up to the limit.
            Side::Buy => Box::new(self.asks.range(..=limit_cents)),
            // Sell walks bids from the highest price down to the limit.
            Side::Sell => Box::new(self.bids.range(limit_cents..).rev()),
        };

        for (&key, level) in levels {
            for (pos, resting) in level.orders.iter().enumerate() {
                if !self.allow_self_trading && resting.agent_id == incoming.agent_id {
                    continue;
                }
                return Some((key, pos));
            }
        }
        None
    }

    /// Rest an unfilled limit remainder; market remainders stay off-book.
    fn place_remainder(&mut self, incoming: &mut Order) -> bool {
        if incoming.remaining() == 0 || incoming.status.is_terminal() {
            return false;
        }
        let Some(price) = incoming.price else {
            // Market order without a counterparty: leave it pending (or
            // partial), the next tick retries it.
            return false;
        };

        if incoming.status == OrderStatus::Pending {
            incoming.status = OrderStatus::Open;
        }
        let key = price_to_cents(price);
        self.index.insert(incoming.id.clone(), (incoming.side, key));
        self.side_mut(incoming.side)
            .entry(key)
            .or_default()
            .add(incoming.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderType;

    fn limit(agent: &str, side: Side, qty: i64, price: f64) -> Order {
        Order::new_pending(agent, "AAPL", side, OrderType::Limit, qty, Some(price), None, 0)
    }

    fn market(agent: &str, side: Side, qty: i64) -> Order {
        Order::new_pending(agent, "AAPL", side, OrderType::Market, qty, None, None, 0)
    }

    #[test]
    fn resting_sell_then_crossing_buy_fills_both() {
        let mut book = OrderBook::new("AAPL", true);

        let sell = book.submit(limit("s", Side::Sell, 100, 150.0), 1);
        assert!(sell.rested);
        assert_eq!(sell.incoming.status, OrderStatus::Open);
        assert_eq!(book.best_ask(), Some(150.0));

        let buy = book.submit(limit("b", Side::Buy, 100, 150.0), 2);
        assert_eq!(buy.trades.len(), 1);
        let trade = &buy.trades[0];
        assert_eq!(trade.quantity, 100);
        assert!((trade.price - 150.0).abs() < 1e-9);
        assert_eq!(trade.tick, 2);
        assert_eq!(buy.incoming.status, OrderStatus::Filled);
        assert_eq!(buy.resting_updates.len(), 1);
        assert_eq!(buy.resting_updates[0].order.status, OrderStatus::Filled);
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn partial_fill_leaves_incoming_partial_and_rested() {
        let mut book = OrderBook::new("AAPL", true);
        book.submit(limit("s", Side::Sell, 50, 150.0), 1);

        let buy = book.submit(limit("b", Side::Buy, 100, 150.0), 2);
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].quantity, 50);
        assert_eq!(buy.incoming.status, OrderStatus::Partial);
        assert_eq!(buy.incoming.filled_quantity, 50);
        assert!((buy.incoming.avg_fill_price.unwrap() - 150.0).abs() < 1e-9);
        // Remainder rests on the bid ladder.
        assert!(buy.rested);
        assert_eq!(book.best_bid(), Some(150.0));
    }

    #[test]
    fn market_without_liquidity_stays_pending_off_book() {
        let mut book = OrderBook::new("AAPL", true);
        let outcome = book.submit(market("b", Side::Buy, 100), 1);
        assert!(outcome.trades.is_empty());
        assert!(!outcome.rested);
        assert_eq!(outcome.incoming.status, OrderStatus::Pending);
        assert_eq!(book.resting_order_count(), 0);
    }

    #[test]
    fn price_time_priority_within_level() {
        let mut book = OrderBook::new("AAPL", true);
        let first = book.submit(limit("s1", Side::Sell, 10, 150.0), 1).incoming;
        let _second = book.submit(limit("s2", Side::Sell, 10, 150.0), 1).incoming;

        let buy = book.submit(limit("b", Side::Buy, 10, 150.0), 2);
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].seller_order_id, first.id);
    }

    #[test]
    fn better_price_matches_before_earlier_time() {
        let mut book = OrderBook::new("AAPL", true);
        book.submit(limit("s1", Side::Sell, 10, 151.0), 1);
        let cheap = book.submit(limit("s2", Side::Sell, 10, 150.0), 1).incoming;

        let buy = book.submit(limit("b", Side::Buy, 10, 151.0), 2);
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].seller_order_id, cheap.id);
        // Crossing limit trades at the resting price.
        assert!((buy.trades[0].price - 150.0).abs() < 1e-9);
    }

    #[test]
    fn market_order_sweeps_multiple_levels() {
        let mut book = OrderBook::new("AAPL", true);
        book.submit(limit("s1", Side::Sell, 10, 150.0), 1);
        book.submit(limit("s2", Side::Sell, 10, 151.0), 1);

        let buy = book.submit(market("b", Side::Buy, 15), 2);
        assert_eq!(buy.trades.len(), 2);
        assert_eq!(buy.trades[0].quantity, 10);
        assert!((buy.trades[0].price - 150.0).abs() < 1e-9);
        assert_eq!(buy.trades[1].quantity, 5);
        assert!((buy.trades[1].price - 151.0).abs() < 1e-9);
        assert_eq!(buy.incoming.status, OrderStatus::Filled);
        // The partially consumed second level still rests.
        assert_eq!(book.best_ask(), Some(151.0));
    }

    #[test]
    fn self_trade_prevention_skips_own_resting_order() {
        let mut book = OrderBook::new("AAPL", false);
        book.submit(limit("a", Side::Sell, 10, 150.0), 1);
        let other = book.submit(limit("b", Side::Sell, 10, 151.0), 1).incoming;

        let buy = book.submit(limit("a", Side::Buy, 10, 151.0), 2);
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].seller_order_id, other.id);
        assert!((buy.trades[0].price - 151.0).abs() < 1e-9);
        // Own order still resting.
        assert_eq!(book.best_ask(), Some(150.0));
    }

    #[test]
    fn self_trade_allowed_when_policy_permits() {
        let mut book = OrderBook::new("AAPL", true);
        book.submit(limit("a", Side::Sell, 10, 150.0), 1);
        let buy = book.submit(limit("a", Side::Buy, 10, 150.0), 2);
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].buyer_id, "a");
        assert_eq!(buy.trades[0].seller_id, "a");
    }

    #[test]
    fn cancel_removes_resting_order_and_empty_level() {
        let mut book = OrderBook::new("AAPL", true);
        let rested = book.submit(limit("s", Side::Sell, 10, 150.0), 1).incoming;
        assert_eq!(book.resting_order_count(), 1);

        let removed = book.remove(&rested.id).expect("resting order");
        assert_eq!(removed.id, rested.id);
        assert_eq!(book.best_ask(), None);
        assert!(book.remove(&rested.id).is_none());
    }

    #[test]
    fn sell_walks_bids_from_best_down_to_limit() {
        let mut book = OrderBook::new("AAPL", true);
        book.submit(limit("b1", Side::Buy, 10, 149.0), 1);
        book.submit(limit("b2", Side::Buy, 10, 150.0), 1);

        let sell = book.submit(limit("s", Side::Sell, 15, 149.0), 2);
        assert_eq!(sell.trades.len(), 2);
        assert!((sell.trades[0].price - 150.0).abs() < 1e-9);
        assert!((sell.trades[1].price - 149.0).abs() < 1e-9);
        assert_eq!(sell.trades[1].quantity, 5);
    }

    #[test]
    fn restore_rebuilds_ladder_without_matching() {
        let mut book = OrderBook::new("AAPL", true);
        let mut resting = limit("s", Side::Sell, 10, 150.0);
        resting.status = OrderStatus::Open;
        book.restore(resting);
        assert_eq!(book.best_ask(), Some(150.0));
        assert_eq!(book.resting_order_count(), 1);
    }
}
