//! The tick scheduler and per-tick pipeline.
//!
//! Exactly one tick runs at a time: advance the clock, match pending orders
//! per symbol, persist trade effects, evolve prices, publish topic messages,
//! fan out webhooks, ingest returned actions, persist the world. Critical
//! store failures abort the tick without advancing it; the scheduler stops
//! unless auto-recovery is on.

use crate::actions::ActionProcessor;
use crate::config::Config;
use crate::dispatch::{
    CircuitRegistry, PayloadBuilder, TickSnapshot, WebhookDispatcher, WebhookTransport,
};
use crate::engine::events::{aggregate_sentiment, EventGenerator};
use crate::engine::pricing::{PriceInputs, PriceModel};
use crate::live::{BroadcastKind, BusMessage, PubSub};
use crate::matching::{MatchingEngine, MatchingPolicy};
use crate::models::{
    ActionResult, AgentStatus, Company, MarketEvent, MarketIndex, NewsCategory, NewsItem,
    StockQuote, Trade, WorldState,
};
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// News window feeding the sentiment driver.
const SENTIMENT_LOOKBACK_TICKS: u64 = 20;
const NEWS_PAYLOAD_LIMIT: usize = 20;

/// Engine heartbeat, logged and published on the events topic every tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub tick: u64,
    pub status: String,
    pub duration_ms: u64,
    pub trade_count: usize,
    pub dispatched: usize,
    pub actions_processed: usize,
}

/// Summary of one completed tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub tick: u64,
    pub market_open: bool,
    pub trade_count: usize,
    pub dispatched: usize,
    pub actions_processed: usize,
}

pub struct TickEngine {
    config: Config,
    store: SqliteStore,
    matching: Arc<Mutex<MatchingEngine>>,
    price_model: PriceModel,
    event_gen: EventGenerator,
    dispatcher: WebhookDispatcher,
    processor: ActionProcessor,
    builder: Arc<PayloadBuilder>,
    bus: Arc<dyn PubSub>,
    registry: Arc<CircuitRegistry>,
    prices: Arc<ArcSwap<HashMap<String, f64>>>,
    current_tick: Arc<AtomicU64>,
    world: WorldState,
    active_events: Vec<MarketEvent>,
    /// Results of the previous tick's ingested actions, keyed by agent.
    pending_action_results: HashMap<String, Vec<ActionResult>>,
    /// Per-sector average log-move of the previous tick.
    sector_moves: HashMap<String, f64>,
    /// Previous index values for change computation.
    index_values: HashMap<String, f64>,
    /// News ids already broadcast, so late-written items (rumors ingested
    /// after publish) go out exactly once on the following tick.
    broadcast_news_ids: std::collections::HashSet<String>,
}

impl TickEngine {
    pub fn new(
        config: Config,
        store: SqliteStore,
        transport: Arc<dyn WebhookTransport>,
        bus: Arc<dyn PubSub>,
    ) -> Result<Self> {
        let world = store.load_world().context("Failed to load world state")?;
        let matching = Arc::new(Mutex::new(MatchingEngine::new(MatchingPolicy {
            allow_self_trading: config.engine.allow_self_trading,
            max_quantity: config.actions.max_order_quantity,
            max_price: config.actions.max_order_price,
        })));
        let registry = Arc::new(CircuitRegistry::new(config.circuit));
        let dispatcher = WebhookDispatcher::new(
            transport,
            Arc::clone(&registry),
            store.clone(),
            config.webhook.clone(),
        );
        let processor = ActionProcessor::new(
            store.clone(),
            Arc::clone(&matching),
            config.actions.clone(),
            config.engine.rng_seed.wrapping_add(1),
        );
        let builder = Arc::new(PayloadBuilder::new(store.clone()));
        let price_model = PriceModel::new(
            config.engine.rng_seed,
            config.engine.price_floor,
            config.engine.price_move_cap,
        );
        let event_gen = EventGenerator::new(
            config.engine.rng_seed.wrapping_add(2),
            config.engine.events_enabled,
            config.engine.event_chance,
        );
        let current_tick = Arc::new(AtomicU64::new(world.current_tick));

        Ok(Self {
            config,
            store,
            matching,
            price_model,
            event_gen,
            dispatcher,
            processor,
            builder,
            bus,
            registry,
            prices: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            current_tick,
            world,
            active_events: Vec::new(),
            pending_action_results: HashMap::new(),
            sector_moves: HashMap::new(),
            index_values: HashMap::new(),
            broadcast_news_ids: std::collections::HashSet::new(),
        })
    }

    /// Shared tick counter for the live layer.
    pub fn current_tick_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current_tick)
    }

    /// Lock-free price snapshot for readers off the tick path.
    pub fn price_cache(&self) -> Arc<ArcSwap<HashMap<String, f64>>> {
        Arc::clone(&self.prices)
    }

    /// Breaker stats for observability surfaces.
    pub fn circuit_registry(&self) -> Arc<CircuitRegistry> {
        Arc::clone(&self.registry)
    }

    /// Rebuild in-memory books from resting orders after a restart, and warm
    /// the price cache.
    pub fn restore(&mut self) -> Result<()> {
        for symbol in self.store.symbols_with_resting_orders()? {
            let resting = self.store.resting_orders_for_symbol(&symbol)?;
            let count = resting.len();
            self.matching.lock().restore_resting(&symbol, resting);
            info!(symbol, resting = count, "restored order book");
        }
        let prices: HashMap<String, f64> = self
            .store
            .list_companies()?
            .into_iter()
            .map(|c| (c.symbol, c.price))
            .collect();
        self.prices.store(Arc::new(prices));
        Ok(())
    }

    /// Drive ticks at the configured cadence until a fatal error (with
    /// auto-recovery off) stops the scheduler.
    pub async fn run(mut self) {
        let mut ticker = interval(self.config.engine.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.engine.tick_interval.as_millis() as u64,
            "tick engine started"
        );

        loop {
            ticker.tick().await;
            let started = Instant::now();
            match self.run_tick().await {
                Ok(outcome) => {
                    let duration = started.elapsed();
                    histogram!("tick_duration_ms", duration.as_millis() as f64);
                    if duration > self.config.engine.tick_interval {
                        warn!(
                            tick = outcome.tick,
                            duration_ms = duration.as_millis() as u64,
                            "tick overran its interval"
                        );
                    }
                    self.publish_heartbeat(&Heartbeat {
                        tick: outcome.tick,
                        status: "ok".to_string(),
                        duration_ms: duration.as_millis() as u64,
                        trade_count: outcome.trade_count,
                        dispatched: outcome.dispatched,
                        actions_processed: outcome.actions_processed,
                    });
                }
                Err(e) => {
                    error!(error = %e, "fatal tick error");
                    self.publish_heartbeat(&Heartbeat {
                        tick: self.world.current_tick,
                        status: "error".to_string(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        trade_count: 0,
                        dispatched: 0,
                        actions_processed: 0,
                    });
                    if !self.config.engine.auto_recovery_enabled {
                        error!("scheduler stopped; operator intervention required");
                        break;
                    }
                    warn!("auto-recovery enabled, retrying next interval");
                }
            }
        }
    }

    /// Execute one tick of the pipeline.
    pub async fn run_tick(&mut self) -> Result<TickOutcome> {
        let tick = self.world.current_tick + 1;
        let market_open = self.config.engine.is_market_open(tick);
        debug!(tick, market_open, "tick start");

        if !market_open {
            self.world.current_tick = tick;
            self.world.market_open = false;
            self.world.last_tick_at = Some(Utc::now());
            self.store
                .save_world(&self.world)
                .context("Failed to persist world state")?;
            self.current_tick.store(tick, Ordering::SeqCst);
            self.bus.publish(BusMessage::new(
                "tick_updates",
                BroadcastKind::TickUpdate,
                serde_json::json!({
                    "tick": tick,
                    "marketOpen": false,
                }),
            ));
            return Ok(TickOutcome {
                tick,
                market_open: false,
                trade_count: 0,
                dispatched: 0,
                actions_processed: 0,
            });
        }
        self.world.market_open = true;

        // 2. Matching over symbols with matchable orders.
        let mut companies: HashMap<String, Company> = self
            .store
            .list_companies()?
            .into_iter()
            .map(|c| (c.symbol.clone(), c))
            .collect();

        let mut all_trades: Vec<Trade> = Vec::new();
        let mut volume_by_symbol: HashMap<String, i64> = HashMap::new();
        let mut pressure_by_symbol: HashMap<String, i64> = HashMap::new();
        let mut agent_updates: HashMap<String, Vec<crate::models::Order>> = HashMap::new();

        for symbol in self.store.symbols_with_matchable_orders()? {
            let matchable = self.store.matchable_orders_for_symbol(&symbol)?;
            let last_price = companies.get(&symbol).map(|c| c.price).unwrap_or(0.0);
            let pass = self
                .matching
                .lock()
                .run_symbol(&symbol, matchable, last_price, tick);

            // Critical batch: trades, statuses, holdings, cash together.
            self.store
                .apply_match_batch(&pass.trades, &pass.order_updates)
                .with_context(|| format!("Match persistence failed for {symbol}"))?;

            if pass.traded_volume > 0 {
                volume_by_symbol.insert(symbol.clone(), pass.traded_volume);
                pressure_by_symbol.insert(symbol.clone(), pass.net_aggressor_volume);
            }
            for order in &pass.order_updates {
                agent_updates
                    .entry(order.agent_id.clone())
                    .or_default()
                    .push(order.clone());
            }
            counter!("trades_matched_total", pass.trades.len() as u64);
            all_trades.extend(pass.trades);
        }

        // 3. Price model over all listed companies.
        self.active_events.retain(|e| !e.is_expired(tick));
        let recent_news = self
            .store
            .news_since(tick.saturating_sub(SENTIMENT_LOOKBACK_TICKS), 200)
            .unwrap_or_default();

        let mut new_sector_moves: HashMap<String, (f64, usize)> = HashMap::new();
        for company in companies.values_mut() {
            let inputs = PriceInputs {
                company,
                net_aggressor_volume: pressure_by_symbol
                    .get(&company.symbol)
                    .copied()
                    .unwrap_or(0),
                traded_volume: volume_by_symbol.get(&company.symbol).copied().unwrap_or(0),
                sector_factor: self
                    .sector_moves
                    .get(&company.sector)
                    .copied()
                    .unwrap_or(0.0),
                events: &self.active_events,
                sentiment: aggregate_sentiment(&company.symbol, &recent_news, tick),
                regime: self.world.regime,
                tick,
            };
            let new_price = self.price_model.next_price(&inputs);
            let log_move = (new_price / company.price.max(self.config.engine.price_floor)).ln();
            let entry = new_sector_moves
                .entry(company.sector.clone())
                .or_insert((0.0, 0));
            entry.0 += log_move;
            entry.1 += 1;

            let traded = volume_by_symbol.get(&company.symbol).copied().unwrap_or(0);
            company.record_price(new_price, traded);
            self.store
                .update_company_price(
                    &company.symbol,
                    company.price,
                    company.high,
                    company.low,
                    company.volume,
                )
                .with_context(|| format!("Price persistence failed for {}", company.symbol))?;
        }
        self.sector_moves = new_sector_moves
            .into_iter()
            .map(|(sector, (sum, n))| (sector, sum / n.max(1) as f64))
            .collect();

        let price_map: HashMap<String, f64> = companies
            .values()
            .map(|c| (c.symbol.clone(), c.price))
            .collect();
        self.prices.store(Arc::new(price_map.clone()));

        // 4. Tick-scoped events and news (non-critical writes).
        let company_list: Vec<Company> = companies.values().cloned().collect();
        let mut tick_news: Vec<NewsItem> = Vec::new();
        if let Some((event, news)) = self.event_gen.maybe_generate(tick, &company_list) {
            info!(tick, headline = %event.headline, "market event opened");
            if let Err(e) = self.store.insert_news(&news) {
                warn!(error = %e, "news write failed");
            }
            tick_news.push(news);
            self.active_events.push(event);
        }
        // Rumors and other news written after the previous publish step.
        for item in self
            .store
            .news_since(tick.saturating_sub(1), NEWS_PAYLOAD_LIMIT)
            .unwrap_or_default()
        {
            if !self.broadcast_news_ids.contains(&item.id)
                && !tick_news.iter().any(|n| n.id == item.id)
            {
                tick_news.push(item);
            }
        }
        self.broadcast_news_ids = tick_news.iter().map(|n| n.id.clone()).collect();

        let quotes: Vec<StockQuote> = company_list.iter().map(StockQuote::from_company).collect();
        let indices = self.compute_indices(&company_list);
        let leaderboard = self.compute_leaderboard(&price_map)?;

        // 5. Publish topic messages (after matching and price writes).
        self.publish_tick_topics(
            tick,
            &quotes,
            &indices,
            &price_map,
            &all_trades,
            &tick_news,
            &leaderboard,
            &agent_updates,
        );

        // 6. Webhook fan-out.
        let action_results = std::mem::take(&mut self.pending_action_results);
        let snapshot = Arc::new(TickSnapshot {
            tick,
            timestamp: Utc::now(),
            world: WorldState {
                current_tick: tick,
                market_open: true,
                last_tick_at: Some(Utc::now()),
                ..self.world.clone()
            },
            quotes,
            indices,
            prices: price_map.clone(),
            trades: all_trades.clone(),
            news: tick_news,
            events: self.active_events.clone(),
            action_results,
        });
        let recipients = self.store.webhook_recipients()?;
        let dispatched = recipients.len();
        let outcomes = self
            .dispatcher
            .dispatch_tick(Arc::clone(&snapshot), Arc::clone(&self.builder), recipients)
            .await;

        // 7. Ingest returned actions; results ride in the next payload.
        let mut actions_processed = 0;
        for outcome in outcomes {
            if !outcome.success || outcome.actions.is_empty() {
                continue;
            }
            let results =
                self.processor
                    .process_batch(&outcome.agent_id, outcome.actions, tick);
            actions_processed += results.len();
            self.pending_action_results
                .insert(outcome.agent_id, results);
        }

        // Supplement: close out broke participants before the tick seals.
        self.settle_bankruptcies(&price_map, tick)?;

        // 8. Persist the advanced world.
        self.world.current_tick = tick;
        self.world.last_tick_at = Some(Utc::now());
        self.store
            .save_world(&self.world)
            .context("Failed to persist world state")?;
        self.current_tick.store(tick, Ordering::SeqCst);

        Ok(TickOutcome {
            tick,
            market_open: true,
            trade_count: all_trades.len(),
            dispatched,
            actions_processed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_tick_topics(
        &self,
        tick: u64,
        quotes: &[StockQuote],
        indices: &[MarketIndex],
        prices: &HashMap<String, f64>,
        trades: &[Trade],
        news: &[NewsItem],
        leaderboard: &serde_json::Value,
        agent_updates: &HashMap<String, Vec<crate::models::Order>>,
    ) {
        self.bus.publish(BusMessage::new(
            "tick_updates",
            BroadcastKind::TickUpdate,
            serde_json::json!({
                "tick": tick,
                "marketOpen": true,
                "regime": self.world.regime,
                "prices": prices,
                "tradeCount": trades.len(),
                "indices": indices,
            }),
        ));

        self.bus.publish(BusMessage::new(
            "prices",
            BroadcastKind::PriceUpdate,
            serde_json::json!({ "tick": tick, "prices": prices }),
        ));

        for trade in trades {
            self.bus.publish(BusMessage::new(
                "trades",
                BroadcastKind::Trade,
                serde_json::to_value(trade).unwrap_or_default(),
            ));
        }

        for quote in quotes {
            self.bus.publish(BusMessage::new(
                format!("market:{}", quote.symbol),
                BroadcastKind::MarketUpdate,
                serde_json::to_value(quote).unwrap_or_default(),
            ));
        }

        for item in news {
            self.bus.publish(BusMessage::new(
                "news",
                BroadcastKind::News,
                serde_json::to_value(item).unwrap_or_default(),
            ));
        }

        self.bus.publish(BusMessage::new(
            "leaderboard",
            BroadcastKind::Leaderboard,
            leaderboard.clone(),
        ));

        // Private per-participant deltas: orders, trades, and the refreshed
        // portfolio numbers after this tick's fills.
        for (agent_id, orders) in agent_updates {
            let trades_for_agent: Vec<&Trade> = trades
                .iter()
                .filter(|t| &t.buyer_id == agent_id || &t.seller_id == agent_id)
                .collect();
            let portfolio = self.portfolio_summary(agent_id, prices);
            self.bus.publish(BusMessage::new(
                format!("agent:{agent_id}"),
                BroadcastKind::AgentUpdate,
                serde_json::json!({
                    "tick": tick,
                    "orders": orders,
                    "trades": trades_for_agent,
                    "portfolio": portfolio,
                }),
            ));
        }
    }

    /// Small portfolio delta for the private agent topic. Best-effort: a read
    /// failure degrades to null rather than blocking the publish step.
    fn portfolio_summary(
        &self,
        agent_id: &str,
        prices: &HashMap<String, f64>,
    ) -> serde_json::Value {
        let Ok(Some(agent)) = self.store.get_agent(agent_id) else {
            return serde_json::Value::Null;
        };
        let position_value: f64 = self
            .store
            .holdings_for_agent(agent_id)
            .unwrap_or_default()
            .iter()
            .map(|h| prices.get(&h.symbol).copied().unwrap_or(0.0) * h.quantity as f64)
            .sum();
        serde_json::json!({
            "cash": agent.cash,
            "marginUsed": agent.margin_used,
            "marginAvailable": agent.margin_available(),
            "netWorth": agent.cash + position_value,
        })
    }

    fn compute_indices(&mut self, companies: &[Company]) -> Vec<MarketIndex> {
        let mut groups: HashMap<String, f64> = HashMap::new();
        let mut total = 0.0;
        for c in companies {
            total += c.market_cap();
            *groups.entry(c.sector.clone()).or_default() += c.market_cap();
        }

        let mut indices = Vec::with_capacity(groups.len() + 1);
        let mut push = |name: String, cap: f64, last: &mut HashMap<String, f64>| {
            // Scale market cap into a readable index level.
            let value = cap / 1_000_000.0;
            let previous = last.get(&name).copied().unwrap_or(value);
            let change = value - previous;
            let change_percent = if previous.abs() > f64::EPSILON {
                change / previous * 100.0
            } else {
                0.0
            };
            last.insert(name.clone(), value);
            indices.push(MarketIndex {
                name,
                value,
                change,
                change_percent,
            });
        };

        push("COMPOSITE".to_string(), total, &mut self.index_values);
        let mut sectors: Vec<_> = groups.into_iter().collect();
        sectors.sort_by(|a, b| a.0.cmp(&b.0));
        for (sector, cap) in sectors {
            push(sector.to_uppercase(), cap, &mut self.index_values);
        }
        indices
    }

    fn compute_leaderboard(&self, prices: &HashMap<String, f64>) -> Result<serde_json::Value> {
        let mut rows = Vec::new();
        for agent in self.store.all_agents()? {
            let holdings = self.store.holdings_for_agent(&agent.id)?;
            let position_value: f64 = holdings
                .iter()
                .map(|h| prices.get(&h.symbol).copied().unwrap_or(0.0) * h.quantity as f64)
                .sum();
            rows.push((agent.name, agent.status, agent.cash + position_value));
        }
        rows.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let entries: Vec<serde_json::Value> = rows
            .into_iter()
            .enumerate()
            .map(|(rank, (name, status, net_worth))| {
                serde_json::json!({
                    "rank": rank + 1,
                    "name": name,
                    "status": status,
                    "netWorth": net_worth,
                })
            })
            .collect();
        Ok(serde_json::json!({ "leaders": entries }))
    }

    fn settle_bankruptcies(&self, prices: &HashMap<String, f64>, tick: u64) -> Result<()> {
        for agent in self.store.all_agents()? {
            if agent.status != AgentStatus::Active {
                continue;
            }
            let holdings = self.store.holdings_for_agent(&agent.id)?;
            let position_value: f64 = holdings
                .iter()
                .map(|h| prices.get(&h.symbol).copied().unwrap_or(0.0) * h.quantity as f64)
                .sum();
            if agent.cash + position_value < 0.0 {
                warn!(agent = %agent.id, "participant bankrupt");
                self.store
                    .update_agent_status(&agent.id, AgentStatus::Bankrupt)?;
                let news = NewsItem::new(
                    tick,
                    format!("{} declared bankrupt", agent.name),
                    NewsCategory::Market,
                )
                .with_sentiment(-0.4)
                .with_agents(vec![agent.id.clone()]);
                if let Err(e) = self.store.insert_news(&news) {
                    warn!(error = %e, "bankruptcy news write failed");
                }
            }
        }
        Ok(())
    }

    fn publish_heartbeat(&self, heartbeat: &Heartbeat) {
        info!(
            tick = heartbeat.tick,
            status = %heartbeat.status,
            duration_ms = heartbeat.duration_ms,
            trades = heartbeat.trade_count,
            dispatched = heartbeat.dispatched,
            "tick heartbeat"
        );
        self.bus.publish(BusMessage::new(
            "events",
            BroadcastKind::Event,
            serde_json::to_value(heartbeat).unwrap_or_default(),
        ));
    }
}
