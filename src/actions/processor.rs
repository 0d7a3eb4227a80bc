//! Validates, caps, and applies returned action lists.
//!
//! Every processed action lands in the action log (best-effort) and produces
//! an ActionResult the participant sees in the next tick's payload. Actions
//! beyond the per-tick cap are dropped silently.

use crate::actions::types::{Action, TradeRequest};
use crate::config::ActionConfig;
use crate::matching::MatchingEngine;
use crate::models::{
    ActionResult, Agent, AgentRole, Alliance, AllianceStatus, DirectMessage, Investigation,
    InvestigationType, NewsCategory, NewsItem, Order, OrderStatus, OrderType, Side,
};
use crate::store::SqliteStore;
use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct ActionProcessor {
    store: SqliteStore,
    books: Arc<Mutex<MatchingEngine>>,
    config: ActionConfig,
    rng: Mutex<ChaCha8Rng>,
}

impl ActionProcessor {
    pub fn new(
        store: SqliteStore,
        books: Arc<Mutex<MatchingEngine>>,
        config: ActionConfig,
        seed: u64,
    ) -> Self {
        let seed = if seed == 0 { rand::thread_rng().gen() } else { seed };
        Self {
            store,
            books,
            config,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Apply one participant's returned actions for the tick, capped at the
    /// configured limit. Returns one result per processed action.
    pub fn process_batch(
        &self,
        agent_id: &str,
        actions: Vec<Action>,
        tick: u64,
    ) -> Vec<ActionResult> {
        let total = actions.len();
        if total > self.config.per_tick_cap {
            debug!(
                agent = agent_id,
                total,
                cap = self.config.per_tick_cap,
                "action list over cap, dropping remainder"
            );
        }

        let mut results = Vec::new();
        for action in actions.into_iter().take(self.config.per_tick_cap) {
            let result = self.apply(agent_id, &action, tick);
            let payload = serde_json::to_string(&action).unwrap_or_else(|_| "{}".to_string());
            let snippet: String = result.message.chars().take(200).collect();
            self.store.append_action_log(
                tick,
                agent_id,
                action.kind(),
                &payload,
                &snippet,
                result.success,
            );
            results.push(result);
        }
        results
    }

    fn apply(&self, agent_id: &str, action: &Action, tick: u64) -> ActionResult {
        match self.try_apply(agent_id, action, tick) {
            Ok((message, order_id)) => ActionResult {
                action_type: action.kind().to_string(),
                success: true,
                message,
                order_id,
            },
            Err(e) => ActionResult {
                action_type: action.kind().to_string(),
                success: false,
                message: e.to_string(),
                order_id: None,
            },
        }
    }

    fn try_apply(
        &self,
        agent_id: &str,
        action: &Action,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        let Some(agent) = self.store.get_agent(agent_id)? else {
            bail!("Unknown participant");
        };
        if !agent.is_active() {
            bail!("Participant is {}", agent.status.as_str());
        }

        match action {
            Action::Buy(req) | Action::Cover(req) => {
                self.submit_order(&agent, req, Side::Buy, tick)
            }
            Action::Sell(req) => self.submit_order(&agent, req, Side::Sell, tick),
            Action::Short(req) => {
                self.check_short_margin(&agent, req)?;
                self.submit_order(&agent, req, Side::Sell, tick)
            }
            Action::CancelOrder { order_id } => self.cancel_order(&agent, order_id),
            Action::Rumor {
                content,
                symbol,
                sentiment,
            } => self.publish_rumor(&agent, content, symbol.as_deref(), *sentiment, tick),
            Action::Message { to, content } => self.send_message(&agent, to, content, tick),
            Action::Ally { target } => self.propose_alliance(&agent, target, tick),
            Action::AllyAccept { target } => self.resolve_alliance(&agent, target, true, tick),
            Action::AllyReject { target } => self.resolve_alliance(&agent, target, false, tick),
            Action::Bribe { target, amount } => self.bribe(&agent, target, *amount, tick),
            Action::Whistleblow { target } => self.whistleblow(&agent, target, tick),
            Action::Flee => self.flee(&agent, tick),
        }
    }

    // ------------------------------------------------------------------
    // Trading
    // ------------------------------------------------------------------

    fn submit_order(
        &self,
        agent: &Agent,
        req: &TradeRequest,
        side: Side,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        if req.quantity <= 0 || req.quantity > self.config.max_order_quantity {
            bail!("Validation error: invalid quantity {}", req.quantity);
        }
        for price in [req.price, req.stop_price].into_iter().flatten() {
            if price <= 0.0 || price > self.config.max_order_price {
                bail!("Validation error: invalid price {price}");
            }
        }

        let symbol = req.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            bail!("Validation error: missing symbol");
        }
        if self.store.get_company(&symbol)?.is_none() {
            bail!("Validation error: unknown symbol {symbol}");
        }

        let order_type = if req.stop_price.is_some() {
            OrderType::Stop
        } else if req.price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };

        let order = Order::new_pending(
            &agent.id,
            symbol,
            side,
            order_type,
            req.quantity,
            req.price,
            req.stop_price,
            tick,
        );
        self.store.insert_order(&order)?;
        Ok((
            format!("{} order accepted", order_type.as_str()),
            Some(order.id),
        ))
    }

    fn check_short_margin(&self, agent: &Agent, req: &TradeRequest) -> Result<()> {
        let symbol = req.symbol.trim().to_uppercase();
        let reference = self
            .store
            .get_company(&symbol)?
            .map(|c| c.price)
            .or(req.price)
            .unwrap_or(0.0);
        let projected = agent.margin_used + reference * req.quantity.max(0) as f64;
        if projected > agent.margin_limit {
            bail!("Insufficient margin for short");
        }
        Ok(())
    }

    fn cancel_order(&self, agent: &Agent, order_id: &str) -> Result<(String, Option<String>)> {
        let Some(mut order) = self.store.get_order(order_id)? else {
            bail!("Order not found");
        };
        if order.agent_id != agent.id {
            bail!("Order not owned by participant");
        }
        if !order.status.can_cancel() {
            bail!("Order is {} and cannot be cancelled", order.status.as_str());
        }

        order.status = OrderStatus::Cancelled;
        self.store.update_order(&order)?;
        self.books.lock().cancel_resting(&order.symbol, order_id);
        Ok(("Order cancelled".to_string(), Some(order.id)))
    }

    // ------------------------------------------------------------------
    // Social / compliance
    // ------------------------------------------------------------------

    fn publish_rumor(
        &self,
        agent: &Agent,
        content: &str,
        symbol: Option<&str>,
        sentiment: Option<f64>,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        let cost = self.config.rumor_reputation_cost;
        if agent.reputation < cost {
            bail!("Insufficient reputation to spread rumor");
        }
        if content.trim().is_empty() {
            bail!("Validation error: empty rumor content");
        }
        self.store.adjust_reputation(&agent.id, -cost)?;

        let sentiment =
            sentiment.unwrap_or_else(|| self.rng.lock().gen_range(-0.6..0.6));
        let mut news = NewsItem::new(tick, content.trim(), NewsCategory::Rumor)
            .with_sentiment(sentiment)
            .with_agents(vec![agent.id.clone()]);
        if let Some(symbol) = symbol {
            news = news.with_symbols(vec![symbol.trim().to_uppercase()]);
        }
        self.store.insert_news(&news)?;
        Ok(("Rumor published".to_string(), None))
    }

    fn send_message(
        &self,
        agent: &Agent,
        to: &str,
        content: &str,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        if to == agent.id {
            bail!("Cannot message self");
        }
        let Some(target) = self.store.get_agent(to)? else {
            bail!("Target participant not found");
        };
        if !target.is_active() {
            bail!("Target participant is {}", target.status.as_str());
        }
        self.store.insert_message(&DirectMessage {
            id: Uuid::new_v4().to_string(),
            from_agent_id: agent.id.clone(),
            to_agent_id: target.id,
            tick,
            content: content.to_string(),
            created_at: Utc::now(),
        })?;
        Ok(("Message delivered".to_string(), None))
    }

    fn propose_alliance(
        &self,
        agent: &Agent,
        target_id: &str,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        if target_id == agent.id {
            bail!("Cannot ally with self");
        }
        let Some(target) = self.store.get_agent(target_id)? else {
            bail!("Target participant not found");
        };
        if !target.is_active() {
            bail!("Target participant is {}", target.status.as_str());
        }
        if let Some(existing) = self.store.alliance_between(&agent.id, &target.id)? {
            if existing.status != AllianceStatus::Dissolved {
                bail!("Alliance already {}", existing.status.as_str());
            }
        }

        self.store.upsert_alliance(&Alliance {
            id: Uuid::new_v4().to_string(),
            proposer_id: agent.id.clone(),
            target_id: target.id.clone(),
            status: AllianceStatus::Pending,
            tick_proposed: tick,
            tick_resolved: None,
        })?;
        self.notify(&agent.id, &target.id, "Alliance proposed", tick)?;
        Ok(("Alliance proposed".to_string(), None))
    }

    fn resolve_alliance(
        &self,
        agent: &Agent,
        proposer_id: &str,
        accept: bool,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        let Some(mut alliance) = self.store.alliance_between(&agent.id, proposer_id)? else {
            bail!("No alliance with that participant");
        };
        if alliance.status != AllianceStatus::Pending {
            bail!("Alliance is {}", alliance.status.as_str());
        }
        if alliance.target_id != agent.id {
            bail!("Only the proposed participant can respond");
        }

        alliance.status = if accept {
            AllianceStatus::Active
        } else {
            AllianceStatus::Dissolved
        };
        alliance.tick_resolved = Some(tick);
        self.store.upsert_alliance(&alliance)?;

        let note = if accept {
            "Alliance accepted"
        } else {
            "Alliance rejected"
        };
        self.notify(&agent.id, &alliance.proposer_id, note, tick)?;
        Ok((note.to_string(), None))
    }

    fn bribe(
        &self,
        agent: &Agent,
        target_id: &str,
        amount: f64,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        let Some(target) = self.store.get_agent(target_id)? else {
            bail!("Target participant not found");
        };
        if !target.is_active() || target.role != AgentRole::Sec {
            bail!("Target is not an active SEC agent");
        }
        if amount < self.config.bribe_min_amount {
            bail!(
                "Validation error: bribe below minimum {}",
                self.config.bribe_min_amount
            );
        }
        if agent.cash < amount {
            bail!("Insufficient cash for bribe");
        }

        self.store.update_agent_cash(&agent.id, agent.cash - amount)?;
        self.store
            .update_agent_cash(&target.id, target.cash + amount)?;

        // Bigger bribes to better-reputed regulators are likelier to surface.
        let detection = (0.10 + amount / 100_000.0 + target.reputation as f64 / 200.0)
            .clamp(0.05, 0.95);
        let detected = self.rng.lock().gen_bool(detection);
        if detected {
            self.store.insert_investigation(&Investigation::open(
                &agent.id,
                InvestigationType::Bribery,
                tick,
            ))?;
            Ok((
                "Bribe detected; bribery investigation opened".to_string(),
                None,
            ))
        } else {
            Ok(("Bribe delivered".to_string(), None))
        }
    }

    fn whistleblow(
        &self,
        agent: &Agent,
        target_id: &str,
        tick: u64,
    ) -> Result<(String, Option<String>)> {
        if target_id == agent.id {
            bail!("Cannot whistleblow on self");
        }
        if self.store.get_agent(target_id)?.is_none() {
            bail!("Target participant not found");
        }
        self.store.insert_investigation(&Investigation::open(
            target_id,
            InvestigationType::WhistleblowerReport,
            tick,
        ))?;
        self.store.adjust_reputation(&agent.id, 5)?;
        Ok(("Report filed; investigation opened".to_string(), None))
    }

    fn flee(&self, agent: &Agent, tick: u64) -> Result<(String, Option<String>)> {
        let open = self.store.open_investigations_for_agent(&agent.id)?;
        if open.is_empty() {
            bail!("Not under investigation");
        }

        // Money buys better escape routes.
        let escape = (0.20 + agent.cash.max(0.0) / 1_000_000.0).clamp(0.05, 0.90);
        if self.rng.lock().gen_bool(escape) {
            self.store
                .update_agent_status(&agent.id, crate::models::AgentStatus::Fled)?;
            Ok(("Escaped jurisdiction".to_string(), None))
        } else {
            self.store
                .update_agent_status(&agent.id, crate::models::AgentStatus::Imprisoned)?;
            for inv in open {
                self.store
                    .resolve_investigation(&inv.id, "convicted", tick)?;
            }
            bail!(
                "Captured while fleeing; sentenced to {} ticks",
                self.config.flee_sentence_ticks
            );
        }
    }

    fn notify(&self, from: &str, to: &str, content: &str, tick: u64) -> Result<()> {
        self.store.insert_message(&DirectMessage {
            id: Uuid::new_v4().to_string(),
            from_agent_id: from.to_string(),
            to_agent_id: to.to_string(),
            tick,
            content: content.to_string(),
            created_at: Utc::now(),
        })
    }
}
