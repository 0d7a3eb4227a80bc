//! Core domain model shared across the engine, store, dispatcher, and live bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reputation bounds for all participants.
pub const REPUTATION_MIN: i32 = 0;
pub const REPUTATION_MAX: i32 = 100;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign applied to holding deltas: buys add, sells remove.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
        }
    }
}

/// Order lifecycle status.
///
/// `pending` -> first matching pass -> `open` / `partial` / `filled`.
/// `filled`, `cancelled`, and `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Partial,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Partial => "partial",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::Partial
        )
    }
}

/// A trading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub agent_id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
    pub tick_submitted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_filled: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        agent_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        order_type: OrderType,
        quantity: i64,
        price: Option<f64>,
        stop_price: Option<f64>,
        tick: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            symbol: symbol.into(),
            side,
            order_type,
            quantity,
            price,
            stop_price,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            avg_fill_price: None,
            tick_submitted: tick,
            tick_filled: None,
            created_at: Utc::now(),
        }
    }

    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled_quantity
    }

    /// Apply a fill, updating filled quantity, weighted average fill price,
    /// and status. Returns false if the order cannot accept the fill.
    pub fn apply_fill(&mut self, fill_qty: i64, fill_price: f64, tick: u64) -> bool {
        if self.status.is_terminal() || fill_qty <= 0 || fill_qty > self.remaining() {
            return false;
        }

        let old_value = self.avg_fill_price.unwrap_or(0.0) * self.filled_quantity as f64;
        self.filled_quantity += fill_qty;
        self.avg_fill_price =
            Some((old_value + fill_price * fill_qty as f64) / self.filled_quantity as f64);

        if self.filled_quantity == self.quantity {
            self.status = OrderStatus::Filled;
            self.tick_filled = Some(tick);
        } else {
            self.status = OrderStatus::Partial;
        }
        true
    }
}

/// A matched trade. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub tick: u64,
    pub symbol: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub buyer_order_id: String,
    pub seller_order_id: String,
    pub price: f64,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity as f64
    }
}

/// A participant's position in one symbol. Exists iff quantity != 0;
/// negative quantity is a short.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub agent_id: String,
    pub symbol: String,
    pub quantity: i64,
    pub average_cost: f64,
}

impl Holding {
    /// Apply a signed quantity delta at `price`. Additive fills recompute the
    /// weighted average cost; reducing fills preserve it; a sign flip restarts
    /// the basis at the fill price. Returns the new quantity.
    pub fn apply_delta(&mut self, delta: i64, price: f64) -> i64 {
        let old_qty = self.quantity;
        let new_qty = old_qty + delta;

        if old_qty == 0 || old_qty.signum() == delta.signum() {
            // Opening or adding: weighted average over absolute sizes.
            let old_abs = old_qty.abs() as f64;
            let add_abs = delta.abs() as f64;
            self.average_cost =
                (self.average_cost * old_abs + price * add_abs) / (old_abs + add_abs);
        } else if new_qty != 0 && new_qty.signum() != old_qty.signum() {
            // Crossed through zero: the residual is a fresh position.
            self.average_cost = price;
        }
        // Plain reduction keeps the existing basis.

        self.quantity = new_qty;
        new_qty
    }
}

/// Participant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Bankrupt,
    Imprisoned,
    Fled,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Bankrupt => "bankrupt",
            AgentStatus::Imprisoned => "imprisoned",
            AgentStatus::Fled => "fled",
        }
    }
}

/// Participant role. SEC agents are valid bribe targets and run investigations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Trader,
    Sec,
}

/// A registered participant account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub cash: f64,
    pub margin_used: f64,
    pub margin_limit: f64,
    pub reputation: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Shared secret for webhook signing. Never logged, never serialized.
    #[serde(skip)]
    pub webhook_secret: Option<String>,
    /// WebSocket API key (`wss_<agentId>_<secret>`). Never serialized.
    #[serde(skip)]
    pub ws_api_key: Option<String>,
    pub webhook_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_webhook_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_webhook_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, cash: f64, margin_limit: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            role: AgentRole::Trader,
            status: AgentStatus::Active,
            cash,
            margin_used: 0.0,
            margin_limit,
            reputation: 50,
            webhook_url: None,
            webhook_secret: None,
            ws_api_key: None,
            webhook_failures: 0,
            last_webhook_error: None,
            last_webhook_success_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>, secret: Option<String>) -> Self {
        self.webhook_url = Some(url.into());
        self.webhook_secret = secret;
        self
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = role;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn margin_available(&self) -> f64 {
        (self.margin_limit - self.margin_used).max(0.0)
    }
}

/// Market regime driving macro behavior of the price model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Bull,
    Bear,
    Crash,
    Bubble,
    Normal,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Bull => "bull",
            Regime::Bear => "bear",
            Regime::Crash => "crash",
            Regime::Bubble => "bubble",
            Regime::Normal => "normal",
        }
    }

    /// Per-tick drift contribution of the regime, in log-return space.
    pub fn drift(&self) -> f64 {
        match self {
            Regime::Bull => 0.0004,
            Regime::Bear => -0.0004,
            Regime::Crash => -0.004,
            Regime::Bubble => 0.002,
            Regime::Normal => 0.0,
        }
    }
}

/// Authoritative simulation state advanced once per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldState {
    pub current_tick: u64,
    pub market_open: bool,
    pub interest_rate: f64,
    pub inflation_rate: f64,
    pub gdp_growth: f64,
    pub regime: Regime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            current_tick: 0,
            market_open: true,
            interest_rate: 0.05,
            inflation_rate: 0.02,
            gdp_growth: 0.02,
            regime: Regime::Normal,
            last_tick_at: None,
        }
    }
}

/// A listed company backing one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub symbol: String,
    pub name: String,
    pub sector: String,
    pub price: f64,
    pub open_price: f64,
    pub high: f64,
    pub low: f64,
    pub volume: i64,
    pub outstanding_shares: i64,
    pub volatility: f64,
    pub beta: f64,
    pub momentum: f64,
}

impl Company {
    pub fn market_cap(&self) -> f64 {
        self.price * self.outstanding_shares as f64
    }

    /// Fold a new tick price into the daily quote fields.
    pub fn record_price(&mut self, price: f64, traded_volume: i64) {
        self.price = price;
        self.high = self.high.max(price);
        self.low = if self.low == 0.0 {
            price
        } else {
            self.low.min(price)
        };
        self.volume += traded_volume;
    }
}

/// Quote shape delivered in webhook payloads and market broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockQuote {
    pub symbol: String,
    pub name: String,
    pub sector: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: i64,
    pub high: f64,
    pub low: f64,
    pub market_cap: f64,
}

impl StockQuote {
    pub fn from_company(c: &Company) -> Self {
        let change = c.price - c.open_price;
        let change_percent = if c.open_price > 0.0 {
            change / c.open_price * 100.0
        } else {
            0.0
        };
        Self {
            symbol: c.symbol.clone(),
            name: c.name.clone(),
            sector: c.sector.clone(),
            price: c.price,
            change,
            change_percent,
            volume: c.volume,
            high: c.high,
            low: c.low,
            market_cap: c.market_cap(),
        }
    }
}

/// An aggregate or sector index value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketIndex {
    pub name: String,
    pub value: f64,
    pub change: f64,
    pub change_percent: f64,
}

/// News categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsCategory {
    Earnings,
    Merger,
    Scandal,
    Regulatory,
    Market,
    Product,
    Analysis,
    Crime,
    Rumor,
    Company,
}

impl NewsCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsCategory::Earnings => "earnings",
            NewsCategory::Merger => "merger",
            NewsCategory::Scandal => "scandal",
            NewsCategory::Regulatory => "regulatory",
            NewsCategory::Market => "market",
            NewsCategory::Product => "product",
            NewsCategory::Analysis => "analysis",
            NewsCategory::Crime => "crime",
            NewsCategory::Rumor => "rumor",
            NewsCategory::Company => "company",
        }
    }
}

/// A news entry. Sentiment is in [-1, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub id: String,
    pub tick: u64,
    pub headline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub category: NewsCategory,
    pub sentiment: f64,
    pub agent_ids: Vec<String>,
    pub symbols: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub is_breaking: bool,
}

impl NewsItem {
    pub fn new(tick: u64, headline: impl Into<String>, category: NewsCategory) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tick,
            headline: headline.into(),
            content: None,
            category,
            sentiment: 0.0,
            agent_ids: Vec::new(),
            symbols: Vec::new(),
            created_at: Utc::now(),
            is_breaking: false,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_sentiment(mut self, sentiment: f64) -> Self {
        self.sentiment = sentiment.clamp(-1.0, 1.0);
        self
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn with_agents(mut self, agent_ids: Vec<String>) -> Self {
        self.agent_ids = agent_ids;
        self
    }

    pub fn breaking(mut self) -> Self {
        self.is_breaking = true;
        self
    }
}

/// A transient market event shaping prices while active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketEvent {
    pub id: String,
    pub tick_started: u64,
    pub duration_ticks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    pub symbols: Vec<String>,
    /// Signed per-tick log-return impact at full strength.
    pub impact: f64,
    pub headline: String,
    pub category: NewsCategory,
}

impl MarketEvent {
    /// Remaining impact at `tick`, decaying linearly to zero over the duration.
    pub fn impact_at(&self, tick: u64) -> f64 {
        let elapsed = tick.saturating_sub(self.tick_started);
        if elapsed >= self.duration_ticks {
            return 0.0;
        }
        let remaining = (self.duration_ticks - elapsed) as f64 / self.duration_ticks as f64;
        self.impact * remaining
    }

    pub fn is_expired(&self, tick: u64) -> bool {
        tick.saturating_sub(self.tick_started) >= self.duration_ticks
    }

    pub fn applies_to(&self, symbol: &str, sector: &str) -> bool {
        if self.symbols.iter().any(|s| s == symbol) {
            return true;
        }
        self.symbols.is_empty()
            && self
                .sector
                .as_deref()
                .map(|s| s == sector)
                .unwrap_or(false)
    }
}

/// Investigation types opened by compliance actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationType {
    Bribery,
    WhistleblowerReport,
    MarketManipulation,
}

impl InvestigationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationType::Bribery => "bribery",
            InvestigationType::WhistleblowerReport => "whistleblower_report",
            InvestigationType::MarketManipulation => "market_manipulation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestigationStatus {
    Open,
    Resolved,
}

/// An open or resolved investigation against a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investigation {
    pub id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub investigation_type: InvestigationType,
    pub status: InvestigationStatus,
    pub tick_opened: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_resolved: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Investigation {
    pub fn open(
        agent_id: impl Into<String>,
        investigation_type: InvestigationType,
        tick: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            investigation_type,
            status: InvestigationStatus::Open,
            tick_opened: tick,
            tick_resolved: None,
            verdict: None,
            created_at: Utc::now(),
        }
    }
}

/// A direct message between participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub tick: u64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Alliance lifecycle between two participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllianceStatus {
    Pending,
    Active,
    Dissolved,
}

impl AllianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllianceStatus::Pending => "pending",
            AllianceStatus::Active => "active",
            AllianceStatus::Dissolved => "dissolved",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alliance {
    pub id: String,
    pub proposer_id: String,
    pub target_id: String,
    pub status: AllianceStatus,
    pub tick_proposed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_resolved: Option<u64>,
}

/// Outcome of one processed action, delivered back to the participant in the
/// next tick's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action_type: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}
