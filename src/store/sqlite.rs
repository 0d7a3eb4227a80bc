//! SQLite-backed store for all persisted simulation state.
//!
//! - WAL mode for concurrent reads during tick writes
//! - One transaction per matched batch so trade/holding/cash writes land or
//!   fail together
//! - Best-effort action log (failures are logged, never fatal)

use crate::models::{
    Agent, AgentRole, AgentStatus, Alliance, AllianceStatus, Company, DirectMessage, Holding,
    Investigation, InvestigationStatus, InvestigationType, NewsCategory, NewsItem, Order,
    OrderStatus, OrderType, Side, Trade, WorldState, REPUTATION_MAX, REPUTATION_MIN,
};
use crate::store::money;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    cash TEXT NOT NULL,
    margin_used TEXT NOT NULL,
    margin_limit TEXT NOT NULL,
    reputation INTEGER NOT NULL,
    webhook_url TEXT,
    webhook_secret TEXT,
    ws_api_key TEXT,
    webhook_failures INTEGER NOT NULL DEFAULT 0,
    last_webhook_error TEXT,
    last_webhook_success_at TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS companies (
    symbol TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    sector TEXT NOT NULL,
    price TEXT NOT NULL,
    open_price TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    volume INTEGER NOT NULL DEFAULT 0,
    outstanding_shares INTEGER NOT NULL,
    volatility REAL NOT NULL,
    beta REAL NOT NULL,
    momentum REAL NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    price TEXT,
    stop_price TEXT,
    status TEXT NOT NULL,
    filled_quantity INTEGER NOT NULL DEFAULT 0,
    avg_fill_price TEXT,
    tick_submitted INTEGER NOT NULL,
    tick_filled INTEGER,
    created_at TEXT NOT NULL,
    seq INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_pending
    ON orders(symbol, seq) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_orders_agent
    ON orders(agent_id, status);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    tick INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    buyer_id TEXT NOT NULL,
    seller_id TEXT NOT NULL,
    buyer_order_id TEXT NOT NULL,
    seller_order_id TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    seq INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_tick ON trades(tick, seq);
CREATE INDEX IF NOT EXISTS idx_trades_buyer ON trades(buyer_id, seq DESC);
CREATE INDEX IF NOT EXISTS idx_trades_seller ON trades(seller_id, seq DESC);
CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol, seq DESC);

CREATE TABLE IF NOT EXISTS holdings (
    agent_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    average_cost TEXT NOT NULL,
    PRIMARY KEY (agent_id, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS news (
    id TEXT PRIMARY KEY,
    tick INTEGER NOT NULL,
    headline TEXT NOT NULL,
    content TEXT,
    category TEXT NOT NULL,
    sentiment REAL NOT NULL,
    agent_ids TEXT NOT NULL,
    symbols TEXT NOT NULL,
    is_breaking INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_news_tick ON news(tick DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    from_agent_id TEXT NOT NULL,
    to_agent_id TEXT NOT NULL,
    tick INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_agent_id, tick);

CREATE TABLE IF NOT EXISTS investigations (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    investigation_type TEXT NOT NULL,
    status TEXT NOT NULL,
    tick_opened INTEGER NOT NULL,
    tick_resolved INTEGER,
    verdict TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_investigations_agent
    ON investigations(agent_id, status);

CREATE TABLE IF NOT EXISTS alliances (
    id TEXT PRIMARY KEY,
    proposer_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    status TEXT NOT NULL,
    tick_proposed INTEGER NOT NULL,
    tick_resolved INTEGER
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS action_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tick INTEGER NOT NULL,
    agent_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    result TEXT NOT NULL,
    success INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Store handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Monotonic sequence for order/trade FIFO recovery.
    seq: Arc<Mutex<i64>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `:memory:` is accepted.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().context("Failed to open in-memory database")?
        } else {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
            .with_context(|| format!("Failed to open database at {path}"))?
        };

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;

        let max_seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM (SELECT seq FROM orders UNION ALL SELECT seq FROM trades)",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            seq: Arc::new(Mutex::new(max_seq)),
        })
    }

    fn next_seq(&self) -> i64 {
        let mut seq = self.seq.lock();
        *seq += 1;
        *seq
    }

    // ------------------------------------------------------------------
    // World state
    // ------------------------------------------------------------------

    pub fn load_world(&self) -> Result<WorldState> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'world_state'",
                [],
                |row| row.get(0),
            )
            .ok();
        match json {
            Some(json) => {
                serde_json::from_str(&json).context("Failed to decode persisted world state")
            }
            None => Ok(WorldState::default()),
        }
    }

    pub fn save_world(&self, world: &WorldState) -> Result<()> {
        let json = serde_json::to_string(world)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES ('world_state', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![json],
        )
        .context("Failed to persist world state")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (id, name, role, status, cash, margin_used, margin_limit,
                reputation, webhook_url, webhook_secret, ws_api_key, webhook_failures,
                last_webhook_error, last_webhook_success_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                agent.id,
                agent.name,
                role_str(agent.role),
                agent.status.as_str(),
                money::fmt(agent.cash),
                money::fmt(agent.margin_used),
                money::fmt(agent.margin_limit),
                agent.reputation,
                agent.webhook_url,
                agent.webhook_secret,
                agent.ws_api_key,
                agent.webhook_failures,
                agent.last_webhook_error,
                agent.last_webhook_success_at.map(|t| t.to_rfc3339()),
                agent.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert agent")?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM agents WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(agent_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn all_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM agents ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            agent_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active agents with a registered webhook endpoint, in registration order.
    pub fn webhook_recipients(&self) -> Result<Vec<Agent>> {
        Ok(self
            .all_agents()?
            .into_iter()
            .filter(|a| a.is_active() && a.webhook_url.is_some())
            .collect())
    }

    pub fn update_agent_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if n == 0 {
            return Err(anyhow!("Agent {id} not found"));
        }
        Ok(())
    }

    pub fn update_agent_cash(&self, id: &str, cash: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET cash = ?1 WHERE id = ?2",
            params![money::fmt(cash), id],
        )?;
        Ok(())
    }

    pub fn update_agent_margin(&self, id: &str, margin_used: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET margin_used = ?1 WHERE id = ?2",
            params![money::fmt(margin_used.max(0.0)), id],
        )?;
        Ok(())
    }

    /// Adjust reputation by `delta`, clamped to the configured bounds.
    /// Returns the new reputation.
    pub fn adjust_reputation(&self, id: &str, delta: i32) -> Result<i32> {
        let conn = self.conn.lock();
        let current: i32 = conn.query_row(
            "SELECT reputation FROM agents WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let updated = (current + delta).clamp(REPUTATION_MIN, REPUTATION_MAX);
        conn.execute(
            "UPDATE agents SET reputation = ?1 WHERE id = ?2",
            params![updated, id],
        )?;
        Ok(updated)
    }

    /// Terminal webhook success: clear the error, reset the failure counter.
    pub fn record_webhook_success(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET webhook_failures = 0, last_webhook_error = NULL,
                last_webhook_success_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Terminal webhook failure: bump the counter, stash the error.
    pub fn record_webhook_failure(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET webhook_failures = webhook_failures + 1,
                last_webhook_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Companies
    // ------------------------------------------------------------------

    pub fn upsert_company(&self, c: &Company) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO companies (symbol, name, sector, price, open_price, high, low,
                volume, outstanding_shares, volatility, beta, momentum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(symbol) DO UPDATE SET
                name = excluded.name, sector = excluded.sector, price = excluded.price,
                open_price = excluded.open_price, high = excluded.high, low = excluded.low,
                volume = excluded.volume, outstanding_shares = excluded.outstanding_shares,
                volatility = excluded.volatility, beta = excluded.beta,
                momentum = excluded.momentum",
            params![
                c.symbol,
                c.name,
                c.sector,
                money::fmt(c.price),
                money::fmt(c.open_price),
                money::fmt(c.high),
                money::fmt(c.low),
                c.volume,
                c.outstanding_shares,
                c.volatility,
                c.beta,
                c.momentum,
            ],
        )?;
        Ok(())
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM companies ORDER BY symbol")?;
        let rows = stmt.query_map([], |row| {
            company_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_company(&self, symbol: &str) -> Result<Option<Company>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM companies WHERE symbol = ?1")?;
        let mut rows = stmt.query(params![symbol])?;
        match rows.next()? {
            Some(row) => Ok(Some(company_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_company_price(&self, symbol: &str, price: f64, high: f64, low: f64, volume: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE companies SET price = ?1, high = ?2, low = ?3, volume = ?4 WHERE symbol = ?5",
            params![
                money::fmt(price),
                money::fmt(high),
                money::fmt(low),
                volume,
                symbol
            ],
        )?;
        Ok(())
    }

    pub fn has_companies(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub fn insert_order(&self, order: &Order) -> Result<()> {
        let seq = self.next_seq();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (id, agent_id, symbol, side, order_type, quantity, price,
                stop_price, status, filled_quantity, avg_fill_price, tick_submitted,
                tick_filled, created_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                order.id,
                order.agent_id,
                order.symbol,
                order.side.as_str(),
                order.order_type.as_str(),
                order.quantity,
                order.price.map(money::fmt),
                order.stop_price.map(money::fmt),
                order.status.as_str(),
                order.filled_quantity,
                order.avg_fill_price.map(money::fmt),
                order.tick_submitted,
                order.tick_filled,
                order.created_at.to_rfc3339(),
                seq,
            ],
        )
        .context("Failed to insert order")?;
        Ok(())
    }

    pub fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM orders WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(order_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Symbols that have at least one pending order, in first-submission order.
    pub fn symbols_with_pending_orders(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol FROM orders WHERE status = 'pending'
             GROUP BY symbol ORDER BY MIN(seq)",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Pending orders for one symbol in FIFO submission order.
    pub fn pending_orders_for_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM orders WHERE status = 'pending' AND symbol = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![symbol], |row| {
            order_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Symbols with orders the matching pass must consider: pending orders
    /// plus market orders still working off a partial fill.
    pub fn symbols_with_matchable_orders(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol FROM orders
             WHERE status = 'pending' OR (status = 'partial' AND order_type = 'MARKET')
             GROUP BY symbol ORDER BY MIN(seq)",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The matchable set for one symbol in FIFO submission order.
    pub fn matchable_orders_for_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM orders WHERE symbol = ?1
             AND (status = 'pending' OR (status = 'partial' AND order_type = 'MARKET'))
             ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![symbol], |row| {
            order_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Resting (open/partial) orders for one symbol in FIFO order, used to
    /// rebuild books after a restart.
    pub fn resting_orders_for_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM orders WHERE symbol = ?1 AND status IN ('open', 'partial')
             ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![symbol], |row| {
            order_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn symbols_with_resting_orders(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT symbol FROM orders WHERE status IN ('open', 'partial')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Non-terminal orders for a participant (payload `orders` section).
    pub fn non_terminal_orders_for_agent(&self, agent_id: &str) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM orders WHERE agent_id = ?1
             AND status IN ('pending', 'open', 'partial') ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            order_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE orders SET status = ?1, filled_quantity = ?2, avg_fill_price = ?3,
                tick_filled = ?4 WHERE id = ?5",
            params![
                order.status.as_str(),
                order.filled_quantity,
                order.avg_fill_price.map(money::fmt),
                order.tick_filled,
                order.id,
            ],
        )?;
        if n == 0 {
            return Err(anyhow!("Order {} not found", order.id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trades, holdings, cash: the critical per-tick batch
    // ------------------------------------------------------------------

    /// Persist one symbol's match results atomically: trades, order updates,
    /// holding deltas, cash deltas, and short-margin adjustments. A failure
    /// anywhere rolls the whole batch back.
    pub fn apply_match_batch(&self, trades: &[Trade], orders: &[Order]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin match batch")?;

        for order in orders {
            let n = tx.execute(
                "UPDATE orders SET status = ?1, filled_quantity = ?2, avg_fill_price = ?3,
                    tick_filled = ?4 WHERE id = ?5",
                params![
                    order.status.as_str(),
                    order.filled_quantity,
                    order.avg_fill_price.map(money::fmt),
                    order.tick_filled,
                    order.id,
                ],
            )?;
            if n == 0 {
                return Err(anyhow!("Order {} missing during match batch", order.id));
            }
        }

        for trade in trades {
            let seq = {
                let mut seq = self.seq.lock();
                *seq += 1;
                *seq
            };
            tx.execute(
                "INSERT INTO trades (id, tick, symbol, buyer_id, seller_id, buyer_order_id,
                    seller_order_id, price, quantity, created_at, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    trade.id,
                    trade.tick,
                    trade.symbol,
                    trade.buyer_id,
                    trade.seller_id,
                    trade.buyer_order_id,
                    trade.seller_order_id,
                    money::fmt(trade.price),
                    trade.quantity,
                    trade.created_at.to_rfc3339(),
                    seq,
                ],
            )?;

            apply_cash_delta(&tx, &trade.buyer_id, -trade.notional())?;
            apply_cash_delta(&tx, &trade.seller_id, trade.notional())?;
            apply_holding_delta(&tx, &trade.buyer_id, &trade.symbol, trade.quantity, trade.price)?;
            apply_holding_delta(
                &tx,
                &trade.seller_id,
                &trade.symbol,
                -trade.quantity,
                trade.price,
            )?;
        }

        tx.commit().context("Failed to commit match batch")?;
        Ok(())
    }

    pub fn trades_for_tick(&self, tick: u64) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM trades WHERE tick = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![tick], |row| {
            trade_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn recent_trades_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM trades WHERE buyer_id = ?1 OR seller_id = ?1
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit as i64], |row| {
            trade_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Net signed traded quantity for a symbol since genesis (buys count once;
    /// each trade moves quantity from seller to buyer).
    pub fn net_holdings_for_symbol(&self, symbol: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(quantity), 0) FROM holdings WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    // ------------------------------------------------------------------
    // Holdings
    // ------------------------------------------------------------------

    pub fn get_holding(&self, agent_id: &str, symbol: &str) -> Result<Option<Holding>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM holdings WHERE agent_id = ?1 AND symbol = ?2")?;
        let mut rows = stmt.query(params![agent_id, symbol])?;
        match rows.next()? {
            Some(row) => Ok(Some(holding_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn holdings_for_agent(&self, agent_id: &str) -> Result<Vec<Holding>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM holdings WHERE agent_id = ?1 ORDER BY symbol")?;
        let rows = stmt.query_map(params![agent_id], |row| {
            holding_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // News
    // ------------------------------------------------------------------

    pub fn insert_news(&self, item: &NewsItem) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO news (id, tick, headline, content, category, sentiment, agent_ids,
                symbols, is_breaking, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                item.id,
                item.tick,
                item.headline,
                item.content,
                item.category.as_str(),
                item.sentiment,
                serde_json::to_string(&item.agent_ids)?,
                serde_json::to_string(&item.symbols)?,
                item.is_breaking as i64,
                item.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn news_since(&self, tick: u64, limit: usize) -> Result<Vec<NewsItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM news WHERE tick >= ?1 ORDER BY tick DESC, created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tick, limit as i64], |row| {
            news_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn insert_message(&self, msg: &DirectMessage) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (id, from_agent_id, to_agent_id, tick, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                msg.id,
                msg.from_agent_id,
                msg.to_agent_id,
                msg.tick,
                msg.content,
                msg.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn messages_for_agent_since(&self, agent_id: &str, tick: u64) -> Result<Vec<DirectMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM messages WHERE to_agent_id = ?1 AND tick >= ?2 ORDER BY tick",
        )?;
        let rows = stmt.query_map(params![agent_id, tick], |row| {
            message_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Investigations
    // ------------------------------------------------------------------

    pub fn insert_investigation(&self, inv: &Investigation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO investigations (id, agent_id, investigation_type, status, tick_opened,
                tick_resolved, verdict, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                inv.id,
                inv.agent_id,
                inv.investigation_type.as_str(),
                investigation_status_str(inv.status),
                inv.tick_opened,
                inv.tick_resolved,
                inv.verdict,
                inv.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn open_investigations_for_agent(&self, agent_id: &str) -> Result<Vec<Investigation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM investigations WHERE agent_id = ?1 AND status = 'open'
             ORDER BY tick_opened",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            investigation_from_row(row)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn resolve_investigation(&self, id: &str, verdict: &str, tick: u64) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE investigations SET status = 'resolved', verdict = ?1, tick_resolved = ?2
             WHERE id = ?3 AND status = 'open'",
            params![verdict, tick, id],
        )?;
        if n == 0 {
            return Err(anyhow!("Investigation {id} not open"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Alliances
    // ------------------------------------------------------------------

    pub fn upsert_alliance(&self, alliance: &Alliance) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alliances (id, proposer_id, target_id, status, tick_proposed, tick_resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                tick_resolved = excluded.tick_resolved",
            params![
                alliance.id,
                alliance.proposer_id,
                alliance.target_id,
                alliance.status.as_str(),
                alliance.tick_proposed,
                alliance.tick_resolved,
            ],
        )?;
        Ok(())
    }

    /// The most recent alliance record between two participants, either
    /// direction.
    pub fn alliance_between(&self, a: &str, b: &str) -> Result<Option<Alliance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM alliances
             WHERE (proposer_id = ?1 AND target_id = ?2) OR (proposer_id = ?2 AND target_id = ?1)
             ORDER BY tick_proposed DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![a, b])?;
        match rows.next()? {
            Some(row) => Ok(Some(alliance_from_row(row)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Action log (best-effort)
    // ------------------------------------------------------------------

    /// Append to the action log. Failures are swallowed with a warning so the
    /// tick never blocks on telemetry.
    pub fn append_action_log(
        &self,
        tick: u64,
        agent_id: &str,
        action_type: &str,
        payload: &str,
        result: &str,
        success: bool,
    ) {
        let conn = self.conn.lock();
        let outcome = conn.execute(
            "INSERT INTO action_log (tick, agent_id, action_type, payload, result, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tick,
                agent_id,
                action_type,
                payload,
                result,
                success as i64,
                Utc::now().to_rfc3339(),
            ],
        );
        if let Err(e) = outcome {
            warn!(agent = agent_id, error = %e, "action log write failed");
        }
    }

    pub fn action_log_count(&self, agent_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM action_log WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?)
    }
}

// ----------------------------------------------------------------------
// Row decoding / inner helpers
// ----------------------------------------------------------------------

fn apply_cash_delta(tx: &rusqlite::Transaction<'_>, agent_id: &str, delta: f64) -> Result<()> {
    let cash_text: String = tx.query_row(
        "SELECT cash FROM agents WHERE id = ?1",
        params![agent_id],
        |row| row.get(0),
    )?;
    let updated = money::parse(&cash_text) + delta;
    tx.execute(
        "UPDATE agents SET cash = ?1 WHERE id = ?2",
        params![money::fmt(updated), agent_id],
    )?;
    Ok(())
}

/// Mutate one holding row inside the batch transaction, deleting it when the
/// quantity returns to zero and keeping short margin in sync.
fn apply_holding_delta(
    tx: &rusqlite::Transaction<'_>,
    agent_id: &str,
    symbol: &str,
    delta: i64,
    price: f64,
) -> Result<()> {
    let existing: Option<(i64, String)> = tx
        .query_row(
            "SELECT quantity, average_cost FROM holdings WHERE agent_id = ?1 AND symbol = ?2",
            params![agent_id, symbol],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();

    let mut holding = Holding {
        agent_id: agent_id.to_string(),
        symbol: symbol.to_string(),
        quantity: existing.as_ref().map(|(q, _)| *q).unwrap_or(0),
        average_cost: existing
            .as_ref()
            .map(|(_, c)| money::parse(c))
            .unwrap_or(0.0),
    };
    let old_short_value = short_value(holding.quantity, holding.average_cost);
    let new_qty = holding.apply_delta(delta, price);
    let new_short_value = short_value(holding.quantity, holding.average_cost);

    if new_qty == 0 {
        tx.execute(
            "DELETE FROM holdings WHERE agent_id = ?1 AND symbol = ?2",
            params![agent_id, symbol],
        )?;
    } else {
        tx.execute(
            "INSERT INTO holdings (agent_id, symbol, quantity, average_cost)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id, symbol) DO UPDATE SET
                quantity = excluded.quantity, average_cost = excluded.average_cost",
            params![agent_id, symbol, new_qty, money::fmt(holding.average_cost)],
        )?;
    }

    let margin_delta = new_short_value - old_short_value;
    if margin_delta != 0.0 {
        let margin_text: String = tx.query_row(
            "SELECT margin_used FROM agents WHERE id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        let updated = (money::parse(&margin_text) + margin_delta).max(0.0);
        tx.execute(
            "UPDATE agents SET margin_used = ?1 WHERE id = ?2",
            params![money::fmt(updated), agent_id],
        )?;
    }

    Ok(())
}

fn short_value(quantity: i64, average_cost: f64) -> f64 {
    if quantity < 0 {
        (-quantity) as f64 * average_cost
    } else {
        0.0
    }
}

fn role_str(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Trader => "trader",
        AgentRole::Sec => "sec",
    }
}

fn parse_role(text: &str) -> AgentRole {
    match text {
        "sec" => AgentRole::Sec,
        _ => AgentRole::Trader,
    }
}

fn parse_agent_status(text: &str) -> AgentStatus {
    match text {
        "bankrupt" => AgentStatus::Bankrupt,
        "imprisoned" => AgentStatus::Imprisoned,
        "fled" => AgentStatus::Fled,
        _ => AgentStatus::Active,
    }
}

fn parse_side(text: &str) -> Result<Side> {
    match text {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(anyhow!("Unknown side {other}")),
    }
}

fn parse_order_type(text: &str) -> Result<OrderType> {
    match text {
        "MARKET" => Ok(OrderType::Market),
        "LIMIT" => Ok(OrderType::Limit),
        "STOP" => Ok(OrderType::Stop),
        other => Err(anyhow!("Unknown order type {other}")),
    }
}

fn parse_order_status(text: &str) -> Result<OrderStatus> {
    match text {
        "pending" => Ok(OrderStatus::Pending),
        "open" => Ok(OrderStatus::Open),
        "filled" => Ok(OrderStatus::Filled),
        "partial" => Ok(OrderStatus::Partial),
        "cancelled" => Ok(OrderStatus::Cancelled),
        "rejected" => Ok(OrderStatus::Rejected),
        other => Err(anyhow!("Unknown order status {other}")),
    }
}

fn parse_news_category(text: &str) -> NewsCategory {
    match text {
        "earnings" => NewsCategory::Earnings,
        "merger" => NewsCategory::Merger,
        "scandal" => NewsCategory::Scandal,
        "regulatory" => NewsCategory::Regulatory,
        "product" => NewsCategory::Product,
        "analysis" => NewsCategory::Analysis,
        "crime" => NewsCategory::Crime,
        "rumor" => NewsCategory::Rumor,
        "company" => NewsCategory::Company,
        _ => NewsCategory::Market,
    }
}

fn parse_investigation_type(text: &str) -> InvestigationType {
    match text {
        "bribery" => InvestigationType::Bribery,
        "whistleblower_report" => InvestigationType::WhistleblowerReport,
        _ => InvestigationType::MarketManipulation,
    }
}

fn investigation_status_str(status: InvestigationStatus) -> &'static str {
    match status {
        InvestigationStatus::Open => "open",
        InvestigationStatus::Resolved => "resolved",
    }
}

fn parse_alliance_status(text: &str) -> AllianceStatus {
    match text {
        "active" => AllianceStatus::Active,
        "dissolved" => AllianceStatus::Dissolved,
        _ => AllianceStatus::Pending,
    }
}

fn parse_timestamp(text: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn agent_from_row(row: &Row<'_>) -> Result<Agent> {
    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        role: parse_role(&row.get::<_, String>("role")?),
        status: parse_agent_status(&row.get::<_, String>("status")?),
        cash: money::parse(&row.get::<_, String>("cash")?),
        margin_used: money::parse(&row.get::<_, String>("margin_used")?),
        margin_limit: money::parse(&row.get::<_, String>("margin_limit")?),
        reputation: row.get("reputation")?,
        webhook_url: row.get("webhook_url")?,
        webhook_secret: row.get("webhook_secret")?,
        ws_api_key: row.get("ws_api_key")?,
        webhook_failures: row.get("webhook_failures")?,
        last_webhook_error: row.get("last_webhook_error")?,
        last_webhook_success_at: row
            .get::<_, Option<String>>("last_webhook_success_at")?
            .map(parse_timestamp),
        created_at: parse_timestamp(row.get::<_, String>("created_at")?),
    })
}

fn company_from_row(row: &Row<'_>) -> Result<Company> {
    Ok(Company {
        symbol: row.get("symbol")?,
        name: row.get("name")?,
        sector: row.get("sector")?,
        price: money::parse(&row.get::<_, String>("price")?),
        open_price: money::parse(&row.get::<_, String>("open_price")?),
        high: money::parse(&row.get::<_, String>("high")?),
        low: money::parse(&row.get::<_, String>("low")?),
        volume: row.get("volume")?,
        outstanding_shares: row.get("outstanding_shares")?,
        volatility: row.get("volatility")?,
        beta: row.get("beta")?,
        momentum: row.get("momentum")?,
    })
}

fn order_from_row(row: &Row<'_>) -> Result<Order> {
    Ok(Order {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        symbol: row.get("symbol")?,
        side: parse_side(&row.get::<_, String>("side")?)?,
        order_type: parse_order_type(&row.get::<_, String>("order_type")?)?,
        quantity: row.get("quantity")?,
        price: row
            .get::<_, Option<String>>("price")?
            .map(|p| money::parse(&p)),
        stop_price: row
            .get::<_, Option<String>>("stop_price")?
            .map(|p| money::parse(&p)),
        status: parse_order_status(&row.get::<_, String>("status")?)?,
        filled_quantity: row.get("filled_quantity")?,
        avg_fill_price: row
            .get::<_, Option<String>>("avg_fill_price")?
            .map(|p| money::parse(&p)),
        tick_submitted: row.get::<_, i64>("tick_submitted")? as u64,
        tick_filled: row.get::<_, Option<i64>>("tick_filled")?.map(|t| t as u64),
        created_at: parse_timestamp(row.get::<_, String>("created_at")?),
    })
}

fn trade_from_row(row: &Row<'_>) -> Result<Trade> {
    Ok(Trade {
        id: row.get("id")?,
        tick: row.get::<_, i64>("tick")? as u64,
        symbol: row.get("symbol")?,
        buyer_id: row.get("buyer_id")?,
        seller_id: row.get("seller_id")?,
        buyer_order_id: row.get("buyer_order_id")?,
        seller_order_id: row.get("seller_order_id")?,
        price: money::parse(&row.get::<_, String>("price")?),
        quantity: row.get("quantity")?,
        created_at: parse_timestamp(row.get::<_, String>("created_at")?),
    })
}

fn holding_from_row(row: &Row<'_>) -> Result<Holding> {
    Ok(Holding {
        agent_id: row.get("agent_id")?,
        symbol: row.get("symbol")?,
        quantity: row.get("quantity")?,
        average_cost: money::parse(&row.get::<_, String>("average_cost")?),
    })
}

fn news_from_row(row: &Row<'_>) -> Result<NewsItem> {
    Ok(NewsItem {
        id: row.get("id")?,
        tick: row.get::<_, i64>("tick")? as u64,
        headline: row.get("headline")?,
        content: row.get("content")?,
        category: parse_news_category(&row.get::<_, String>("category")?),
        sentiment: row.get("sentiment")?,
        agent_ids: serde_json::from_str(&row.get::<_, String>("agent_ids")?).unwrap_or_default(),
        symbols: serde_json::from_str(&row.get::<_, String>("symbols")?).unwrap_or_default(),
        created_at: parse_timestamp(row.get::<_, String>("created_at")?),
        is_breaking: row.get::<_, i64>("is_breaking")? != 0,
    })
}

fn message_from_row(row: &Row<'_>) -> Result<DirectMessage> {
    Ok(DirectMessage {
        id: row.get("id")?,
        from_agent_id: row.get("from_agent_id")?,
        to_agent_id: row.get("to_agent_id")?,
        tick: row.get::<_, i64>("tick")? as u64,
        content: row.get("content")?,
        created_at: parse_timestamp(row.get::<_, String>("created_at")?),
    })
}

fn investigation_from_row(row: &Row<'_>) -> Result<Investigation> {
    let status = match row.get::<_, String>("status")?.as_str() {
        "resolved" => InvestigationStatus::Resolved,
        _ => InvestigationStatus::Open,
    };
    Ok(Investigation {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        investigation_type: parse_investigation_type(
            &row.get::<_, String>("investigation_type")?,
        ),
        status,
        tick_opened: row.get::<_, i64>("tick_opened")? as u64,
        tick_resolved: row
            .get::<_, Option<i64>>("tick_resolved")?
            .map(|t| t as u64),
        verdict: row.get("verdict")?,
        created_at: parse_timestamp(row.get::<_, String>("created_at")?),
    })
}

fn alliance_from_row(row: &Row<'_>) -> Result<Alliance> {
    Ok(Alliance {
        id: row.get("id")?,
        proposer_id: row.get("proposer_id")?,
        target_id: row.get("target_id")?,
        status: parse_alliance_status(&row.get::<_, String>("status")?),
        tick_proposed: row.get::<_, i64>("tick_proposed")? as u64,
        tick_resolved: row
            .get::<_, Option<i64>>("tick_resolved")?
            .map(|t| t as u64),
    })
}

/// Build a new agent id + uuid pair for tests and seeding.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderType, Side, Trade};

    fn store() -> SqliteStore {
        SqliteStore::open(":memory:").expect("in-memory store")
    }

    fn seeded_agent(store: &SqliteStore, name: &str, cash: f64) -> Agent {
        let agent = Agent::new(name, cash, 10_000.0);
        store.insert_agent(&agent).unwrap();
        agent
    }

    fn trade_between(
        buyer: &Agent,
        seller: &Agent,
        symbol: &str,
        price: f64,
        quantity: i64,
        tick: u64,
    ) -> Trade {
        Trade {
            id: new_id(),
            tick,
            symbol: symbol.into(),
            buyer_id: buyer.id.clone(),
            seller_id: seller.id.clone(),
            buyer_order_id: new_id(),
            seller_order_id: new_id(),
            price,
            quantity,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn world_state_round_trips() {
        let store = store();
        let mut world = store.load_world().unwrap();
        assert_eq!(world.current_tick, 0);

        world.current_tick = 42;
        world.market_open = false;
        store.save_world(&world).unwrap();

        let loaded = store.load_world().unwrap();
        assert_eq!(loaded.current_tick, 42);
        assert!(!loaded.market_open);
    }

    #[test]
    fn match_batch_moves_cash_and_holdings_atomically() {
        let store = store();
        let a = seeded_agent(&store, "a", 100_000.0);
        let b = seeded_agent(&store, "b", 0.0);

        // b buys 100 @ 100 from a: a is short 100, b long 100.
        let first = trade_between(&b, &a, "AAPL", 100.0, 100, 0);
        store.apply_match_batch(&[first], &[]).unwrap();

        // a buys the 100 back @ 150, closing both positions.
        let second = trade_between(&a, &b, "AAPL", 150.0, 100, 1);
        store.apply_match_batch(&[second], &[]).unwrap();

        let a_after = store.get_agent(&a.id).unwrap().unwrap();
        let b_after = store.get_agent(&b.id).unwrap().unwrap();
        // a: +10000 from the sale, -15000 on the buyback.
        assert!((a_after.cash - 95_000.0).abs() < 1e-6);
        // b: -10000 then +15000.
        assert!((b_after.cash - 5_000.0).abs() < 1e-6);
        // Cash is conserved across the pair.
        assert!(((a_after.cash + b_after.cash) - 100_000.0).abs() < 1e-6);

        // The round trip closed out both holdings.
        assert!(store.get_holding(&a.id, "AAPL").unwrap().is_none());
        assert!(store.get_holding(&b.id, "AAPL").unwrap().is_none());
        assert_eq!(store.net_holdings_for_symbol("AAPL").unwrap(), 0);
    }

    #[test]
    fn holding_deleted_when_quantity_returns_to_zero() {
        let store = store();
        let buyer = seeded_agent(&store, "b", 50_000.0);
        let seller = seeded_agent(&store, "s", 50_000.0);

        let t1 = trade_between(&buyer, &seller, "TSLA", 200.0, 10, 1);
        store.apply_match_batch(&[t1], &[]).unwrap();
        let holding = store.get_holding(&buyer.id, "TSLA").unwrap().unwrap();
        assert_eq!(holding.quantity, 10);
        assert!((holding.average_cost - 200.0).abs() < 1e-9);

        let t2 = trade_between(&seller, &buyer, "TSLA", 210.0, 10, 2);
        store.apply_match_batch(&[t2], &[]).unwrap();
        assert!(store.get_holding(&buyer.id, "TSLA").unwrap().is_none());
    }

    #[test]
    fn short_position_tracks_margin_used() {
        let store = store();
        let shorter = seeded_agent(&store, "short", 10_000.0);
        let buyer = seeded_agent(&store, "long", 10_000.0);

        let t = trade_between(&buyer, &shorter, "NVDA", 50.0, 20, 1);
        store.apply_match_batch(&[t], &[]).unwrap();

        let after = store.get_agent(&shorter.id).unwrap().unwrap();
        assert!((after.margin_used - 1_000.0).abs() < 1e-6);
        let holding = store.get_holding(&shorter.id, "NVDA").unwrap().unwrap();
        assert_eq!(holding.quantity, -20);

        // Cover releases the margin.
        let cover = trade_between(&shorter, &buyer, "NVDA", 45.0, 20, 2);
        store.apply_match_batch(&[cover], &[]).unwrap();
        let covered = store.get_agent(&shorter.id).unwrap().unwrap();
        assert!(covered.margin_used.abs() < 1e-6);
    }

    #[test]
    fn pending_orders_keep_fifo_order() {
        let store = store();
        let agent = seeded_agent(&store, "a", 1_000.0);
        for i in 0..3 {
            let order = Order::new_pending(
                &agent.id,
                "AAPL",
                Side::Buy,
                OrderType::Limit,
                10 + i,
                Some(100.0),
                None,
                0,
            );
            store.insert_order(&order).unwrap();
        }
        let pending = store.pending_orders_for_symbol("AAPL").unwrap();
        let quantities: Vec<i64> = pending.iter().map(|o| o.quantity).collect();
        assert_eq!(quantities, vec![10, 11, 12]);
        assert_eq!(
            store.symbols_with_pending_orders().unwrap(),
            vec!["AAPL".to_string()]
        );
    }

    #[test]
    fn webhook_accounting_resets_on_success() {
        let store = store();
        let agent = seeded_agent(&store, "hooked", 0.0);

        store.record_webhook_failure(&agent.id, "timeout").unwrap();
        store.record_webhook_failure(&agent.id, "500").unwrap();
        let failing = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(failing.webhook_failures, 2);
        assert_eq!(failing.last_webhook_error.as_deref(), Some("500"));

        store.record_webhook_success(&agent.id, Utc::now()).unwrap();
        let ok = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(ok.webhook_failures, 0);
        assert!(ok.last_webhook_error.is_none());
        assert!(ok.last_webhook_success_at.is_some());
    }

    #[test]
    fn reputation_is_clamped() {
        let store = store();
        let agent = seeded_agent(&store, "rep", 0.0);
        assert_eq!(store.adjust_reputation(&agent.id, 1000).unwrap(), 100);
        assert_eq!(store.adjust_reputation(&agent.id, -1000).unwrap(), 0);
    }

    #[test]
    fn action_log_failures_do_not_propagate() {
        let store = store();
        // No agent row required; log is free-form and must never error out.
        store.append_action_log(1, "ghost", "BUY", "{}", "ok", true);
        assert_eq!(store.action_log_count("ghost").unwrap(), 1);
    }
}
