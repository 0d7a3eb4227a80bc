//! Environment-driven configuration for the engine, dispatcher, and server.

use std::env;
use std::time::Duration;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub engine: EngineConfig,
    pub webhook: WebhookConfig,
    pub circuit: CircuitConfig,
    pub actions: ActionConfig,
    pub pubsub_enabled: bool,
}

/// Tick engine and market-model knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub ticks_per_day: u64,
    pub market_always_open: bool,
    pub market_open_tick: u64,
    pub market_close_tick: u64,
    pub events_enabled: bool,
    pub event_chance: f64,
    pub price_floor: f64,
    /// Cap on |log(new/old)| per tick.
    pub price_move_cap: f64,
    pub allow_self_trading: bool,
    pub auto_recovery_enabled: bool,
    /// Seed for the simulation RNG; 0 means derive from entropy.
    pub rng_seed: u64,
}

/// Webhook dispatch knobs.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// Circuit breaker thresholds shared by all recipients.
#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub recovery_window: Duration,
    pub half_open_successes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_window: Duration::from_secs(60),
            half_open_successes: 2,
        }
    }
}

/// Action validation and policy knobs.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub per_tick_cap: usize,
    pub max_order_quantity: i64,
    pub max_order_price: f64,
    pub rumor_reputation_cost: i32,
    pub bribe_min_amount: f64,
    pub flee_sentence_ticks: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            per_tick_cap: 10,
            max_order_quantity: 1_000_000,
            max_order_price: 1_000_000.0,
            rumor_reputation_cost: 5,
            bribe_min_amount: 1_000.0,
            flee_sentence_ticks: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let port = env_u64("PORT", 8080) as u16;
        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./marketsim.db".to_string());

        let ticks_per_day = env_u64("TICKS_PER_DAY", 390).max(1);
        let engine = EngineConfig {
            tick_interval: Duration::from_millis(env_u64("TICK_INTERVAL_MS", 30_000).max(1)),
            ticks_per_day,
            market_always_open: env_bool("MARKET_ALWAYS_OPEN", true),
            market_open_tick: env_u64("MARKET_OPEN_TICK", 0),
            market_close_tick: env_u64("MARKET_CLOSE_TICK", ticks_per_day),
            events_enabled: env_bool("EVENTS_ENABLED", true),
            event_chance: env_f64("EVENT_CHANCE", 0.05).clamp(0.0, 1.0),
            price_floor: env_f64("PRICE_FLOOR", 0.01).max(0.0001),
            price_move_cap: env_f64("PRICE_MOVE_CAP", 0.10).max(0.0001),
            allow_self_trading: env_bool("ALLOW_SELF_TRADING", true),
            auto_recovery_enabled: env_bool("AUTO_RECOVERY_ENABLED", true),
            rng_seed: env_u64("SIM_RNG_SEED", 0),
        };

        let webhook = WebhookConfig {
            timeout: Duration::from_millis(env_u64("WEBHOOK_TIMEOUT_MS", 5_000).max(1)),
            max_retries: env_u64("WEBHOOK_MAX_RETRIES", 3) as u32,
            backoff_base: Duration::from_millis(env_u64("WEBHOOK_BACKOFF_BASE_MS", 250).max(1)),
            backoff_max: Duration::from_millis(env_u64("WEBHOOK_BACKOFF_MAX_MS", 10_000).max(1)),
        };

        let circuit = CircuitConfig {
            failure_threshold: env_u64("CIRCUIT_FAILURE_THRESHOLD", 5).max(1) as u32,
            recovery_window: Duration::from_millis(env_u64("CIRCUIT_RECOVERY_WINDOW_MS", 60_000)),
            half_open_successes: env_u64("CIRCUIT_HALF_OPEN_SUCCESSES", 2).max(1) as u32,
        };

        let actions = ActionConfig {
            per_tick_cap: env_u64("ACTIONS_PER_TICK_CAP", 10) as usize,
            max_order_quantity: env_i64("MAX_ORDER_QUANTITY", 1_000_000),
            max_order_price: env_f64("MAX_ORDER_PRICE", 1_000_000.0),
            rumor_reputation_cost: env_i64("RUMOR_REPUTATION_COST", 5) as i32,
            bribe_min_amount: env_f64("BRIBE_MIN_AMOUNT", 1_000.0),
            flee_sentence_ticks: env_u64("FLEE_SENTENCE_TICKS", 500),
        };

        Self {
            port,
            database_path,
            engine,
            webhook,
            circuit,
            actions,
            pubsub_enabled: env_bool("PUBSUB_ENABLED", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_path: ":memory:".to_string(),
            engine: EngineConfig::default(),
            webhook: WebhookConfig::default(),
            circuit: CircuitConfig::default(),
            actions: ActionConfig::default(),
            pubsub_enabled: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(30_000),
            ticks_per_day: 390,
            market_always_open: true,
            market_open_tick: 0,
            market_close_tick: 390,
            events_enabled: true,
            event_chance: 0.05,
            price_floor: 0.01,
            price_move_cap: 0.10,
            allow_self_trading: true,
            auto_recovery_enabled: true,
            rng_seed: 0,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Whether the market is open at `tick` given the configured hours.
    pub fn is_market_open(&self, tick: u64) -> bool {
        if self.market_always_open {
            return true;
        }
        let tick_of_day = tick % self.ticks_per_day;
        tick_of_day >= self.market_open_tick && tick_of_day < self.market_close_tick
    }
}
