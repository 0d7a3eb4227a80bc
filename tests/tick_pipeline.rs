//! End-to-end tick pipeline: webhook fan-out, action ingestion, matching,
//! and accounting over a real (in-memory) store with a scripted transport.

use async_trait::async_trait;
use marketsim_backend::config::Config;
use marketsim_backend::dispatch::{
    TransportError, TransportResponse, WebhookRequest, WebhookTransport,
};
use marketsim_backend::engine::TickEngine;
use marketsim_backend::live::{InProcessBus, PubSub};
use marketsim_backend::models::{Agent, Company, OrderStatus};
use marketsim_backend::store::SqliteStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Scripted per-URL responses; unknown URLs answer 200 with no actions.
struct RoutedTransport {
    routes: Mutex<HashMap<String, Vec<Result<TransportResponse, TransportError>>>>,
    requests: Mutex<Vec<WebhookRequest>>,
}

impl RoutedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, url: &str, responses: Vec<Result<TransportResponse, TransportError>>) {
        self.routes.lock().insert(url.to_string(), responses);
    }

    fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl WebhookTransport for RoutedTransport {
    async fn send(&self, req: WebhookRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().push(req.clone());
        let mut routes = self.routes.lock();
        if let Some(queue) = routes.get_mut(&req.url) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        Ok(TransportResponse {
            status: 200,
            body: "{}".to_string(),
        })
    }
}

fn ok(body: &str) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: 200,
        body: body.to_string(),
    })
}

fn status(code: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: code,
        body: String::new(),
    })
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.engine.events_enabled = false;
    config.engine.rng_seed = 7;
    config.webhook.max_retries = 3;
    config.webhook.backoff_base = std::time::Duration::from_millis(1);
    config.webhook.backoff_max = std::time::Duration::from_millis(4);
    config
}

fn seeded_store() -> SqliteStore {
    let store = SqliteStore::open(":memory:").unwrap();
    store
        .upsert_company(&Company {
            symbol: "AAPL".into(),
            name: "Apple".into(),
            sector: "tech".into(),
            price: 150.0,
            open_price: 150.0,
            high: 150.0,
            low: 150.0,
            volume: 0,
            outstanding_shares: 1_000_000,
            volatility: 0.0,
            beta: 0.0,
            momentum: 0.0,
        })
        .unwrap();
    store
}

fn hooked_agent(store: &SqliteStore, name: &str, cash: f64, url: &str) -> Agent {
    let agent = Agent::new(name, cash, 100_000.0).with_webhook(url, None);
    store.insert_agent(&agent).unwrap();
    agent
}

#[tokio::test]
async fn full_cycle_trade_between_two_participants() {
    let store = seeded_store();
    let transport = RoutedTransport::new();
    let bus: Arc<dyn PubSub> = Arc::new(InProcessBus::new(1024));

    let seller = hooked_agent(&store, "seller", 0.0, "http://seller.test/hook");
    let buyer = hooked_agent(&store, "buyer", 50_000.0, "http://buyer.test/hook");

    // Tick 1: the seller returns a SELL 100@150; the buyer idles.
    transport.script(
        "http://seller.test/hook",
        vec![ok(
            r#"{"actions":[{"type":"SELL","symbol":"AAPL","quantity":100,"price":150.0}]}"#,
        )],
    );
    // Tick 2: the buyer crosses it.
    transport.script(
        "http://buyer.test/hook",
        vec![
            ok("{}"),
            ok(r#"{"actions":[{"type":"BUY","symbol":"AAPL","quantity":100,"price":150.0}]}"#),
        ],
    );

    let mut engine = TickEngine::new(
        test_config(),
        store.clone(),
        transport.clone(),
        bus,
    )
    .unwrap();

    // Tick 1: dispatch, ingest the SELL as pending.
    engine.run_tick().await.unwrap();
    // Tick 2: the SELL rests; the buyer's BUY is ingested.
    engine.run_tick().await.unwrap();
    // Tick 3: the BUY matches the resting SELL.
    let outcome = engine.run_tick().await.unwrap();
    assert_eq!(outcome.trade_count, 1);

    let trades = store.trades_for_tick(3).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].quantity, 100);
    assert!((trades[0].price - 150.0).abs() < 1e-9);
    assert_eq!(trades[0].buyer_id, buyer.id);
    assert_eq!(trades[0].seller_id, seller.id);

    // Cash is zero-sum across the pair.
    let buyer_after = store.get_agent(&buyer.id).unwrap().unwrap();
    let seller_after = store.get_agent(&seller.id).unwrap().unwrap();
    assert!((buyer_after.cash - 35_000.0).abs() < 1e-6);
    assert!((seller_after.cash - 15_000.0).abs() < 1e-6);
    assert!(
        ((buyer_after.cash + seller_after.cash) - 50_000.0).abs() < 1e-6,
        "trade cash deltas must net to zero"
    );

    // Buyer holds 100 AAPL at 150; the seller's short is margin-tracked.
    let holding = store.get_holding(&buyer.id, "AAPL").unwrap().unwrap();
    assert_eq!(holding.quantity, 100);
    assert!((holding.average_cost - 150.0).abs() < 1e-9);
    let short = store.get_holding(&seller.id, "AAPL").unwrap().unwrap();
    assert_eq!(short.quantity, -100);
    assert_eq!(store.net_holdings_for_symbol("AAPL").unwrap(), 0);

    // Both orders terminal.
    for agent in [&buyer.id, &seller.id] {
        assert!(store.non_terminal_orders_for_agent(agent).unwrap().is_empty());
    }
}

#[tokio::test]
async fn webhook_retries_then_recovers_and_resets_failures() {
    let store = seeded_store();
    let transport = RoutedTransport::new();
    let bus: Arc<dyn PubSub> = Arc::new(InProcessBus::new(256));

    let agent = hooked_agent(&store, "flaky", 1_000.0, "http://flaky.test/hook");
    transport.script(
        "http://flaky.test/hook",
        vec![
            status(500),
            status(503),
            status(502),
            ok(r#"{"actions":[{"type":"BUY","symbol":"AAPL","quantity":100}]}"#),
        ],
    );

    let mut engine = TickEngine::new(
        test_config(),
        store.clone(),
        transport.clone(),
        bus,
    )
    .unwrap();
    engine.run_tick().await.unwrap();

    // Four attempts on one tick; the harvested action became an order.
    assert_eq!(transport.requests_for("http://flaky.test/hook"), 4);
    let orders = store.non_terminal_orders_for_agent(&agent.id).unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Pending);

    let after = store.get_agent(&agent.id).unwrap().unwrap();
    assert_eq!(after.webhook_failures, 0);
    assert!(after.last_webhook_success_at.is_some());
}

#[tokio::test]
async fn action_lists_are_capped_per_tick() {
    let store = seeded_store();
    let transport = RoutedTransport::new();
    let bus: Arc<dyn PubSub> = Arc::new(InProcessBus::new(256));

    let agent = hooked_agent(&store, "greedy", 1_000_000.0, "http://greedy.test/hook");
    let one = r#"{"type":"BUY","symbol":"AAPL","quantity":1,"price":150.0}"#;
    let body = format!(
        r#"{{"actions":[{}]}}"#,
        std::iter::repeat(one).take(25).collect::<Vec<_>>().join(",")
    );
    transport.script("http://greedy.test/hook", vec![ok(&body)]);

    let mut engine = TickEngine::new(
        test_config(),
        store.clone(),
        transport.clone(),
        bus,
    )
    .unwrap();
    engine.run_tick().await.unwrap();

    // Only the configured cap of 10 actions materialized.
    assert_eq!(
        store.non_terminal_orders_for_agent(&agent.id).unwrap().len(),
        10
    );
}

#[tokio::test]
async fn headers_identify_tick_and_recipient() {
    let store = seeded_store();
    let transport = RoutedTransport::new();
    let bus: Arc<dyn PubSub> = Arc::new(InProcessBus::new(256));

    let agent = hooked_agent(&store, "headered", 0.0, "http://headered.test/hook");
    let mut engine = TickEngine::new(
        test_config(),
        store.clone(),
        transport.clone(),
        bus,
    )
    .unwrap();
    engine.run_tick().await.unwrap();

    let requests = transport.requests.lock();
    let request = requests.iter().find(|r| r.url.contains("headered")).unwrap();
    let headers: HashMap<_, _> = request.headers.iter().cloned().collect();
    assert_eq!(headers.get("X-Tick").map(String::as_str), Some("1"));
    assert_eq!(headers.get("X-Agent").map(String::as_str), Some(agent.id.as_str()));
    // No secret registered, so no signature header.
    assert!(!headers.contains_key("X-Signature"));

    // The payload body is the documented shape.
    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["tick"], 1);
    assert!(body["portfolio"]["netWorth"].is_number());
    assert!(body["market"]["watchlist"].is_array());
    assert!(body["world"]["currentTick"].is_number());
    assert!(body["actionResults"].is_array());
}

#[tokio::test]
async fn limit_order_opens_within_one_tick_of_submission() {
    let store = seeded_store();
    let transport = RoutedTransport::new();
    let bus: Arc<dyn PubSub> = Arc::new(InProcessBus::new(256));

    let agent = hooked_agent(&store, "patient", 10_000.0, "http://patient.test/hook");
    transport.script(
        "http://patient.test/hook",
        vec![ok(
            r#"{"actions":[{"type":"BUY","symbol":"AAPL","quantity":10,"price":100.0}]}"#,
        )],
    );

    let mut engine = TickEngine::new(
        test_config(),
        store.clone(),
        transport.clone(),
        bus,
    )
    .unwrap();

    // Ingested at tick 1 as pending; open after the tick 2 matching pass.
    engine.run_tick().await.unwrap();
    let submitted = &store.non_terminal_orders_for_agent(&agent.id).unwrap()[0];
    assert_eq!(submitted.status, OrderStatus::Pending);
    assert_eq!(submitted.tick_submitted, 1);

    engine.run_tick().await.unwrap();
    let resting = &store.non_terminal_orders_for_agent(&agent.id).unwrap()[0];
    assert_eq!(resting.status, OrderStatus::Open);
}
