//! Process entry: configuration, store, tick engine, and the live server.

use anyhow::{Context, Result};
use marketsim_backend::config::Config;
use marketsim_backend::dispatch::HttpTransport;
use marketsim_backend::engine::TickEngine;
use marketsim_backend::live::{BroadcastHub, InProcessBus, LiveState, PubSub};
use marketsim_backend::server::{router, AppState};
use marketsim_backend::store::{seed::seed_default_companies, SqliteStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketsim_backend=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();
    info!(port = config.port, db = %config.database_path, "starting marketsim");

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open store at {}", config.database_path))?;
    let seeded = seed_default_companies(&store)?;
    if seeded > 0 {
        info!(seeded, "fresh market seeded");
    }

    if config.pubsub_enabled {
        // The shared pub/sub adapter is a deployment add-on; a single node
        // serves everything through the in-process bus.
        warn!("PUBSUB_ENABLED set but no shared adapter configured; using in-process bus");
    }
    let bus: Arc<dyn PubSub> = Arc::new(InProcessBus::new(4096));

    let mut engine = TickEngine::new(
        config.clone(),
        store.clone(),
        Arc::new(HttpTransport::new()),
        Arc::clone(&bus),
    )?;
    engine.restore().context("Failed to restore engine state")?;

    let live = LiveState::new(
        Arc::new(BroadcastHub::new()),
        Arc::clone(&bus),
        store.clone(),
        engine.current_tick_handle(),
    );
    let state = AppState {
        store,
        live,
        prices: engine.price_cache(),
        circuits: engine.circuit_registry(),
    };

    tokio::spawn(engine.run());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "live server listening");
    axum::serve(listener, router(state))
        .await
        .context("Server terminated")?;
    Ok(())
}
