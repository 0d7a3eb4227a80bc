//! Tick-driven market simulator backend.
//!
//! One authoritative engine advances discrete ticks: it matches orders
//! through per-symbol books, evolves prices, broadcasts tick-derived events
//! to live sessions, fans per-participant payloads out over webhooks, and
//! ingests the returned action lists into the next tick.

pub mod actions;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod live;
pub mod matching;
pub mod models;
pub mod server;
pub mod store;
