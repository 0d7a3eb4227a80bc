//! Continuous double auction: per-symbol books and the matching pass.

pub mod book;
pub mod engine;

pub use book::{cents_to_price, price_to_cents, OrderBook, SubmitOutcome};
pub use engine::{AffectedRestingOrder, MatchingEngine, MatchingPolicy, SymbolPassResult};
