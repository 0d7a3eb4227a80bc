//! Participant action ingestion: wire types, validation, and application.

pub mod processor;
pub mod types;

pub use processor::ActionProcessor;
pub use types::{Action, ActionsEnvelope, TradeRequest};
