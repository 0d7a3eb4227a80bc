//! The authoritative tick pipeline and its synchronous collaborators.

pub mod events;
pub mod pricing;
pub mod tick;

pub use pricing::{PriceInputs, PriceModel};
pub use tick::{Heartbeat, TickEngine, TickOutcome};
