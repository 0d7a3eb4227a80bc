//! Live broadcast bus: session protocol, channel state, and delivery.

pub mod bus;
pub mod hub;
pub mod protocol;
pub mod session;

pub use bus::{BroadcastKind, BusMessage, InProcessBus, PubSub};
pub use hub::{BroadcastHub, ReconnectNotice, SessionClosed};
pub use protocol::{ClientMessage, ServerMessage, SubscribeFailure};
pub use session::{handle_client_message, handle_socket, LiveState};
