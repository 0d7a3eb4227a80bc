//! Outbound webhook dispatch: payload building, signing, retries, and
//! per-recipient circuit isolation.

pub mod circuit;
pub mod payload;
pub mod retry;
pub mod webhook;

pub use circuit::{CircuitBreaker, CircuitRegistry, CircuitState, CircuitStats};
pub use payload::{PayloadBuilder, TickPayload, TickSnapshot};
pub use retry::{retry_with_backoff, RetryOutcome, RetryPolicy};
pub use webhook::{
    DispatchOutcome, HttpTransport, TransportError, TransportResponse, WebhookDispatcher,
    WebhookRequest, WebhookTransport,
};
