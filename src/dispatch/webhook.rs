//! Outbound webhook dispatcher.
//!
//! One task per recipient per tick, joined before the tick completes. Each
//! call is signed, timed out, retried on retryable failures only, and gated
//! by the recipient's circuit breaker. Skipped calls touch no counters.

use crate::actions::{Action, ActionsEnvelope};
use crate::config::WebhookConfig;
use crate::dispatch::circuit::CircuitRegistry;
use crate::dispatch::payload::{PayloadBuilder, TickSnapshot};
use crate::dispatch::retry::{retry_with_backoff, RetryPolicy};
use crate::models::Agent;
use crate::store::SqliteStore;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::Serialize;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// A fully materialized outbound call.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub body: String,
    /// (name, value) pairs beyond content-type.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Connection-level transport failures (no HTTP status available).
#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout,
    Connect(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connect(e) => write!(f, "connection error: {e}"),
        }
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, req: WebhookRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport over reqwest. The per-attempt timeout is enforced by
/// the dispatcher's abort, not here.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(&self, req: WebhookRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(&req.url)
            .header("Content-Type", "application/json")
            .body(req.body.clone());
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(TransportResponse { status, body })
    }
}

/// Per-recipient terminal outcome for one tick's dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub agent_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip)]
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub response_time_ms: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub circuit_breaker_skipped: bool,
}

/// One attempt's failure, classified for the retry decision.
#[derive(Debug)]
enum CallError {
    Status { code: u16, body: String },
    Timeout,
    Connect(String),
}

impl CallError {
    fn retryable(&self) -> bool {
        match self {
            CallError::Status { code, .. } => *code == 429 || (500..600).contains(code),
            CallError::Timeout | CallError::Connect(_) => true,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            CallError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Status { code, .. } => write!(f, "HTTP {code}"),
            CallError::Timeout => write!(f, "request timed out"),
            CallError::Connect(e) => write!(f, "connection error: {e}"),
        }
    }
}

pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
    registry: Arc<CircuitRegistry>,
    store: SqliteStore,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        registry: Arc<CircuitRegistry>,
        store: SqliteStore,
        config: WebhookConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            store,
            config,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            base_delay: self.config.backoff_base,
            max_delay: self.config.backoff_max,
            jitter: 0.3,
        }
    }

    /// Fan the tick payload out to every recipient in parallel and wait for
    /// all terminal outcomes.
    pub async fn dispatch_tick(
        &self,
        snapshot: Arc<TickSnapshot>,
        builder: Arc<PayloadBuilder>,
        recipients: Vec<Agent>,
    ) -> Vec<DispatchOutcome> {
        let mut handles = Vec::with_capacity(recipients.len());
        for agent in recipients {
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.registry);
            let store = self.store.clone();
            let snapshot = Arc::clone(&snapshot);
            let builder = Arc::clone(&builder);
            let policy = self.retry_policy();
            let timeout = self.config.timeout;
            handles.push(tokio::spawn(async move {
                dispatch_one(
                    transport, registry, store, policy, timeout, agent, snapshot, builder,
                )
                .await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "dispatch task panicked"),
            }
        }
        outcomes
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_one(
    transport: Arc<dyn WebhookTransport>,
    registry: Arc<CircuitRegistry>,
    store: SqliteStore,
    policy: RetryPolicy,
    timeout: Duration,
    agent: Agent,
    snapshot: Arc<TickSnapshot>,
    builder: Arc<PayloadBuilder>,
) -> DispatchOutcome {
    let agent_id = agent.id.clone();
    let breaker = registry.get(&agent_id);

    if !breaker.lock().allow_call() {
        counter!("webhook_dispatch_skipped_total", 1);
        return DispatchOutcome {
            agent_id,
            success: false,
            status_code: None,
            actions: Vec::new(),
            error: Some("Circuit breaker open".to_string()),
            response_time_ms: 0,
            attempts: 0,
            circuit_breaker_skipped: true,
        };
    }

    let Some(url) = agent.webhook_url.clone() else {
        return DispatchOutcome {
            agent_id,
            success: false,
            status_code: None,
            actions: Vec::new(),
            error: Some("No webhook URL registered".to_string()),
            response_time_ms: 0,
            attempts: 0,
            circuit_breaker_skipped: false,
        };
    };

    let request = match build_request(&agent, &url, &snapshot, &builder) {
        Ok(request) => request,
        Err(e) => {
            warn!(agent = %agent_id, error = %e, "payload build failed");
            return DispatchOutcome {
                agent_id,
                success: false,
                status_code: None,
                actions: Vec::new(),
                error: Some(format!("Payload build failed: {e}")),
                response_time_ms: 0,
                attempts: 0,
                circuit_breaker_skipped: false,
            };
        }
    };

    let started = Instant::now();
    let outcome = retry_with_backoff(
        &policy,
        CallError::retryable,
        |err, attempt, delay| {
            debug!(
                agent = %agent_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "webhook attempt failed, retrying"
            );
        },
        |_| {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move {
                match tokio::time::timeout(timeout, transport.send(request)).await {
                    Err(_) => Err(CallError::Timeout),
                    Ok(Err(TransportError::Timeout)) => Err(CallError::Timeout),
                    Ok(Err(TransportError::Connect(e))) => Err(CallError::Connect(e)),
                    Ok(Ok(response)) if (200..300).contains(&response.status) => Ok(response),
                    Ok(Ok(response)) => Err(CallError::Status {
                        code: response.status,
                        body: response.body,
                    }),
                }
            }
        },
    )
    .await;
    let response_time_ms = started.elapsed().as_millis() as u64;

    if outcome.success {
        let response = outcome.data.unwrap_or(TransportResponse {
            status: 200,
            body: String::new(),
        });
        // Any 2xx with a non-JSON body means "no actions".
        let actions = serde_json::from_str::<ActionsEnvelope>(&response.body)
            .map(|env| env.actions)
            .unwrap_or_default();

        breaker.lock().record_success();
        if let Err(e) = store.record_webhook_success(&agent_id, Utc::now()) {
            warn!(agent = %agent_id, error = %e, "webhook success accounting failed");
        }
        counter!("webhook_dispatch_success_total", 1);

        DispatchOutcome {
            agent_id,
            success: true,
            status_code: Some(response.status),
            actions,
            error: None,
            response_time_ms,
            attempts: outcome.attempts,
            circuit_breaker_skipped: false,
        }
    } else {
        let error = outcome.error;
        let status_code = error.as_ref().and_then(CallError::status_code);
        let message = error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown dispatch error".to_string());

        breaker.lock().record_failure();
        if let Err(e) = store.record_webhook_failure(&agent_id, &message) {
            warn!(agent = %agent_id, error = %e, "webhook failure accounting failed");
        }
        counter!("webhook_dispatch_failure_total", 1);

        DispatchOutcome {
            agent_id,
            success: false,
            status_code,
            actions: Vec::new(),
            error: Some(message),
            response_time_ms,
            attempts: outcome.attempts,
            circuit_breaker_skipped: false,
        }
    }
}

fn build_request(
    agent: &Agent,
    url: &str,
    snapshot: &TickSnapshot,
    builder: &PayloadBuilder,
) -> anyhow::Result<WebhookRequest> {
    let payload = builder.build(agent, snapshot)?;
    let body = serde_json::to_string(&payload)?;

    let mut headers = vec![
        ("X-Tick".to_string(), snapshot.tick.to_string()),
        ("X-Agent".to_string(), agent.id.clone()),
    ];
    if let Some(secret) = agent.webhook_secret.as_deref() {
        if let Some(signature) = sign_body(secret, &body) {
            headers.push(("X-Signature".to_string(), signature));
        }
    }

    Ok(WebhookRequest {
        url: url.to_string(),
        body,
        headers,
    })
}

/// HMAC-SHA256 over the exact serialized body, hex encoded.
fn sign_body(secret: &str, body: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body.as_bytes());
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
