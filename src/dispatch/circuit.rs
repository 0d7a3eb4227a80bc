//! Per-recipient circuit breakers and the shared registry.
//!
//! Born closed; trips open after a run of consecutive failures; probes
//! half-open after the recovery window; closes again on enough half-open
//! successes, re-opens on a single half-open failure. Skipped calls update
//! neither success nor failure counters.

use crate::config::CircuitConfig;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Open => "open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    id: String,
    config: CircuitConfig,
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    total_skips: u64,
}

impl CircuitBreaker {
    fn new(id: String, config: CircuitConfig) -> Self {
        Self {
            id,
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            total_successes: 0,
            total_failures: 0,
            total_skips: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Gate for an outbound call. Open breakers skip until the recovery
    /// window elapses, then probe half-open.
    pub fn allow_call(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_window)
                    .unwrap_or(true);
                if elapsed {
                    info!(recipient = %self.id, "circuit half-open, probing");
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    self.total_skips += 1;
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= self.config.half_open_successes {
                info!(recipient = %self.id, "circuit closed");
                self.state = CircuitState::Closed;
                self.opened_at = None;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.total_failures += 1;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            // A single half-open failure re-opens.
            CircuitState::HalfOpen => self.trip(),
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self) {
        warn!(
            recipient = %self.id,
            failures = self.consecutive_failures,
            "circuit open"
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_successes = 0;
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            id: self.id.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_skips: self.total_skips,
        }
    }
}

/// Read-only snapshot of one breaker for observability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_skips: u64,
}

/// Concurrent map of breakers, one per recipient, created on demand.
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for `id`, creating it closed on first sight.
    pub fn get(&self, id: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.read().get(id) {
            return Arc::clone(breaker);
        }
        let mut map = self.breakers.write();
        Arc::clone(
            map.entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(id.to_string(), self.config)))),
        )
    }

    pub fn stats(&self) -> Vec<CircuitStats> {
        let map = self.breakers.read();
        let mut all: Vec<CircuitStats> = map.values().map(|b| b.lock().stats()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Ids of currently open breakers.
    pub fn open_ids(&self) -> Vec<String> {
        self.stats()
            .into_iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.id)
            .collect()
    }
}
