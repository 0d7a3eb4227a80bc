//! Reusable exponential backoff retry primitive.
//!
//! Delay doubles per attempt from the base, capped at the max, with a ±jitter
//! fraction to avoid thundering herds.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 3 means up to 4 attempts total.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1]; 0.3 means ±30% of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let exp = base * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter.clamp(0.0, 1.0);
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(base)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<E>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, `should_retry` declines, or retries are
/// exhausted. `on_retry` observes every scheduled retry with the computed
/// delay before sleeping it.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut should_retry: impl FnMut(&E) -> bool,
    mut on_retry: impl FnMut(&E, u32, Duration),
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op(attempts).await {
            Ok(data) => {
                return RetryOutcome {
                    success: true,
                    data: Some(data),
                    error: None,
                    attempts,
                }
            }
            Err(error) => {
                let retries_left = attempts <= policy.max_retries;
                if !retries_left || !should_retry(&error) {
                    return RetryOutcome {
                        success: false,
                        data: None,
                        error: Some(error),
                        attempts,
                    };
                }
                let delay = policy.delay_for(attempts);
                on_retry(&error, attempts, delay);
                sleep(delay).await;
            }
        }
    }
}
