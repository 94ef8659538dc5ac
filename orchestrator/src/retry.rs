//! Retry policy and exponential backoff

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-step retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-attempts after the first try
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64, backoff_multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            backoff_multiplier,
            max_delay_ms,
        }
    }

    /// Delay before the `retry`-th re-attempt (1-based):
    /// `min(initial * multiplier^(retry-1), max)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Check numeric sanity of the policy
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) is smaller than initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }
        Ok(())
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Stopped by `cancelled` while waiting to retry
    pub cancelled: bool,
}

/// Run `op` until it succeeds, `retryable` rejects the error, the policy is
/// exhausted, or `cancelled` resolves. `on_retry(retry, &err, delay)` fires
/// before each backoff sleep.
///
/// Cancellation is only observed between attempts: a running attempt always
/// finishes, and no attempt starts once `cancelled` has resolved. The last
/// error is returned.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
    mut on_retry: impl FnMut(u32, &E, Duration),
    cancelled: impl Future<Output = ()>,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    tokio::pin!(cancelled);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    cancelled: false,
                }
            }
            Err(err) => {
                let retry = attempt;
                if retry > policy.max_retries || !retryable(&err) {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        cancelled: false,
                    };
                }
                let delay = policy.delay_for(retry);
                on_retry(retry, &err, delay);
                tokio::select! {
                    biased;
                    _ = &mut cancelled => {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                            cancelled: true,
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
