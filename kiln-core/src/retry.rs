use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{KilnError, Result};

/// Bounded retry with exponential backoff for outbound calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Upper bound for a single attempt.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            jitter_ratio: 0.2,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exp = u32::from(attempt.saturating_sub(1)).min(16);
        self.backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms)
    }

    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay_for(&self, attempt: u16) -> Duration {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return Duration::ZERO;
        }
        let span = ((base as f64) * f64::from(self.jitter_ratio.max(0.0))) as u64;
        let jitter = if span == 0 {
            0
        } else {
            rand::rng().random_range(0..=span)
        };
        Duration::from_millis(base.saturating_add(jitter).min(self.backoff_max_ms))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Every attempt is bounded by the attempt timeout.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt: u16 = 0;
        loop {
            attempt += 1;
            match with_timeout(operation, self.attempt_timeout(), op()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying outbound call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        error!(operation, attempt, error = %err, "giving up after retries");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Bounds `fut` by `limit`, mapping expiry to [`KilnError::UpstreamTimeout`].
pub async fn with_timeout<T, Fut>(
    operation: &str,
    limit: Duration,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(KilnError::UpstreamTimeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}
