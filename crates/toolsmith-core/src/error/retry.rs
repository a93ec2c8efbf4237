//! # Retry Logic with Exponential Backoff
//!
//! Configurable retry logic for transient failures. The delay for attempt
//! `i` (0-based) is `min(initial_delay * multiplier^i, max_delay)`, with an
//! optional jitter factor to spread out synchronized retries.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum retry delay in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0); 0.0 keeps delays deterministic
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delay between attempts
    pub fn fixed(attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Create a policy with exponential backoff and default delays
    pub fn exponential(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based retry index)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        delay = delay.min(self.max_delay_ms as f64);

        if self.jitter_factor > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(-self.jitter_factor..=self.jitter_factor);
            delay *= 1.0 + jitter;
        }

        Duration::from_millis(delay.max(0.0) as u64)
    }
}

/// Outcome of a retried operation: the final result plus how many attempts
/// were consumed.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `operation` under `policy`, sleeping between failed attempts.
///
/// The operation is invoked at most `policy.max_attempts` times; the final
/// error is returned unmodified when every attempt fails.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "operation succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) if attempt >= max_attempts => {
                warn!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %err,
                    "operation exhausted retries"
                );
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
            Err(err) => {
                let delay = policy.calculate_delay(attempt - 1);
                debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
