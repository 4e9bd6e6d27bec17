//! Retry policy with exponential backoff and jitter for store operations.
//!
//! Only transient store errors are retried. Condition failures and permanent
//! backend errors return immediately so callers can decide what a conflict
//! means for them.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::errors::{CoherenceError, CoherenceResult};
use crate::domain::models::ConcurrencyConfig;
use crate::domain::ports::StoreError;

/// Exponential backoff with jitter for transient store errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    /// Randomization factor, 0.0 disables jitter
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConcurrencyConfig::default())
    }
}

impl RetryPolicy {
    /// Policy with explicit limits. Jitter is clamped to `[0, 1]`.
    pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64, jitter: f64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms.max(initial_backoff_ms)),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Policy from the concurrency settings.
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(config.max_retries, config.backoff_base_ms, config.backoff_max_ms, config.jitter)
    }

    /// Same backoff, different retry limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Fresh backoff schedule for one retry loop.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_randomization_factor(self.jitter)
            .with_multiplier(2.0)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `operation`, retrying transient store errors.
    ///
    /// Exhausting the retries yields `CoherenceError::TransientStore` carrying
    /// the total number of attempts.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> CoherenceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "Store operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(StoreError::Transient(message)) => {
                    if attempt > self.max_retries {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %message,
                            "Transient store error, retries exhausted"
                        );
                        return Err(CoherenceError::TransientStore { message, attempts: attempt });
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %message,
                        "Transient store error, retrying"
                    );
                    sleep(delay).await;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
}
