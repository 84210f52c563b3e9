//! Bounded retry with a per-attempt deadline.
//!
//! Delays come from the `backoff` crate; attempt counting and the timeout on
//! each individual attempt are handled here, because a deadline spanning all
//! retries would let one slow attempt starve the rest.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry configuration shared by session refresh and API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Deadline applied to every single attempt
    pub attempt_timeout: Duration,

    /// Delay before the second attempt
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    pub max_backoff: Duration,

    /// Growth factor for exponential backoff
    pub multiplier: f64,

    pub kind: BackoffKind,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            kind: BackoffKind::Exponential,
        }
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    /// Attempts actually made
    pub attempts: u32,

    /// Error of the last attempt
    pub last_error: TransportError,

    /// True when the attempt budget ran out, false when the error was not retryable
    pub exhausted: bool,
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with an error `should_retry` rejects,
    /// or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. An attempt that exceeds
    /// `attempt_timeout` is dropped and counts as `TransportError::Timeout`.
    pub async fn run<T, F, Fut, R>(
        &self,
        operation: &str,
        should_retry: R,
        mut op: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
        R: Fn(&TransportError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delays = self.delays();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => TransportError::Timeout(self.attempt_timeout),
            };

            if !should_retry(&error) {
                debug!(operation, attempt, error = %error, "Non-retryable failure");
                return Err(RetryFailure {
                    attempts: attempt,
                    last_error: error,
                    exhausted: false,
                });
            }

            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, error = %error, "Retries exhausted");
                return Err(RetryFailure {
                    attempts: attempt,
                    last_error: error,
                    exhausted: true,
                });
            }

            let delay = delays
                .next_backoff()
                .unwrap_or(self.max_backoff)
                .min(self.max_backoff);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay schedule for one `run`. Jitter is disabled so the schedule is
    /// reproducible.
    fn delays(&self) -> Box<dyn Backoff + Send> {
        match self.kind {
            BackoffKind::Fixed => Box::new(Constant::new(self.initial_backoff)),
            BackoffKind::Exponential => {
                let backoff: ExponentialBackoff = ExponentialBackoffBuilder::new()
                    .with_initial_interval(self.initial_backoff)
                    .with_multiplier(self.multiplier)
                    .with_randomization_factor(0.0)
                    .with_max_interval(self.max_backoff)
                    .with_max_elapsed_time(None)
                    .build();
                Box::new(backoff)
            }
        }
    }
}
