//! Bounded retry of node calls
//!
//! Only transient connector failures are retried. Anything else is returned to the
//! caller after the first attempt.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{classify_report, ErrorKind};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the delay between attempts
    pub max_backoff: Duration,
    /// Growth factor applied per retry (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryConfig {
    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: backoff,
            max_backoff: backoff,
            backoff_multiplier: 1.0,
        }
    }

    /// Backoff before retry number `retry` (0-indexed)
    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempts` have failed
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Last error of an operation that did not succeed
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub kind: ErrorKind,
    pub error: eyre::Report,
}

impl RetryFailure {
    /// True when the operation kept failing transiently until attempts ran out
    pub fn exhausted(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Run `operation` until it succeeds, fails non-transiently or runs out of attempts
///
/// The closure receives the 0-indexed attempt number.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    let mut attempts = 0;

    loop {
        match operation(attempts).await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempts += 1;
                let kind = classify_report(&error);

                if kind != ErrorKind::Transient {
                    debug!(attempts, ?kind, error = %error, "Not retrying");
                    return Err(RetryFailure {
                        attempts,
                        kind,
                        error,
                    });
                }
                if !config.should_retry(attempts) {
                    warn!(attempts, error = %error, "Giving up after transient failures");
                    return Err(RetryFailure {
                        attempts,
                        kind,
                        error,
                    });
                }

                let backoff = config.backoff_for_retry(attempts - 1);
                warn!(
                    attempt = attempts,
                    max = config.max_attempts,
                    ?backoff,
                    error = %error,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
