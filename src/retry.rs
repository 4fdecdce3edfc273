//! Retry logic with exponential backoff and circuit breaking
//!
//! [`RetryExecutor`] runs an async operation up to `max_retries` times. The delay
//! before attempt `n + 1` is `base_delay * 2^n` (capped at `max_delay`, optionally
//! jittered); there is no delay after the final attempt.
//!
//! Before every attempt the executor asks the [`CircuitBreaker`] for the
//! operation's key. A rejected attempt counts as used but does not sleep.
//! Errors are classified with [`IsRetryable`]: retryable errors move on to the
//! next attempt, anything else aborts immediately and is returned unchanged.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mass_dl::circuit_breaker::CircuitBreaker;
//! use mass_dl::config::{CircuitBreakerConfig, RetryConfig};
//! use mass_dl::retry::RetryExecutor;
//!
//! # async fn example() -> mass_dl::Result<()> {
//! let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerConfig::default()));
//! let executor = RetryExecutor::new(RetryConfig::default(), breaker);
//! let value = executor
//!     .execute("remote-upload", || async { Ok::<_, mass_dl::Error>(42) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, rate limiting, connection resets) return `true`.
/// Permanent failures (bad input, missing resources, private channels) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::RateLimited(_) | Error::Network(_) => true,
            // Only connection-level I/O failures are transient
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Unclassified client failures: retry only on transient-looking messages
            Error::Transfer(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("temporar")
                    || msg.contains("rate limit")
                    || msg.contains("429")
                    || msg.contains("503")
            }
            Error::Config { .. } | Error::Validation(_) => false,
            Error::NotFound(_) | Error::Unavailable(_) => false,
            // The executor consults the breaker itself; a nested rejection is final
            Error::CircuitOpen { .. } | Error::RetriesExhausted { .. } => false,
            Error::ResourceMonitor(_) | Error::AdmissionTimeout { .. } => false,
            Error::Cancelled | Error::ShuttingDown => false,
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Serialization(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// Runs operations with bounded exponential-backoff retries behind a circuit breaker
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

impl RetryExecutor {
    /// Create an executor sharing `breaker` with other executors
    pub fn new(config: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, breaker }
    }

    /// The circuit breaker registry this executor consults
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Delay after the failed attempt number `attempt` (0-based), before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        let delay = Duration::from_secs_f64(self.config.base_delay.as_secs_f64() * factor);
        delay.min(self.config.max_delay)
    }

    /// Execute `operation` under the retry policy for `key`
    ///
    /// # Errors
    ///
    /// - A non-retryable error from `operation`, returned as-is on the attempt it occurs
    /// - [`Error::RetriesExhausted`] with the attempt count once every attempt failed
    ///   (including attempts rejected by an open circuit)
    pub async fn execute<F, Fut, T>(&self, key: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..max_attempts {
            if !self.breaker.try_acquire(key).await {
                tracing::warn!(
                    operation = key,
                    attempt = attempt + 1,
                    max_attempts,
                    "Circuit open, attempt rejected"
                );
                last_error = Some(Error::CircuitOpen {
                    operation: key.to_string(),
                });
                continue;
            }

            match operation().await {
                Ok(value) => {
                    self.breaker.record_success(key).await;
                    if attempt > 0 {
                        tracing::info!(
                            operation = key,
                            attempts = attempt + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    self.breaker.record_failure(key).await;
                    let is_last = attempt + 1 >= max_attempts;
                    if !is_last {
                        let delay = if self.config.jitter {
                            add_jitter(self.delay_for(attempt))
                        } else {
                            self.delay_for(attempt)
                        };
                        tracing::warn!(
                            operation = key,
                            error = %e,
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis(),
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    self.breaker.release(key).await;
                    tracing::error!(
                        operation = key,
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                    return Err(e);
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());
        tracing::error!(
            operation = key,
            attempts = max_attempts,
            error = %last_error,
            "Operation failed after all retry attempts exhausted"
        );
        Err(Error::RetriesExhausted {
            operation: key.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
