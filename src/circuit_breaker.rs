//! Per-operation circuit breaker
//!
//! Each logical operation ("remote-upload", "video-download", ...) gets its own
//! breaker so one failing dependency does not block unrelated work.
//!
//! ```text
//!            failures >= threshold
//!   Closed ------------------------> Open
//!     ^                               |
//!     | trial succeeds                | reset_timeout since last failure
//!     |                               v
//!     +--------------------------- HalfOpen
//!              trial fails: back to Open
//! ```
//!
//! While half-open exactly one trial call is let through; other callers are
//! rejected until the trial call reports its outcome.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

/// Circuit state for one operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected immediately
    Open,
    /// One trial call is allowed
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }

    /// Move Open -> HalfOpen once the reset timeout has elapsed.
    fn refresh(&mut self, reset_timeout: Duration) {
        if self.state == CircuitState::Open
            && self
                .last_failure
                .is_some_and(|at| at.elapsed() >= reset_timeout)
        {
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
        }
    }
}

/// Registry of breakers keyed by operation name
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreaker {
    /// Create a registry; every key shares the same thresholds
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of `operation` (Closed for unseen keys)
    pub async fn state(&self, operation: &str) -> CircuitState {
        let mut breakers = self.breakers.lock().await;
        match breakers.get_mut(operation) {
            Some(breaker) => {
                breaker.refresh(self.reset_timeout);
                breaker.state
            }
            None => CircuitState::Closed,
        }
    }

    /// Ask to run `operation`
    ///
    /// Returns `false` while open, and while half-open with a trial call already out.
    pub async fn try_acquire(&self, operation: &str) -> bool {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(Breaker::new);
        breaker.refresh(self.reset_timeout);

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    false
                } else {
                    breaker.trial_in_flight = true;
                    tracing::info!(operation, "Circuit half-open, allowing a trial call");
                    true
                }
            }
        }
    }

    /// Report a successful call
    pub async fn record_success(&self, operation: &str) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(Breaker::new);
        if breaker.state == CircuitState::HalfOpen {
            tracing::info!(operation, "Trial call succeeded, circuit closed");
        }
        breaker.state = CircuitState::Closed;
        breaker.consecutive_failures = 0;
        breaker.trial_in_flight = false;
    }

    /// Report a failed call
    pub async fn record_failure(&self, operation: &str) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(Breaker::new);
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.last_failure = Some(Instant::now());
        breaker.trial_in_flight = false;

        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                tracing::warn!(operation, "Trial call failed, circuit reopened");
            }
            CircuitState::Closed if breaker.consecutive_failures >= self.failure_threshold => {
                breaker.state = CircuitState::Open;
                tracing::warn!(
                    operation,
                    failures = breaker.consecutive_failures,
                    "Circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Give back an acquired slot without reporting an outcome
    ///
    /// Used when a call ends in an error that says nothing about the health of
    /// the dependency (bad input, permanently missing resource).
    pub async fn release(&self, operation: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(operation) {
            breaker.trial_in_flight = false;
        }
    }

    /// Run `op` through the breaker for `operation`
    ///
    /// Rejected calls fail with [`Error::CircuitOpen`] without running `op`.
    /// Every error `op` returns counts as a failure.
    pub async fn call<F, Fut, T>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire(operation).await {
            return Err(Error::CircuitOpen {
                operation: operation.to_string(),
            });
        }
        match op().await {
            Ok(value) => {
                self.record_success(operation).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(operation).await;
                Err(e)
            }
        }
    }

    /// States of every key seen so far, sorted by key
    pub async fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut breakers = self.breakers.lock().await;
        let mut states: Vec<_> = breakers
            .iter_mut()
            .map(|(key, breaker)| {
                breaker.refresh(self.reset_timeout);
                (key.clone(), breaker.state)
            })
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
