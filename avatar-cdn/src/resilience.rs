//! Retry with backoff for calls to a guarded backend.
//!
//! [`retry_guarded`] wraps one logical call: it asks the shared
//! [`SharedBreaker`] for permission before every attempt, records the
//! outcome of every attempt, sleeps between attempts according to the
//! [`RetryPolicy`], and aborts promptly when the session's
//! [`CancellationToken`] fires.
//!
//! # Error classes
//!
//! - **Transient** (`NetworkTransient`): counted against the circuit and
//!   retried until `max_attempts`, then reported as `RetriesExhausted`.
//! - **Miss** (`NotFound`): returned at once. Not retried, not counted.
//! - **Everything else**: returned at once without touching the counters.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit_breaker::SharedBreaker;
use crate::error::{DeliveryError, Result};
use crate::types::Backend;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay before every retry.
    #[default]
    Fixed,
    /// `base * 2^(retry - 1)`, capped at `max_delay_ms`.
    Exponential,
}

/// Retry policy for a guarded backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    /// Random extra delay as a fraction of the computed delay (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff: Backoff::Fixed,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay to wait before retry number `retry` (1-based).
    ///
    /// Retry 0 is the first attempt and never waits.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay_ms as f64;
        let delay = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => base * 2f64.powi(retry.saturating_sub(1).min(30) as i32),
        }
        .min(self.max_delay_ms.max(self.base_delay_ms) as f64);

        let jitter = if self.jitter > 0.0 {
            delay * rand::random::<f64>() * self.jitter
        } else {
            0.0
        };
        Duration::from_millis((delay + jitter) as u64)
    }
}

/// Run `op` against `backend` under `policy`, guarded by `breaker`.
///
/// `op` receives the zero-based attempt number. If the circuit is blocking
/// before an attempt, the call fails fast with [`DeliveryError::CircuitOpen`]
/// and no network activity takes place.
pub async fn retry_guarded<T, F, Fut>(
    backend: Backend,
    policy: &RetryPolicy,
    breaker: &SharedBreaker,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }
        if attempt > 0 {
            let delay = policy.delay_for_retry(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if !breaker.should_attempt(backend) {
            debug!(%backend, attempt, "circuit open, failing fast");
            return Err(DeliveryError::CircuitOpen(backend));
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                breaker.release_trial(backend);
                return Err(DeliveryError::Cancelled);
            }
            result = op(attempt) => result,
        };

        match outcome {
            Ok(value) => {
                breaker.record_success(backend);
                return Ok(value);
            }
            Err(e) if e.is_retryable() => {
                breaker.record_failure(backend);
                warn!(%backend, attempt = attempt + 1, max_attempts, error = %e, "attempt failed");
                last_error = e.to_string();
            }
            Err(e) => {
                breaker.release_trial(backend);
                return Err(e);
            }
        }
    }

    Err(DeliveryError::RetriesExhausted {
        backend,
        attempts: max_attempts,
        last_error,
    })
}
