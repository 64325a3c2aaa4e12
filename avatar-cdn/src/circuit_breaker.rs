//! Per-backend circuit breaker.
//!
//! Tracks consecutive failures per remote backend and temporarily blocks
//! backends that fail repeatedly. After the recovery timeout a tripped
//! backend enters a half-open state in which exactly one trial call is let
//! through; its outcome restores or re-trips the circuit.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  N failures   ┌────────┐  recovery   ┌──────────┐
//! │ Closed ├──────────────►│  Open  ├────────────►│ HalfOpen │
//! └───▲────┘               └────────┘             └────┬─────┘
//!     │                         ▲                      │
//!     │  success                │  failure              │
//!     └─────────────────────────┴──────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::Backend;

/// Circuit breaker state for a single backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Backend is healthy and all calls go through.
    Closed,
    /// Backend failed too often; calls fail fast until the recovery timeout.
    Open,
    /// Recovery timeout elapsed; one trial call decides the next state.
    HalfOpen,
}

/// Health tracking data for a single backend.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// When the circuit last tripped to Open.
    pub opened_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    /// Set while the single half-open trial is outstanding.
    trial_in_flight: bool,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_success_at: None,
            trial_in_flight: false,
        }
    }
}

/// Configuration for circuit breaker behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before tripping the circuit to Open.
    pub failure_threshold: u32,
    /// Milliseconds to stay Open before allowing a half-open trial.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// One row of [`CircuitBreaker::health_report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitReport {
    pub backend: Backend,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Per-backend circuit breaker.
///
/// Each backend has independent health tracking. This type is not
/// synchronised; share it through [`SharedBreaker`].
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    backends: HashMap<Backend, BackendHealth>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            backends: HashMap::new(),
        }
    }

    /// Record a successful call. Any state becomes Closed with a zero counter.
    pub fn record_success(&mut self, backend: Backend) {
        let health = self.backends.entry(backend).or_default();
        if health.state != CircuitState::Closed {
            tracing::info!(%backend, "circuit closed");
        }
        health.state = CircuitState::Closed;
        health.consecutive_failures = 0;
        health.opened_at = None;
        health.trial_in_flight = false;
        health.last_success_at = Some(Instant::now());
    }

    /// Record a failed call.
    ///
    /// A failed half-open trial re-opens the circuit with a fresh recovery
    /// timeout. In Closed state the circuit trips once the counter reaches
    /// the threshold.
    pub fn record_failure(&mut self, backend: Backend) {
        let threshold = self.config.failure_threshold;
        let health = self.backends.entry(backend).or_default();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.trial_in_flight = false;

        let trip = match health.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => health.consecutive_failures >= threshold,
            // Late failures from calls admitted before the trip keep the
            // original recovery deadline.
            CircuitState::Open => false,
        };
        if trip {
            health.state = CircuitState::Open;
            health.opened_at = Some(Instant::now());
            tracing::warn!(
                %backend,
                failures = health.consecutive_failures,
                "circuit opened"
            );
        }
    }

    /// Ask permission to call `backend`.
    ///
    /// - Closed: always `true`.
    /// - Open: `false` until the recovery timeout elapses, then the circuit
    ///   moves to HalfOpen and this call receives the single trial permit.
    /// - HalfOpen: `true` only if no trial is outstanding.
    pub fn should_attempt(&mut self, backend: Backend) -> bool {
        let recovery = self.config.recovery_timeout();
        let health = self.backends.entry(backend).or_default();

        match health.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if health.trial_in_flight {
                    false
                } else {
                    health.trial_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                let recovered = health.opened_at.is_none_or(|t| t.elapsed() >= recovery);
                if recovered {
                    tracing::debug!(%backend, "circuit half-open, admitting trial");
                    health.state = CircuitState::HalfOpen;
                    health.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Give back a half-open trial permit whose call never completed, e.g.
    /// because the session was cancelled.
    pub fn release_trial(&mut self, backend: Backend) {
        if let Some(health) = self.backends.get_mut(&backend) {
            health.trial_in_flight = false;
        }
    }

    /// Current state of a backend. Unseen backends are Closed.
    pub fn state(&self, backend: Backend) -> CircuitState {
        self.backends
            .get(&backend)
            .map_or(CircuitState::Closed, |h| h.state)
    }

    /// Whether a call would currently fail fast without touching the network.
    pub fn is_blocking(&self, backend: Backend) -> bool {
        match self.backends.get(&backend) {
            None => false,
            Some(h) => match h.state {
                CircuitState::Closed => false,
                CircuitState::HalfOpen => h.trial_in_flight,
                CircuitState::Open => h
                    .opened_at
                    .is_some_and(|t| t.elapsed() < self.config.recovery_timeout()),
            },
        }
    }

    pub fn health(&self, backend: Backend) -> Option<&BackendHealth> {
        self.backends.get(&backend)
    }

    /// Health of every backend seen so far.
    pub fn health_report(&self) -> Vec<CircuitReport> {
        let mut report: Vec<CircuitReport> = self
            .backends
            .iter()
            .map(|(backend, health)| CircuitReport {
                backend: *backend,
                state: health.state,
                consecutive_failures: health.consecutive_failures,
            })
            .collect();
        report.sort_by_key(|r| r.backend.name());
        report
    }

    /// Forget all state; every backend is Closed again.
    pub fn reset(&mut self) {
        self.backends.clear();
    }
}

/// Thread-safe handle to a [`CircuitBreaker`], shared by every component
/// that talks to a guarded backend. All transitions are serialised by one
/// mutex.
#[derive(Debug, Clone)]
pub struct SharedBreaker {
    inner: Arc<Mutex<CircuitBreaker>>,
}

impl SharedBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CircuitBreaker::new(config))),
        }
    }

    /// Lock the breaker. A poisoned lock still holds consistent counters,
    /// so it is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn should_attempt(&self, backend: Backend) -> bool {
        self.lock().should_attempt(backend)
    }

    pub fn record_success(&self, backend: Backend) {
        self.lock().record_success(backend);
    }

    pub fn record_failure(&self, backend: Backend) {
        self.lock().record_failure(backend);
    }

    pub fn release_trial(&self, backend: Backend) {
        self.lock().release_trial(backend);
    }

    pub fn state(&self, backend: Backend) -> CircuitState {
        self.lock().state(backend)
    }

    pub fn is_blocking(&self, backend: Backend) -> bool {
        self.lock().is_blocking(backend)
    }

    pub fn health_report(&self) -> Vec<CircuitReport> {
        self.lock().health_report()
    }

    pub fn reset(&self) {
        tracing::info!("resetting all circuit breakers");
        self.lock().reset();
    }
}

impl Default for SharedBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_breaker(threshold: u32, recovery_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_ms,
        })
    }

    fn trip(breaker: &mut CircuitBreaker, backend: Backend, n: u32) {
        for _ in 0..n {
            breaker.record_failure(backend);
        }
    }

    #[test]
    fn initial_state_is_closed() {
        let breaker = make_breaker(5, 30_000);
        assert_eq!(breaker.state(Backend::FullFrames), CircuitState::Closed);
        assert_eq!(breaker.state(Backend::Synthesis), CircuitState::Closed);
        assert!(!breaker.is_blocking(Backend::Visemes));
    }

    #[test]
    fn stays_closed_below_threshold() {
        let mut breaker = make_breaker(5, 30_000);
        trip(&mut breaker, Backend::Visemes, 4);
        assert_eq!(breaker.state(Backend::Visemes), CircuitState::Closed);
        assert!(breaker.should_attempt(Backend::Visemes));
    }

    #[test]
    fn trips_to_open_at_exactly_threshold() {
        let mut breaker = make_breaker(5, 30_000);
        trip(&mut breaker, Backend::FullFrames, 5);
        assert_eq!(breaker.state(Backend::FullFrames), CircuitState::Open);
    }

    #[test]
    fn open_fails_fast_before_recovery() {
        let mut breaker = make_breaker(5, 600_000);
        trip(&mut breaker, Backend::Expressions, 5);
        assert!(!breaker.should_attempt(Backend::Expressions));
        assert!(breaker.is_blocking(Backend::Expressions));
    }

    #[test]
    fn open_transitions_to_half_open_after_recovery() {
        let mut breaker = make_breaker(2, 0);
        trip(&mut breaker, Backend::Synthesis, 2);
        assert_eq!(breaker.state(Backend::Synthesis), CircuitState::Open);

        assert!(breaker.should_attempt(Backend::Synthesis));
        assert_eq!(breaker.state(Backend::Synthesis), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let mut breaker = make_breaker(1, 0);
        breaker.record_failure(Backend::Visemes);
        assert!(breaker.should_attempt(Backend::Visemes));
        assert!(!breaker.should_attempt(Backend::Visemes));
        assert!(breaker.is_blocking(Backend::Visemes));
    }

    #[test]
    fn released_trial_can_be_reissued() {
        let mut breaker = make_breaker(1, 0);
        breaker.record_failure(Backend::Visemes);
        assert!(breaker.should_attempt(Backend::Visemes));
        breaker.release_trial(Backend::Visemes);
        assert!(breaker.should_attempt(Backend::Visemes));
    }

    #[test]
    fn half_open_success_restores_closed_and_resets_counter() {
        let mut breaker = make_breaker(3, 0);
        trip(&mut breaker, Backend::FullFrames, 3);
        let _ = breaker.should_attempt(Backend::FullFrames);
        breaker.record_success(Backend::FullFrames);

        let health = breaker.health(Backend::FullFrames).unwrap();
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_timeout() {
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_ms: 0,
        });
        breaker.record_failure(Backend::Expressions);
        let _ = breaker.should_attempt(Backend::Expressions);
        breaker.record_failure(Backend::Expressions);
        assert_eq!(breaker.state(Backend::Expressions), CircuitState::Open);
        assert!(breaker.health(Backend::Expressions).unwrap().opened_at.is_some());
    }

    #[test]
    fn backends_are_independent() {
        let mut breaker = make_breaker(2, 60_000);
        trip(&mut breaker, Backend::FullFrames, 2);
        assert_eq!(breaker.state(Backend::FullFrames), CircuitState::Open);
        assert_eq!(breaker.state(Backend::Visemes), CircuitState::Closed);
        assert!(breaker.should_attempt(Backend::Visemes));
    }

    #[test]
    fn alternating_outcomes_never_trip() {
        let mut breaker = make_breaker(3, 60_000);
        for _ in 0..10 {
            breaker.record_failure(Backend::Synthesis);
            breaker.record_success(Backend::Synthesis);
        }
        assert_eq!(breaker.state(Backend::Synthesis), CircuitState::Closed);
    }

    #[test]
    fn health_report_lists_tracked_backends() {
        let mut breaker = make_breaker(3, 60_000);
        breaker.record_failure(Backend::Visemes);
        breaker.record_success(Backend::Synthesis);

        let report = breaker.health_report();
        assert_eq!(report.len(), 2);
        let visemes = report
            .iter()
            .find(|r| r.backend == Backend::Visemes)
            .unwrap();
        assert_eq!(visemes.state, CircuitState::Closed);
        assert_eq!(visemes.consecutive_failures, 1);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut breaker = make_breaker(1, 60_000);
        breaker.record_failure(Backend::FullFrames);
        assert_eq!(breaker.state(Backend::FullFrames), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(Backend::FullFrames), CircuitState::Closed);
        assert!(breaker.health_report().is_empty());
    }

    #[test]
    fn default_config_values() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn shared_breaker_is_shared_across_clones() {
        let shared = SharedBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 60_000,
        });
        let other = shared.clone();
        shared.record_failure(Backend::Visemes);
        other.record_failure(Backend::Visemes);
        assert_eq!(shared.state(Backend::Visemes), CircuitState::Open);
        assert!(!other.should_attempt(Backend::Visemes));
    }

    #[test]
    fn concurrent_failures_trip_exactly_once() {
        let shared = SharedBreaker::new(CircuitBreakerConfig {
            failure_threshold: 50,
            recovery_timeout_ms: 60_000,
        });
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let b = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        b.record_failure(Backend::FullFrames);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let report = shared.health_report();
        assert_eq!(report[0].consecutive_failures, 50);
        assert_eq!(report[0].state, CircuitState::Open);
    }
}
