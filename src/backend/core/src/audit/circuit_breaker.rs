//! Circuit breaker guarding audit storage writes.
//!
//! Opens after a run of consecutive failures. While open, callers skip the
//! write entirely. Once the cool-down has elapsed the breaker resets to
//! closed with a zero failure count; any success does the same immediately.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - writes allowed
    Closed,
    /// Too many failures - writes dropped
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
        }
    }
}

/// Consecutive-failure circuit breaker with a fixed cool-down.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Current state and when it was opened
    state: RwLock<(CircuitState, Option<Instant>)>,

    /// Consecutive failure count
    failure_count: AtomicU32,

    /// Failures needed to trip the breaker
    failure_threshold: u32,

    /// How long the breaker stays open
    cool_down: Duration,

    /// Times the breaker has opened
    trips: AtomicU64,

    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker with a 60 second cool-down.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            state: RwLock::new((CircuitState::Closed, None)),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            cool_down: Duration::from_secs(60),
            trips: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Create with a custom cool-down.
    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    /// Whether a write may be attempted.
    pub fn can_execute(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Record a successful write; closes the breaker.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        if self.state() == CircuitState::Open {
            tracing::info!("Circuit breaker closed after successful write");
        }
        self.close();
    }

    /// Record a failed write. Returns true if this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write();
        if state.0 == CircuitState::Open {
            return false;
        }

        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            *state = (CircuitState::Open, Some(Instant::now()));
            self.trips.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                failures = failures,
                threshold = self.failure_threshold,
                cool_down_secs = self.cool_down.as_secs(),
                "Circuit breaker opened due to consecutive failures"
            );
            return true;
        }
        false
    }

    /// Current state, applying the cool-down: an open breaker whose cool-down
    /// has elapsed is reset to closed before it is reported.
    pub fn state(&self) -> CircuitState {
        let (state, opened_at) = *self.state.read();
        if state == CircuitState::Closed {
            return state;
        }

        let expired = opened_at.map_or(true, |t| t.elapsed() >= self.cool_down);
        if !expired {
            return CircuitState::Open;
        }

        let mut guard = self.state.write();
        // Another reader, or a success, may have closed it already.
        if guard.0 == CircuitState::Open && guard.1 == opened_at {
            self.failure_count.store(0, Ordering::Relaxed);
            *guard = (CircuitState::Closed, None);
            tracing::info!("Circuit breaker reset after cool-down");
        }
        guard.0
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Get metrics.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            failure_count: self.failure_count(),
            failure_threshold: self.failure_threshold,
            trips: self.trips(),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }

    /// Force reset the circuit breaker.
    pub fn reset(&self) {
        self.close();
        tracing::info!("Circuit breaker manually reset");
    }

    fn close(&self) {
        let mut state = self.state.write();
        self.failure_count.store(0, Ordering::Relaxed);
        *state = (CircuitState::Closed, None);
    }
}

/// Metrics for the circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub trips: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}
