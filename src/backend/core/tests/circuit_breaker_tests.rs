//! Unit tests for audit storage circuit breaker state transitions.
//!
//! Tests cover:
//! - State transitions (Closed -> Open -> Closed)
//! - Failure threshold triggering
//! - Cool-down reset behavior
//! - Success/failure recording
//! - Metrics tracking
//! - Concurrent access

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chronicle_core::audit::{CircuitBreaker, CircuitState};

// ============================================================================
// Creation
// ============================================================================

#[test]
fn test_circuit_breaker_creation_default_state() {
    let breaker = CircuitBreaker::new(3);

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.can_execute());
    assert_eq!(breaker.failure_count(), 0);
}

#[test]
fn test_circuit_breaker_various_thresholds() {
    for threshold in [1, 3, 5, 10] {
        let breaker = CircuitBreaker::new(threshold);
        for _ in 0..threshold - 1 {
            assert!(!breaker.record_failure());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}

#[test]
fn test_zero_threshold_behaves_as_one() {
    let breaker = CircuitBreaker::new(0);
    assert!(breaker.record_failure());
    assert_eq!(breaker.state(), CircuitState::Open);
}

// ============================================================================
// Transitions
// ============================================================================

#[test]
fn test_success_between_failures_prevents_trip() {
    let breaker = CircuitBreaker::new(3);

    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 2);
}

#[test]
fn test_failures_while_open_do_not_retrip() {
    let breaker = CircuitBreaker::new(2);
    breaker.record_failure();
    breaker.record_failure();
    assert!(!breaker.record_failure());
    assert_eq!(breaker.trips(), 1);
}

#[test]
fn test_success_closes_open_breaker() {
    let breaker = CircuitBreaker::new(1);
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.can_execute());
}

#[tokio::test(start_paused = true)]
async fn test_full_reset_after_cool_down() {
    let breaker = CircuitBreaker::new(3).with_cool_down(Duration::from_secs(60));
    for _ in 0..3 {
        breaker.record_failure();
    }
    assert!(!breaker.can_execute());

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);

    // A fresh run of failures is needed to trip again.
    assert!(!breaker.record_failure());
    assert!(!breaker.record_failure());
    assert!(breaker.record_failure());
    assert_eq!(breaker.trips(), 2);
}

#[test]
fn test_zero_cool_down_resets_immediately() {
    let breaker = CircuitBreaker::new(1).with_cool_down(Duration::ZERO);
    assert!(breaker.record_failure());
    assert_eq!(breaker.trips(), 1);
    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_state_reports_closed_once_cool_down_elapses() {
    let breaker = CircuitBreaker::new(2).with_cool_down(Duration::from_secs(60));
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(breaker.metrics().state, CircuitState::Open);

    // No write in between: reading the state alone applies the reset.
    tokio::time::advance(Duration::from_secs(1)).await;
    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.failure_count, 0);
    assert_eq!(metrics.trips, 1);
}

// ============================================================================
// Metrics
// ============================================================================

#[test]
fn test_metrics_track_totals() {
    let breaker = CircuitBreaker::new(2);
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_failure();

    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Open);
    assert_eq!(metrics.failure_threshold, 2);
    assert_eq!(metrics.total_successes, 1);
    assert_eq!(metrics.total_failures, 3);
    assert_eq!(metrics.trips, 1);

    let value = serde_json::to_value(&metrics).unwrap();
    assert_eq!(value["state"], "open");
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_failures_trip_once() {
    let breaker = Arc::new(CircuitBreaker::new(5));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let breaker = breaker.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    breaker.record_failure();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.trips(), 1);
    assert_eq!(breaker.metrics().total_failures, 100);
}
