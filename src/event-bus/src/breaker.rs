//! # Circuit Breaker
//!
//! Per-subscriber circuit breaker guarding handlers from sustained
//! failure.
//!
//! State transitions:
//! - Closed → Open: when counted failures reach the threshold
//! - Open → HalfOpen: first `allow()` probe after the wait duration
//! - HalfOpen → Closed: when successes reach the permitted call count
//! - HalfOpen → Open: on any failure
//!
//! All counters and state are lock-free atomics. Every transition goes
//! through a compare-and-swap so exactly one thread observes each edge,
//! and counters reset on every state change.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::types::CircuitState;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

fn decode(raw: u8) -> CircuitState {
    match raw {
        OPEN => CircuitState::Open,
        HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

/// Point-in-time view of a breaker, for stats and admin surfaces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub subscriber_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last state transition
    pub since_transition_ms: u64,
    /// Milliseconds since the last counted failure, if any
    pub since_last_failure_ms: Option<u64>,
}

/// Circuit breaker for a single subscriber
pub struct CircuitBreaker {
    subscriber_id: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    /// Milliseconds since `epoch`; 0 means never
    last_failure_ms: AtomicU64,
    transition_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(subscriber_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            config,
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            transition_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// CAS-guarded state transition; the winner resets both counters
    fn transition(&self, from: u8, to: u8) -> Option<(CircuitState, CircuitState)> {
        if self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.failure_count.store(0, Ordering::Release);
            self.success_count.store(0, Ordering::Release);
            self.transition_ms.store(self.now_ms(), Ordering::Release);
            Some((decode(from), decode(to)))
        } else {
            None
        }
    }

    fn half_open_allows(&self) -> bool {
        self.success_count.load(Ordering::Acquire) < self.config.permitted_calls_in_half_open
    }

    /// Whether a delivery may proceed for this subscriber
    ///
    /// The first caller past the wait window performs the
    /// Open → HalfOpen probe transition.
    pub fn allow(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            HALF_OPEN => self.half_open_allows(),
            _open => {
                let waited = self
                    .now_ms()
                    .saturating_sub(self.transition_ms.load(Ordering::Acquire));
                if waited < self.config.wait_duration_in_open_state_ms {
                    return false;
                }
                if self.transition(OPEN, HALF_OPEN).is_some() {
                    info!(
                        subscriber_id = %self.subscriber_id,
                        "circuit breaker: open -> half-open"
                    );
                    true
                } else {
                    // Lost the probe race; defer to the current state
                    self.state.load(Ordering::Acquire) == HALF_OPEN && self.half_open_allows()
                }
            }
        }
    }

    /// Record a successful delivery; returns the transition edge, if any
    pub fn record_success(&self) -> Option<(CircuitState, CircuitState)> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => {
                self.failure_count.store(0, Ordering::Release);
                None
            }
            HALF_OPEN => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.permitted_calls_in_half_open {
                    let edge = self.transition(HALF_OPEN, CLOSED);
                    if edge.is_some() {
                        info!(
                            subscriber_id = %self.subscriber_id,
                            "circuit breaker: half-open -> closed"
                        );
                    }
                    edge
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Record a counted failure; returns the transition edge, if any
    pub fn record_failure(&self) -> Option<(CircuitState, CircuitState)> {
        self.last_failure_ms.store(self.now_ms().max(1), Ordering::Release);

        match self.state.load(Ordering::Acquire) {
            CLOSED => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    let edge = self.transition(CLOSED, OPEN);
                    if edge.is_some() {
                        warn!(
                            subscriber_id = %self.subscriber_id,
                            failures,
                            "circuit breaker: closed -> open"
                        );
                    }
                    edge
                } else {
                    None
                }
            }
            HALF_OPEN => {
                let edge = self.transition(HALF_OPEN, OPEN);
                if edge.is_some() {
                    warn!(
                        subscriber_id = %self.subscriber_id,
                        "circuit breaker: half-open -> open (probe failed)"
                    );
                }
                edge
            }
            _ => None,
        }
    }

    /// Administratively force the breaker open
    pub fn force_open(&self) {
        self.state.store(OPEN, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.transition_ms.store(self.now_ms(), Ordering::Release);
        warn!(subscriber_id = %self.subscriber_id, "circuit breaker forced open");
    }

    /// Administratively force the breaker closed
    pub fn force_close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.transition_ms.store(self.now_ms(), Ordering::Release);
        info!(subscriber_id = %self.subscriber_id, "circuit breaker forced closed");
    }

    /// Reset to the initial closed state
    pub fn reset(&self) {
        self.force_close();
        self.last_failure_ms.store(0, Ordering::Release);
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Point-in-time view for stats and admin surfaces
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.now_ms();
        let last_failure = self.last_failure_ms.load(Ordering::Acquire);
        CircuitBreakerSnapshot {
            subscriber_id: self.subscriber_id.clone(),
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            since_transition_ms: now.saturating_sub(self.transition_ms.load(Ordering::Acquire)),
            since_last_failure_ms: if last_failure == 0 {
                None
            } else {
                Some(now.saturating_sub(last_failure))
            },
        }
    }
}

/// Registry holding one breaker per subscriber id
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for the given subscriber, created on first use
    pub fn breaker_for(&self, subscriber_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(subscriber_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(subscriber_id, self.config.clone()))
            })
            .clone()
    }

    /// Breaker for the given subscriber, if one exists
    pub fn get(&self, subscriber_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(subscriber_id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshots of all known breakers
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }

    /// Reset every breaker to the closed state
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(threshold: u32, wait_ms: u64, permitted: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            wait_duration_in_open_state_ms: wait_ms,
            permitted_calls_in_half_open: permitted,
            record_failure_kinds: None,
        }
    }

    #[test]
    fn test_closed_to_open_on_threshold() {
        let breaker = CircuitBreaker::new("w", test_config(3, 60_000, 2));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());

        let edge = breaker.record_failure();
        assert_eq!(edge, Some((CircuitState::Closed, CircuitState::Open)));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failure_count_in_closed() {
        let breaker = CircuitBreaker::new("w", test_config(2, 60_000, 2));

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_to_half_open_after_wait() {
        let breaker = CircuitBreaker::new("w", test_config(1, 50, 2));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());

        tokio::time::sleep(Duration::from_millis(80)).await;

        // The probe transition happens inside allow()
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_to_closed_with_counters_reset() {
        let breaker = CircuitBreaker::new("w", test_config(1, 50, 2));

        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.allow());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let edge = breaker.record_success();
        assert_eq!(edge, Some((CircuitState::HalfOpen, CircuitState::Closed)));
        assert_eq!(breaker.state(), CircuitState::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_to_open_on_failure() {
        let breaker = CircuitBreaker::new("w", test_config(1, 50, 2));

        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.allow());

        let edge = breaker.record_failure();
        assert_eq!(edge, Some((CircuitState::HalfOpen, CircuitState::Open)));
        assert!(!breaker.allow());
    }

    #[test]
    fn test_force_open_and_reset() {
        let breaker = CircuitBreaker::new("w", test_config(5, 60_000, 2));

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
        assert!(breaker.snapshot().since_last_failure_ms.is_none());
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = CircuitBreakerRegistry::new(test_config(1, 60_000, 2));

        let a = registry.breaker_for("order-worker");
        a.record_failure();

        let b = registry.breaker_for("order-worker");
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(registry.snapshots().len(), 1);

        registry.reset_all();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_only_one_probe_transition() {
        let breaker = Arc::new(CircuitBreaker::new("w", test_config(1, 20, 1)));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let breaker = breaker.clone();
            handles.push(std::thread::spawn(move || breaker.allow()));
        }
        for handle in handles {
            let _ = handle.join().unwrap();
        }

        // Regardless of the race winner, the machine settled in half-open
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
