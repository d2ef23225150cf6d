//! Circuit breaker around the evaluation subsystem.
//!
//! After enough consecutive failures the breaker opens and evaluation fails
//! fast without touching the rule engine or the directory. Once the recovery
//! timeout has elapsed exactly one trial call is let through; its outcome
//! closes or re-opens the breaker.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::telemetry::GuardMetrics;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// One trial call allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    state: RwLock<CircuitState>,
    opened_at: RwLock<Option<Instant>>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    trial_in_flight: AtomicBool,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            state: RwLock::new(CircuitState::Closed),
            opened_at: RwLock::new(None),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            trial_in_flight: AtomicBool::new(false),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a call may proceed. In half-open only the first caller wins.
    pub fn can_execute(&self) -> bool {
        let allowed = match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.read();
                let elapsed = opened_at.map_or(true, |at| at.elapsed() >= self.recovery_timeout);
                if elapsed {
                    let mut state = self.state.write();
                    if *state == CircuitState::Open {
                        *state = CircuitState::HalfOpen;
                        self.trial_in_flight.store(false, Ordering::SeqCst);
                        self.publish(CircuitState::HalfOpen);
                        tracing::info!(breaker = self.name, "Circuit breaker transitioning to half-open");
                    }
                    drop(state);
                    self.claim_trial()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.claim_trial(),
        };

        if !allowed {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Admit one call. The returned [`Admission`] must be settled with its
    /// outcome; dropping it unsettled gives a half-open trial slot back.
    pub fn try_admit(&self) -> Option<Admission<'_>> {
        self.can_execute().then(|| Admission {
            breaker: self,
            settled: false,
        })
    }

    fn claim_trial(&self) -> bool {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);

        let mut state = self.state.write();
        if *state != CircuitState::Closed {
            *state = CircuitState::Closed;
            *self.opened_at.write() = None;
            self.trial_in_flight.store(false, Ordering::SeqCst);
            self.publish(CircuitState::Closed);
            tracing::info!(breaker = self.name, "Circuit breaker closed after successful recovery");
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write();
        match *state {
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                self.trial_in_flight.store(false, Ordering::SeqCst);
                self.publish(CircuitState::Open);
                tracing::warn!(breaker = self.name, "Circuit breaker re-opened after failed trial call");
            }
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    *state = CircuitState::Open;
                    *self.opened_at.write() = Some(Instant::now());
                    self.publish(CircuitState::Open);
                    tracing::warn!(
                        breaker = self.name,
                        failures,
                        threshold = self.failure_threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Give back an admitted call whose outcome says nothing about the
    /// subsystem's health (the caller cancelled it).
    pub fn abandon(&self) {
        if self.state() == CircuitState::HalfOpen {
            self.trial_in_flight.store(false, Ordering::SeqCst);
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            failure_threshold: self.failure_threshold,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        *self.state.write() = CircuitState::Closed;
        *self.opened_at.write() = None;
        self.trial_in_flight.store(false, Ordering::SeqCst);
        self.publish(CircuitState::Closed);
        tracing::info!(breaker = self.name, "Circuit breaker manually reset");
    }

    fn publish(&self, state: CircuitState) {
        GuardMetrics::circuit_state(self.name, state.gauge_value());
    }
}

/// A call let through by [`CircuitBreaker::try_admit`].
#[must_use = "an unsettled admission is abandoned when dropped"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Admission<'_> {
    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    pub fn abandon(self) {}
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon();
        }
    }
}

impl std::fmt::Debug for Admission<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("breaker", &self.breaker.name)
            .field("settled", &self.settled)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_on_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_dropped_admission_releases_trial() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        let trial = breaker.try_admit().unwrap();
        assert!(breaker.try_admit().is_none());
        drop(trial);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let retry = breaker.try_admit().unwrap();
        retry.succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_settled_admission_records_outcome() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        breaker.try_admit().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_admit().is_none());
    }

    #[test]
    fn test_reset() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        breaker.record_failure();
        assert!(!breaker.can_execute());

        breaker.reset();
        assert!(breaker.can_execute());
    }
}
