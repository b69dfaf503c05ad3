//! Circuit breaker shared by every invocation of one intercepted stage.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    /// One trial call is in flight after the cool-down.
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// Each transition happens under a single lock so concurrent workers never
/// double-count a failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a call may go through now. Moves an expired open breaker to
    /// half-open and admits exactly one trial call.
    pub fn admit(&self) -> bool {
        let mut state = self.state();
        match *state {
            State::Closed { .. } => true,
            State::Open { until } if Instant::now() >= until => {
                *state = State::HalfOpen;
                true
            }
            State::Open { .. } | State::HalfOpen => false,
        }
    }

    /// A call completed with a healthy stage.
    pub fn record_success(&self) {
        *self.state() = State::Closed { failures: 0 };
    }

    /// A call failed in a way that counts against the stage's health.
    pub fn record_failure(&self) {
        let mut state = self.state();
        *state = match *state {
            State::Closed { failures } if failures + 1 < self.threshold => State::Closed {
                failures: failures + 1,
            },
            State::Closed { .. } | State::HalfOpen => State::Open {
                until: Instant::now() + self.cooldown,
            },
            open @ State::Open { .. } => open,
        };
    }

    /// Forget all history and close the circuit.
    pub fn reset(&self) {
        *self.state() = State::Closed { failures: 0 };
    }

    pub fn is_open(&self) -> bool {
        !matches!(*self.state(), State::Closed { .. })
    }

    /// Consecutive failures counted while closed.
    pub fn failures(&self) -> u32 {
        match *self.state() {
            State::Closed { failures } => failures,
            _ => self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            assert!(breaker.admit());
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
        assert_eq!(breaker.failures(), 2);
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.admit());
    }

    #[test]
    fn test_success_resets_streak() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_half_open_admits_one_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(!breaker.admit());
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.admit());
        assert!(!breaker.admit());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.admit());
    }

    #[test]
    fn test_reset_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        assert!(!breaker.admit());
        breaker.reset();
        assert!(breaker.admit());
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.admit());
        breaker.record_failure();
        assert!(!breaker.admit());
    }
}
