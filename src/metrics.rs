//! Per-stage invocation metrics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Serialize, Serializer};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for one intercepted stage. Shared by every worker for the run.
#[derive(Debug, Default)]
pub struct StageMetrics {
    /// Number of `process` calls on the intercepted stage
    pub invocations: AtomicU64,

    /// Number of calls that reached the wrapped stage (includes retries)
    pub attempts: AtomicU64,

    /// Invocations that returned output
    pub successes: AtomicU64,

    /// Invocations that returned a failure
    pub failures: AtomicU64,

    /// Retries scheduled after transient failures
    pub retries: AtomicU64,

    /// Invocations rejected by an open circuit breaker
    pub short_circuits: AtomicU64,

    /// Time spent inside the wrapped stage (microseconds)
    pub busy_us: AtomicU64,
}

impl StageMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_short_circuit(&self) {
        self.short_circuits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in the wrapped stage.
    pub fn add_busy_time(&self, duration: Duration) {
        self.busy_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Zero every counter, ready for a new run.
    pub fn reset(&self) {
        for counter in [
            &self.invocations,
            &self.attempts,
            &self.successes,
            &self.failures,
            &self.retries,
            &self.short_circuits,
            &self.busy_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self, stage: &str) -> StageMetricsSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let busy_us = self.busy_us.load(Ordering::Relaxed);
        let busy = Duration::from_micros(busy_us);
        let mean_attempt = Duration::from_micros(busy_us.checked_div(attempts).unwrap_or(0));

        StageMetricsSnapshot {
            stage: stage.to_string(),
            invocations: self.invocations.load(Ordering::Relaxed),
            attempts,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            short_circuits: self.short_circuits.load(Ordering::Relaxed),
            busy,
            mean_attempt,
        }
    }
}

/// Snapshot of one stage's metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageMetricsSnapshot {
    pub stage: String,
    pub invocations: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub short_circuits: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub busy: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub mean_attempt: Duration,
}

impl std::fmt::Display for StageMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} calls, {} ok, {} failed, {} retries, {} short-circuited, {:.3}s busy",
            self.stage,
            self.invocations,
            self.successes,
            self.failures,
            self.retries,
            self.short_circuits,
            self.busy.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = StageMetrics::new();
        metrics.add_invocation();
        metrics.add_attempt();
        metrics.add_attempt();
        metrics.add_retry();
        metrics.add_success();
        metrics.add_busy_time(Duration::from_millis(4));

        let snap = metrics.snapshot("NUMBER");
        assert_eq!(snap.stage, "NUMBER");
        assert_eq!(snap.invocations, 1);
        assert_eq!(snap.attempts, 2);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.busy, Duration::from_millis(4));
        assert_eq!(snap.mean_attempt, Duration::from_millis(2));
    }

    #[test]
    fn test_snapshot_serializes_seconds() {
        let metrics = StageMetrics::new();
        metrics.add_attempt();
        metrics.add_busy_time(Duration::from_millis(500));
        let json = serde_json::to_value(metrics.snapshot("S")).unwrap();
        assert_eq!(json["busy"], 0.5);
        assert_eq!(json["stage"], "S");
    }

    #[test]
    fn test_mean_with_huge_attempt_count() {
        let metrics = StageMetrics::default();
        metrics.attempts.store(1 << 32, Ordering::Relaxed);
        metrics.add_busy_time(Duration::from_secs(1 << 20));
        let snap = metrics.snapshot("BIG");
        assert_eq!(snap.mean_attempt, Duration::from_micros((1u64 << 20) * 1_000_000 >> 32));
    }

    #[test]
    fn test_reset() {
        let metrics = StageMetrics::default();
        metrics.add_invocation();
        metrics.add_failure();
        metrics.add_busy_time(Duration::from_millis(3));
        metrics.reset();
        let snap = metrics.snapshot("R");
        assert_eq!(snap.invocations, 0);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.busy, Duration::ZERO);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = StageMetrics::default().snapshot("X");
        assert_eq!(snap.mean_attempt, Duration::ZERO);
        assert!(snap.to_string().starts_with("X: 0 calls"));
    }
}
