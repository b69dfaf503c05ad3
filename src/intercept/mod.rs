//! Declarative interception around stage calls.
//!
//! [`intercept`] wraps a stage with an [`InterceptPolicy`] and returns an
//! [`Intercepted`] stage. The wrapper adds timing, logging, retry with
//! exponential backoff, a circuit breaker, a per-call timeout and simulated
//! latency, in that nesting order, without the wrapped stage knowing.
//!
//! ```text
//! before hooks
//!   ├─ breaker open?  ─► on_error hooks ─► CircuitOpen (stage not called)
//!   └─ attempt 1..=max_attempts
//!        ├─ [latency] + stage.process   (watchdog thread if timeout_ms)
//!        ├─ Ok            ─► after hooks ─► output
//!        └─ Err           ─► on_error hooks
//!             ├─ transient, attempts left ─► sleep backoff ─► next attempt
//!             └─ otherwise ─────────────────► failure
//! ```

mod breaker;
mod events;
mod hooks;

pub use breaker::CircuitBreaker;
pub use events::{EventSink, InterceptEvent, MemorySink, NoopSink, TracingSink};
pub use hooks::{Hook, HookError, InterceptionContext, LoggingHook};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorKind, StageFailure};
use crate::metrics::StageMetrics;
use crate::record::Record;
use crate::stage::{Stage, StageResult};

/// Upper bound on any single backoff delay.
const MAX_RETRY_DELAY_MS: u64 = 3_600_000;

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_latency_min_ms() -> u64 {
    50
}

fn default_latency_max_ms() -> u64 {
    200
}

/// Retry transient failures with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total invocations, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let ms = calculate_backoff_delay(
            attempt.saturating_sub(1),
            self.base_delay_ms,
            self.backoff_multiplier,
        );
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Calculate exponential backoff delay for a given attempt number.
///
/// Formula: delay = base_delay * (backoff_multiplier ^ attempt), with
/// `attempt` 0-indexed. Capped at one hour.
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, backoff_multiplier: f64) -> u64 {
    let delay = (base_delay_ms as f64) * backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    if !delay.is_finite() || delay > MAX_RETRY_DELAY_MS as f64 {
        MAX_RETRY_DELAY_MS
    } else {
        delay as u64
    }
}

/// Open the circuit after `threshold` consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakPolicy {
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Treat parse and validation failures as a healthy call instead of
    /// counting them.
    #[serde(default)]
    pub ignore_data_errors: bool,
}

impl Default for CircuitBreakPolicy {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            cooldown_ms: default_cooldown_ms(),
            ignore_data_errors: false,
        }
    }
}

impl CircuitBreakPolicy {
    /// Whether a failure of `kind` counts towards opening the circuit.
    pub fn counts(&self, kind: ErrorKind) -> bool {
        !(self.ignore_data_errors && kind.is_data_error())
    }
}

/// Sleep a random duration before each call, standing in for a slow
/// external dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatencyPolicy {
    #[serde(default = "default_latency_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_latency_max_ms")]
    pub max_ms: u64,
}

impl Default for LatencyPolicy {
    fn default() -> Self {
        Self {
            min_ms: default_latency_min_ms(),
            max_ms: default_latency_max_ms(),
        }
    }
}

impl LatencyPolicy {
    fn sleep(&self) {
        let ms = if self.max_ms > self.min_ms {
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        thread::sleep(Duration::from_millis(ms));
    }
}

/// What to wrap around a stage. All options default to off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterceptPolicy {
    /// Record time spent in the stage into its metrics.
    pub timing: bool,
    /// Log entry, exit and failures of every call.
    pub logging: bool,
    pub retry: Option<RetryPolicy>,
    pub circuit_break: Option<CircuitBreakPolicy>,
    pub timeout_ms: Option<u64>,
    pub latency: Option<LatencyPolicy>,
}

impl InterceptPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timing(mut self) -> Self {
        self.timing = true;
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..RetryPolicy::default()
        });
        self
    }

    pub fn with_circuit_break(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_break = Some(CircuitBreakPolicy {
            threshold,
            cooldown_ms: cooldown.as_millis() as u64,
            ignore_data_errors: false,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = Some(LatencyPolicy {
            min_ms: min.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        });
        self
    }

    /// Total invocations allowed per record.
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts)
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err("retry.max_attempts must be at least 1".to_string());
            }
            if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
                return Err(format!(
                    "retry.backoff_multiplier must be >= 1.0, got {}",
                    retry.backoff_multiplier
                ));
            }
        }
        if self.circuit_break.as_ref().is_some_and(|b| b.threshold == 0) {
            return Err("circuit_break.threshold must be at least 1".to_string());
        }
        if self.timeout_ms == Some(0) {
            return Err("timeout_ms must be greater than 0".to_string());
        }
        if let Some(latency) = &self.latency {
            if latency.min_ms > latency.max_ms {
                return Err(format!(
                    "latency.min_ms ({}) exceeds latency.max_ms ({})",
                    latency.min_ms, latency.max_ms
                ));
            }
        }
        Ok(())
    }
}

/// Wrap `stage` with the behaviour described by `policy`.
pub fn intercept<S: Stage + 'static>(stage: S, policy: InterceptPolicy) -> Intercepted {
    Intercepted::new(Arc::new(stage), policy)
}

/// A stage wrapped by the interception layer.
pub struct Intercepted {
    inner: Arc<dyn Stage>,
    name: String,
    policy: InterceptPolicy,
    breaker: Option<CircuitBreaker>,
    hooks: Vec<Box<dyn Hook>>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<StageMetrics>,
}

impl Intercepted {
    pub fn new(inner: Arc<dyn Stage>, policy: InterceptPolicy) -> Self {
        let breaker = policy
            .circuit_break
            .as_ref()
            .map(|b| CircuitBreaker::new(b.threshold, Duration::from_millis(b.cooldown_ms)));
        let mut hooks: Vec<Box<dyn Hook>> = Vec::new();
        if policy.logging {
            hooks.push(Box::new(LoggingHook));
        }
        Self {
            name: inner.name().to_string(),
            inner,
            policy,
            breaker,
            hooks,
            sink: Arc::new(TracingSink),
            metrics: StageMetrics::new(),
        }
    }

    /// Attach a hook. Hooks run in registration order.
    pub fn with_hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &InterceptPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<StageMetrics> {
        &self.metrics
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Start a fresh run: close the breaker, zero the metrics and drop
    /// anything a previous, unflushed run left in the wrapped stage.
    pub fn begin_run(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.reset();
        }
        self.metrics.reset();
        let stale = self.inner.flush();
        if !stale.is_empty() {
            debug!(stage = %self.name, records = stale.len(), "discarded unflushed records");
        }
    }

    fn run_hooks<F>(&self, f: F)
    where
        F: Fn(&dyn Hook) -> Result<(), HookError>,
    {
        for hook in &self.hooks {
            if let Err(e) = f(hook.as_ref()) {
                warn!(stage = %self.name, hook = hook.name(), error = %e, "hook failed, ignoring");
                self.sink.emit(InterceptEvent::HookFailed {
                    stage: self.name.clone(),
                    hook: hook.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// One call into the wrapped stage. A panic becomes a permanent failure.
    fn invoke(&self, record: Record) -> StageResult {
        let fallback = record.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| self.invoke_bounded(record))) {
            Ok(result) => result,
            Err(_) => {
                warn!(stage = %self.name, line = fallback.line(), "stage panicked");
                Err(StageFailure::permanent("stage panicked", fallback))
            }
        }
    }

    /// One call into the wrapped stage, bounded by the timeout if set.
    fn invoke_bounded(&self, record: Record) -> StageResult {
        let Some(timeout_ms) = self.policy.timeout_ms else {
            if let Some(latency) = &self.policy.latency {
                latency.sleep();
            }
            return self.inner.process(record);
        };

        let limit = Duration::from_millis(timeout_ms);
        let fallback = record.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner = Arc::clone(&self.inner);
        let latency = self.policy.latency.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-call", self.name))
            .spawn(move || {
                if let Some(latency) = latency {
                    latency.sleep();
                }
                // Receiver is gone if the call overran.
                let _ = tx.send(inner.process(record));
            });
        if let Err(e) = spawned {
            return Err(StageFailure::transient(
                format!("cannot start stage call: {e}"),
                fallback,
            ));
        }

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StageFailure::new(
                ErrorKind::Timeout,
                format!("no result within {timeout_ms} ms"),
                fallback,
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StageFailure::permanent("stage panicked", fallback))
            }
        }
    }
}

impl Stage for Intercepted {
    fn process(&self, record: Record) -> StageResult {
        self.metrics.add_invocation();
        let line = record.line();

        let max_attempts = self.policy.max_attempts();
        let mut ctx = InterceptionContext::new(&self.name, &record, max_attempts);
        self.run_hooks(|h| h.before(&ctx));

        if self.breaker.as_ref().is_some_and(|b| !b.admit()) {
            self.metrics.add_short_circuit();
            self.metrics.add_failure();
            self.sink.emit(InterceptEvent::ShortCircuited {
                stage: self.name.clone(),
                line,
            });
            let failure = StageFailure::new(
                ErrorKind::CircuitOpen,
                format!("circuit open for {}", self.name),
                record.clone(),
            )
            .in_stage(&self.name);
            self.run_hooks(|h| h.on_error(&ctx, &failure));
            return Err(failure);
        }

        self.sink.emit(InterceptEvent::Started {
            stage: self.name.clone(),
            line,
        });

        let mut attempt = 1;
        loop {
            ctx.begin_attempt(attempt);
            self.metrics.add_attempt();
            let started = Instant::now();
            let result = self.invoke(record.clone());
            if self.policy.timing {
                let took = started.elapsed();
                self.metrics.add_busy_time(took);
                debug!(stage = %self.name, line, attempt, took_us = took.as_micros() as u64, "timed");
            }

            match result {
                Ok(output) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    self.metrics.add_success();
                    self.run_hooks(|h| h.after(&ctx, &output));
                    self.sink.emit(InterceptEvent::Succeeded {
                        stage: self.name.clone(),
                        line,
                        attempts: attempt,
                        outputs: output.len(),
                        elapsed_us: ctx.elapsed().as_micros() as u64,
                    });
                    return Ok(output);
                }
                Err(failure) => {
                    let failure = failure.in_stage(&self.name);
                    self.run_hooks(|h| h.on_error(&ctx, &failure));

                    let retry = self
                        .policy
                        .retry
                        .as_ref()
                        .filter(|_| failure.kind.is_transient() && attempt < max_attempts);
                    if let Some(retry) = retry {
                        let delay = retry.delay_after(attempt);
                        self.metrics.add_retry();
                        self.sink.emit(InterceptEvent::Retrying {
                            stage: self.name.clone(),
                            line,
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }

                    if let (Some(breaker), Some(policy)) =
                        (&self.breaker, &self.policy.circuit_break)
                    {
                        if policy.counts(failure.kind) {
                            breaker.record_failure();
                        } else {
                            breaker.record_success();
                        }
                    }
                    self.metrics.add_failure();
                    self.sink.emit(InterceptEvent::Failed {
                        stage: self.name.clone(),
                        line,
                        attempts: attempt,
                        kind: failure.kind,
                        message: failure.message.clone(),
                    });
                    return Err(failure);
                }
            }
        }
    }

    fn commit(&self, input: &Record) {
        self.inner.commit(input)
    }

    fn flush(&self) -> Vec<Record> {
        self.inner.flush()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::stage_fn;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rec(line: u64) -> Record {
        Record::from_pairs(line, [("id", line.to_string())])
    }

    /// A stage that fails with `kind` for its first `failures` calls.
    fn flaky(
        kind: ErrorKind,
        failures: u32,
        calls: Arc<AtomicU32>,
    ) -> impl Stage + 'static {
        stage_fn("FLAKY", move |r: Record| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(StageFailure::new(kind, format!("call {n}"), r))
            } else {
                Ok(vec![r])
            }
        })
    }

    #[test]
    fn test_retry_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = intercept(
            flaky(ErrorKind::TransientIo, u32::MAX, calls.clone()),
            InterceptPolicy::new().with_retry(3, Duration::ZERO),
        )
        .with_sink(Arc::new(NoopSink));

        let err = stage.process(rec(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransientIo);
        assert_eq!(err.stage, "FLAKY");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snap = stage.metrics().snapshot("FLAKY");
        assert_eq!(snap.invocations, 1);
        assert_eq!(snap.attempts, 3);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.failures, 1);
    }

    #[test]
    fn test_retry_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = intercept(
            flaky(ErrorKind::TransientIo, 2, calls.clone()),
            InterceptPolicy::new().with_retry(3, Duration::from_millis(1)),
        );
        let out = stage.process(rec(4)).unwrap();
        assert_eq!(out, vec![rec(4)]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        for kind in [ErrorKind::Validation, ErrorKind::PermanentStageFailure] {
            let calls = Arc::new(AtomicU32::new(0));
            let stage = intercept(
                flaky(kind, u32::MAX, calls.clone()),
                InterceptPolicy::new().with_retry(5, Duration::ZERO),
            );
            assert_eq!(stage.process(rec(1)).unwrap_err().kind, kind);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_no_retry_without_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = intercept(
            flaky(ErrorKind::TransientIo, u32::MAX, calls.clone()),
            InterceptPolicy::new(),
        );
        assert!(stage.process(rec(1)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_circuit_break_and_cooldown() {
        let calls = Arc::new(AtomicU32::new(0));
        let sink = Arc::new(MemorySink::new());
        let hook = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let stage = intercept(
            flaky(ErrorKind::PermanentStageFailure, u32::MAX, calls.clone()),
            InterceptPolicy::new().with_circuit_break(2, Duration::from_millis(50)),
        )
        .with_sink(sink.clone())
        .with_hook(hook.clone());

        assert_eq!(stage.process(rec(1)).unwrap_err().kind, ErrorKind::PermanentStageFailure);
        assert_eq!(stage.process(rec(2)).unwrap_err().kind, ErrorKind::PermanentStageFailure);
        let err = stage.process(rec(3)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(err.stage, "FLAKY");
        assert_eq!(err.record, rec(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Short-circuited calls still run the hooks.
        assert_eq!(
            hook.calls.lock().unwrap()[4..],
            ["before:1".to_string(), "error:1:circuit_open".to_string()]
        );

        thread::sleep(Duration::from_millis(70));
        // Half-open trial reaches the stage, fails and reopens the circuit.
        assert_eq!(stage.process(rec(4)).unwrap_err().kind, ErrorKind::PermanentStageFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stage.process(rec(5)).unwrap_err().kind, ErrorKind::CircuitOpen);

        let short = sink
            .events()
            .iter()
            .filter(|e| matches!(e, InterceptEvent::ShortCircuited { .. }))
            .count();
        assert_eq!(short, 2);
        assert_eq!(stage.metrics().snapshot("FLAKY").short_circuits, 2);
    }

    #[test]
    fn test_validation_failures_open_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = intercept(
            flaky(ErrorKind::Validation, u32::MAX, calls.clone()),
            InterceptPolicy::new().with_circuit_break(2, Duration::from_secs(60)),
        );
        for line in 1..=2 {
            assert_eq!(stage.process(rec(line)).unwrap_err().kind, ErrorKind::Validation);
        }
        assert_eq!(stage.process(rec(3)).unwrap_err().kind, ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ignored_data_errors_keep_circuit_closed() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = InterceptPolicy::new().with_circuit_break(1, Duration::from_secs(60));
        if let Some(breaker) = policy.circuit_break.as_mut() {
            breaker.ignore_data_errors = true;
        }
        let stage = intercept(flaky(ErrorKind::Validation, u32::MAX, calls.clone()), policy);
        for line in 1..=5 {
            assert_eq!(stage.process(rec(line)).unwrap_err().kind, ErrorKind::Validation);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(stage.breaker().is_some_and(|b| !b.is_open()));
    }

    #[test]
    fn test_panic_in_trial_call_reopens_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let stage = intercept(
            stage_fn("FRAGILE", move |r: Record| match counted.fetch_add(1, Ordering::SeqCst) {
                0 => Err(StageFailure::permanent("down", r)),
                1 => panic!("trial blew up"),
                _ => Ok(vec![r]),
            }),
            InterceptPolicy::new().with_circuit_break(1, Duration::from_millis(10)),
        );

        assert_eq!(stage.process(rec(1)).unwrap_err().kind, ErrorKind::PermanentStageFailure);
        thread::sleep(Duration::from_millis(30));
        let err = stage.process(rec(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermanentStageFailure);
        assert_eq!(err.message, "stage panicked");
        assert!(stage.breaker().is_some_and(|b| b.is_open()));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(stage.process(rec(3)).unwrap(), vec![rec(3)]);
        assert_eq!(stage.process(rec(4)).unwrap(), vec![rec(4)]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_begin_run_resets_state() {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = intercept(
            flaky(ErrorKind::PermanentStageFailure, 1, calls),
            InterceptPolicy::new().with_circuit_break(1, Duration::from_secs(60)),
        );
        assert!(stage.process(rec(1)).is_err());
        assert!(stage.breaker().is_some_and(|b| b.is_open()));

        stage.begin_run();
        assert!(stage.breaker().is_some_and(|b| !b.is_open()));
        assert_eq!(stage.metrics().snapshot("FLAKY").invocations, 0);
        assert_eq!(stage.process(rec(2)).unwrap(), vec![rec(2)]);
    }

    #[test]
    fn test_timeout() {
        let slow = stage_fn("SLOW", |r: Record| {
            thread::sleep(Duration::from_millis(300));
            Ok(vec![r])
        });
        let stage = intercept(slow, InterceptPolicy::new().with_timeout(Duration::from_millis(20)));
        let started = Instant::now();
        let err = stage.process(rec(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.stage, "SLOW");
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_timed_out_call_is_not_aggregated() {
        let stage = intercept(
            crate::stages::AggregateStage::new("user", "score"),
            InterceptPolicy::new()
                .with_timeout(Duration::from_millis(20))
                .with_latency(Duration::from_millis(60), Duration::from_millis(60)),
        );
        let input = Record::from_pairs(1, [("user", "u"), ("score", "1")]);
        let err = stage.process(input).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);

        // Let the abandoned call finish.
        thread::sleep(Duration::from_millis(150));
        assert!(stage.flush().is_empty());
    }

    #[test]
    fn test_timeout_passes_fast_calls() {
        let fast = stage_fn("FAST", |r: Record| Ok(vec![r]));
        let stage = intercept(fast, InterceptPolicy::new().with_timeout(Duration::from_secs(5)));
        assert_eq!(stage.process(rec(2)).unwrap(), vec![rec(2)]);
    }

    #[test]
    fn test_timeouts_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let sometimes_slow = stage_fn("SOMETIMES", move |r: Record| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(200));
            }
            Ok(vec![r])
        });
        let stage = intercept(
            sometimes_slow,
            InterceptPolicy::new()
                .with_timeout(Duration::from_millis(30))
                .with_retry(2, Duration::ZERO),
        );
        assert!(stage.process(rec(1)).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct Recording {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Hook for Arc<Recording> {
        fn name(&self) -> &str {
            "recording"
        }

        fn before(&self, ctx: &InterceptionContext<'_>) -> Result<(), HookError> {
            self.push(format!("before:{}", ctx.attempt))
        }

        fn after(&self, ctx: &InterceptionContext<'_>, out: &[Record]) -> Result<(), HookError> {
            self.push(format!("after:{}:{}", ctx.attempt, out.len()))
        }

        fn on_error(
            &self,
            ctx: &InterceptionContext<'_>,
            failure: &StageFailure,
        ) -> Result<(), HookError> {
            self.push(format!("error:{}:{}", ctx.attempt, failure.kind))
        }
    }

    impl Recording {
        fn push(&self, entry: String) -> Result<(), HookError> {
            self.calls.lock().unwrap().push(entry);
            if self.fail {
                Err(HookError::new("boom"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_hook_order() {
        let calls = Arc::new(AtomicU32::new(0));
        let hook = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let stage = intercept(
            flaky(ErrorKind::TransientIo, 1, calls),
            InterceptPolicy::new().with_retry(2, Duration::ZERO),
        )
        .with_hook(hook.clone());

        stage.process(rec(1)).unwrap();
        assert_eq!(
            *hook.calls.lock().unwrap(),
            vec!["before:1", "error:1:transient_io", "after:2:1"]
        );
    }

    #[test]
    fn test_failing_hook_is_suppressed() {
        let sink = Arc::new(MemorySink::new());
        let hook = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let double = |r: Record| -> StageResult { Ok(vec![r.clone(), r]) };
        let plain = intercept(stage_fn("DOUBLE", double), InterceptPolicy::new());
        let hooked = intercept(stage_fn("DOUBLE", double), InterceptPolicy::new().with_logging())
            .with_hook(hook)
            .with_sink(sink.clone());

        assert_eq!(hooked.process(rec(3)), plain.process(rec(3)));
        let failed_hooks = sink
            .events()
            .iter()
            .filter(|e| matches!(e, InterceptEvent::HookFailed { .. }))
            .count();
        assert_eq!(failed_hooks, 2);
    }

    #[test]
    fn test_timing_and_latency() {
        let stage = intercept(
            stage_fn("ECHO", |r: Record| Ok(vec![r])),
            InterceptPolicy::new()
                .with_timing()
                .with_latency(Duration::from_millis(5), Duration::from_millis(5)),
        );
        stage.process(rec(1)).unwrap();
        let snap = stage.metrics().snapshot("ECHO");
        assert!(snap.busy >= Duration::from_millis(5));
        assert_eq!(snap.successes, 1);
    }

    #[test]
    fn test_backoff_delays() {
        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 300,
        };
        assert_eq!(retry.delay_after(1), Duration::from_millis(100));
        assert_eq!(retry.delay_after(2), Duration::from_millis(200));
        assert_eq!(retry.delay_after(3), Duration::from_millis(300));
        assert_eq!(calculate_backoff_delay(100, 1000, 10.0), MAX_RETRY_DELAY_MS);
    }

    #[test]
    fn test_policy_validation() {
        assert!(InterceptPolicy::new().validate().is_ok());
        assert!(InterceptPolicy::new().with_retry(0, Duration::ZERO).validate().is_err());
        assert!(
            InterceptPolicy::new()
                .with_circuit_break(0, Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(InterceptPolicy::new().with_timeout(Duration::ZERO).validate().is_err());
        assert!(
            InterceptPolicy::new()
                .with_latency(Duration::from_millis(9), Duration::from_millis(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_policy_from_yaml() {
        let yaml = "logging: true\nretry:\n  max_attempts: 4\ncircuit_break:\n  threshold: 2\n  ignore_data_errors: true\ntimeout_ms: 250\n";
        let policy: InterceptPolicy = serde_yaml::from_str(yaml).unwrap();
        assert!(policy.logging);
        assert!(!policy.timing);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.retry.unwrap().base_delay_ms, 100);
        let breaker = policy.circuit_break.unwrap();
        assert_eq!(breaker.cooldown_ms, 30_000);
        assert!(breaker.ignore_data_errors);
        assert!(!breaker.counts(ErrorKind::Validation));
        assert!(breaker.counts(ErrorKind::Timeout));
        assert_eq!(policy.timeout_ms, Some(250));
    }
}
