//! Hooks run around intercepted stage calls.
//!
//! Hooks observe; they never change a stage's result. A hook that fails is
//! logged and the invocation carries on.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::StageFailure;
use crate::record::Record;

/// A hook could not do its job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// State of one intercepted invocation, visible to hooks.
#[derive(Debug)]
pub struct InterceptionContext<'a> {
    pub stage: &'a str,
    pub input: &'a Record,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
    started: Instant,
    attempt_started: Instant,
}

impl<'a> InterceptionContext<'a> {
    pub fn new(stage: &'a str, input: &'a Record, max_attempts: u32) -> Self {
        let now = Instant::now();
        Self {
            stage,
            input,
            attempt: 1,
            max_attempts,
            started_at: Utc::now(),
            started: now,
            attempt_started: now,
        }
    }

    pub(crate) fn begin_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.attempt_started = Instant::now();
    }

    pub fn line(&self) -> u64 {
        self.input.line()
    }

    /// Time since the invocation started, across all attempts.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since the current attempt started.
    pub fn attempt_elapsed(&self) -> Duration {
        self.attempt_started.elapsed()
    }

    pub fn retries_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

/// Observer attached to an intercepted stage.
///
/// `before` runs once per invocation, `after` once on success, and
/// `on_error` after every failed attempt. A call rejected by an open
/// circuit gets `before` and `on_error` too.
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn before(&self, _ctx: &InterceptionContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    fn after(&self, _ctx: &InterceptionContext<'_>, _output: &[Record]) -> Result<(), HookError> {
        Ok(())
    }

    fn on_error(
        &self,
        _ctx: &InterceptionContext<'_>,
        _failure: &StageFailure,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Logs every invocation through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

impl Hook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    fn before(&self, ctx: &InterceptionContext<'_>) -> Result<(), HookError> {
        debug!(stage = ctx.stage, line = ctx.line(), "entering stage");
        Ok(())
    }

    fn after(&self, ctx: &InterceptionContext<'_>, output: &[Record]) -> Result<(), HookError> {
        debug!(
            stage = ctx.stage,
            line = ctx.line(),
            attempt = ctx.attempt,
            outputs = output.len(),
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "leaving stage"
        );
        Ok(())
    }

    fn on_error(
        &self,
        ctx: &InterceptionContext<'_>,
        failure: &StageFailure,
    ) -> Result<(), HookError> {
        info!(
            stage = ctx.stage,
            line = ctx.line(),
            attempt = ctx.attempt,
            kind = %failure.kind,
            message = %failure.message,
            "stage failed"
        );
        Ok(())
    }
}
