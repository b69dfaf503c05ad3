//! Error types for csvpipe.
//!
//! Two layers of failure exist. Per-record failures ([`StageFailure`],
//! [`Malformed`](crate::csv::Malformed)) are collected into the run's error
//! report and never stop a run. Stream-level failures ([`PipelineError`])
//! abort the run and propagate to the caller.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::record::{Record, ValidationStatus};

/// Classification of a per-record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The CSV row itself could not be decoded.
    Parse,
    /// The record violates a stage's business rule.
    Validation,
    /// An I/O hiccup that may succeed on retry.
    TransientIo,
    /// The invocation exceeded its deadline.
    Timeout,
    /// The stage failed and retrying will not help.
    PermanentStageFailure,
    /// The stage's circuit breaker is open; the stage was not called.
    CircuitOpen,
}

impl ErrorKind {
    /// Transient failures are eligible for retry.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::TransientIo | ErrorKind::Timeout)
    }

    /// Failures caused by the record's content rather than the stage.
    pub fn is_data_error(self) -> bool {
        matches!(self, ErrorKind::Parse | ErrorKind::Validation)
    }

    /// Stable snake_case name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PermanentStageFailure => "permanent_stage_failure",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage rejected a record.
///
/// Carries the originating record so the orchestrator can attribute the
/// failure to a source line.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} in {stage}: {message}")]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub record: Record,
    /// Name of the failing stage. Filled in by the interception layer when
    /// the stage leaves it empty.
    pub stage: String,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, record: Record) -> Self {
        Self {
            kind,
            message: message.into(),
            record,
            stage: String::new(),
        }
    }

    pub fn validation(message: impl Into<String>, record: Record) -> Self {
        Self::new(ErrorKind::Validation, message, record)
    }

    pub fn transient(message: impl Into<String>, record: Record) -> Self {
        Self::new(ErrorKind::TransientIo, message, record)
    }

    pub fn permanent(message: impl Into<String>, record: Record) -> Self {
        Self::new(ErrorKind::PermanentStageFailure, message, record)
    }

    /// Attribute the failure to `stage` unless a stage name is already set.
    pub fn in_stage(mut self, stage: &str) -> Self {
        if self.stage.is_empty() {
            self.stage = stage.to_string();
        }
        self
    }
}

/// A column lookup on a record that does not have that column.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: missing column '{column}'")]
pub struct MissingColumn {
    pub column: String,
    pub line: u64,
}

impl MissingColumn {
    /// Turn the lookup error into a validation failure for `record`.
    pub fn into_failure(self, record: Record) -> StageFailure {
        StageFailure::validation(format!("missing column '{}'", self.column), record)
    }
}

/// Why a column could not be renamed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenameError {
    #[error(transparent)]
    Missing(#[from] MissingColumn),

    #[error("line {line}: column '{column}' already exists")]
    Exists { column: String, line: u64 },
}

impl RenameError {
    pub fn into_failure(self, record: Record) -> StageFailure {
        match self {
            RenameError::Missing(missing) => missing.into_failure(record),
            RenameError::Exists { column, .. } => {
                StageFailure::validation(format!("column '{column}' already exists"), record)
            }
        }
    }
}

/// Attempt to change a record's validation status after it became terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: validation status is already {current}")]
pub struct StatusError {
    pub line: u64,
    pub current: ValidationStatus,
}

/// Stream-level failure. Aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stream fault: {0}")]
    StreamFault(#[from] std::io::Error),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("input is not valid UTF-8 near line {line}")]
    InvalidUtf8 { line: u64 },

    #[error("line {line}: columns {found:?} do not match output columns {expected:?}")]
    SchemaMismatch {
        line: u64,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigFile(#[from] serde_yaml::Error),

    #[error("pipeline definition: {0}")]
    Dsl(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::TransientIo.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
        assert!(!ErrorKind::PermanentStageFailure.is_transient());
        assert!(!ErrorKind::CircuitOpen.is_transient());
    }

    #[test]
    fn test_data_error_kinds() {
        assert!(ErrorKind::Validation.is_data_error());
        assert!(ErrorKind::Parse.is_data_error());
        assert!(!ErrorKind::PermanentStageFailure.is_data_error());
        assert!(!ErrorKind::Timeout.is_data_error());
    }

    #[test]
    fn test_in_stage_keeps_existing_name() {
        let record = Record::from_pairs(1, [("a", "1")]);
        let failure = StageFailure::validation("bad", record).in_stage("FIRST");
        let failure = failure.in_stage("SECOND");
        assert_eq!(failure.stage, "FIRST");
        assert_eq!(failure.to_string(), "validation in FIRST: bad");
    }
}
