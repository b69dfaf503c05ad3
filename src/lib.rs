//! # csvpipe
//!
//! A streaming CSV record pipeline with declarative stage interception.
//!
//! Rows are decoded into [`Record`]s, pushed one at a time through an
//! ordered chain of [`Stage`]s and written back out as CSV. Records that
//! fail anywhere along the way are diverted into an [`ErrorReport`]
//! instead of stopping the run.
//!
//! Every stage in a [`Pipeline`] is wrapped by the interception layer
//! ([`intercept`]), which adds timing, logging, retry with backoff, a
//! circuit breaker and a per-call timeout according to an
//! [`InterceptPolicy`]. The stage itself knows nothing about any of it.
//!
//! ## Overview
//!
//! - **Records**: named columns with string values, a source line number
//!   and a validation status
//! - **Record-at-a-time**: each input record travels the whole chain before
//!   the next one is read; output order follows input order
//! - **Flush propagation**: stages that accumulate (such as `AGGREGATE`)
//!   emit once the input ends, and their output flows through the rest of
//!   the chain
//! - **Worker mode**: an optional thread pool with a reordering window, so
//!   concurrent runs write the same bytes as sequential ones
//!
//! ## Example
//!
//! ```
//! use csvpipe::{Pipeline, PipelineConfig};
//! use csvpipe::stages::ParseNumberStage;
//!
//! let pipeline = Pipeline::builder(PipelineConfig::default())
//!     .stage(ParseNumberStage { column: "amount".to_string() })
//!     .build()
//!     .unwrap();
//!
//! let mut output = Vec::new();
//! let summary = pipeline
//!     .run("id,amount\n1,10\n2,abc\n3,30\n".as_bytes(), &mut output)
//!     .unwrap();
//!
//! assert_eq!(String::from_utf8(output).unwrap(), "id,amount\n1,10\n3,30\n");
//! assert_eq!(summary.failures.len(), 1);
//! assert_eq!(summary.failures.entries()[0].line, 2);
//! ```

pub mod config;
pub mod csv;
pub mod dsl;
pub mod error;
pub mod executor;
pub mod intercept;
pub mod metrics;
pub mod paths;
pub mod pipeline;
pub mod record;
pub mod stage;
pub mod stages;

pub use config::{Concurrency, PipelineConfig};
pub use csv::{CsvConfig, CsvReader, CsvRow, CsvWriter, Malformed};
pub use dsl::{Command, StageDef, build_stages, parse_commands, parse_pipeline};
pub use error::{ErrorKind, PipelineError, RenameError, Result, StageFailure};
pub use executor::execute_rat;
pub use intercept::{
    EventSink, Hook, HookError, InterceptEvent, InterceptPolicy, Intercepted, InterceptionContext,
    intercept,
};
pub use metrics::{StageMetrics, StageMetricsSnapshot};
pub use paths::{PathError, PathGuard};
pub use pipeline::{
    CancellationToken, ErrorReport, FailureEntry, Pipeline, PipelineBuilder, RunStatus, RunSummary,
    run,
};
pub use record::{Record, ValidationStatus};
pub use stage::{Stage, StageResult, stage_fn};
