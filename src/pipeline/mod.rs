//! Pipeline orchestrator.
//!
//! Reads rows from a [`CsvReader`], pushes each record through the
//! intercepted stage chain, writes survivors with a [`CsvWriter`] and
//! collects everything else into an [`ErrorReport`]. Per-record failures
//! never end a run; stream faults do.

mod report;
mod workers;

pub use report::{ErrorCollector, ErrorReport, FailureEntry, READER_STAGE, WRITER_STAGE};

use std::io::{BufReader, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::config::{Concurrency, PipelineConfig};
use crate::csv::{CsvReader, CsvRow, CsvWriter};
use crate::error::{Result, StageFailure};
use crate::executor::{flush_stages, push_through_stages};
use crate::intercept::{EventSink, InterceptPolicy, Intercepted};
use crate::metrics::StageMetricsSnapshot;
use crate::record::Record;
use crate::stage::Stage;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Cooperative cancellation flag, checked before each batch is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// All input was read and every stage flushed.
    Completed,
    /// Stopped early; in-flight records finished, stages were not flushed.
    Cancelled,
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    /// Data rows read, including malformed ones
    pub records_read: u64,
    /// Input rows that reached the end of the chain without failing
    pub succeeded: u64,
    /// Entries in the error report
    pub failed: u64,
    pub records_written: u64,
    pub failures: ErrorReport,
    pub stages: Vec<StageMetricsSnapshot>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed && self.failures.is_empty()
    }
}

/// What became of one input row after the stage chain.
pub(crate) enum RowOutcome {
    Passed(Vec<Record>),
    Failed(FailureEntry),
}

/// Run one row through the chain.
pub(crate) fn process_row<S: Stage>(stages: &[S], row: CsvRow) -> RowOutcome {
    match row {
        CsvRow::Malformed(m) => RowOutcome::Failed(m.into()),
        CsvRow::Record(record) => match push_through_stages(vec![record], stages) {
            Ok(records) => RowOutcome::Passed(records),
            Err(failure) => RowOutcome::Failed(failure.into()),
        },
    }
}

/// Writer side of a run: output records, counters and the error collector.
pub(crate) struct Sink<'a, W: Write> {
    writer: CsvWriter<W>,
    errors: &'a ErrorCollector,
    succeeded: u64,
}

impl<'a, W: Write> Sink<'a, W> {
    fn new(writer: CsvWriter<W>, errors: &'a ErrorCollector) -> Self {
        Self {
            writer,
            errors,
            succeeded: 0,
        }
    }

    /// Deliver the outcome of one input row.
    pub(crate) fn deliver(&mut self, outcome: RowOutcome) -> Result<()> {
        match outcome {
            RowOutcome::Passed(records) => {
                if self.write_all(records)? {
                    self.succeeded += 1;
                }
            }
            RowOutcome::Failed(entry) => self.errors.push(entry),
        }
        Ok(())
    }

    /// Deliver records produced by a flush.
    fn deliver_flushed(&mut self, outcome: std::result::Result<Vec<Record>, StageFailure>) -> Result<()> {
        match outcome {
            Ok(records) => {
                self.write_all(records)?;
            }
            Err(failure) => self.errors.push(failure.into()),
        }
        Ok(())
    }

    /// Write every record, or none if any of them has the wrong columns.
    /// Returns whether the records were written.
    fn write_all(&mut self, mut records: Vec<Record>) -> Result<bool> {
        let mismatch = {
            let expected = match (self.writer.columns(), records.first()) {
                (Some(columns), _) => columns,
                (None, Some(first)) => first.columns(),
                (None, None) => return Ok(true),
            };
            records
                .iter()
                .position(|r| !r.matches_columns(expected))
                .map(|i| (i, expected.to_vec()))
        };

        if let Some((i, expected)) = mismatch {
            let record = records.swap_remove(i);
            let message = format!(
                "columns {:?} do not match output columns {:?}",
                record.columns(),
                expected
            );
            let failure = StageFailure::permanent(message, record).in_stage(WRITER_STAGE);
            self.errors.push(failure.into());
            return Ok(false);
        }

        for record in &records {
            self.writer.write_record(record)?;
        }
        Ok(true)
    }
}

/// A configured chain of intercepted stages.
pub struct Pipeline {
    config: PipelineConfig,
    stages: Vec<Intercepted>,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    stages: Vec<Intercepted>,
    sink: Option<Arc<dyn EventSink>>,
}

impl PipelineBuilder {
    /// Append a stage wrapped with the configured policy for its name.
    pub fn stage<S: Stage + 'static>(self, stage: S) -> Self {
        let policy = self.config.policy_for(stage.name()).clone();
        self.stage_with(stage, policy)
    }

    /// Append a stage wrapped with an explicit policy.
    pub fn stage_with<S: Stage + 'static>(mut self, stage: S, policy: InterceptPolicy) -> Self {
        self.stages.push(crate::intercept::intercept(stage, policy));
        self
    }

    /// Append an already intercepted stage as is.
    pub fn intercepted(mut self, stage: Intercepted) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append several stages, each with its configured policy.
    pub fn stages<I, S>(self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Stage + 'static,
    {
        stages.into_iter().fold(self, |b, s| b.stage(s))
    }

    /// Send every stage's interception events to `sink`.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let stages = match self.sink {
            Some(sink) => self
                .stages
                .into_iter()
                .map(|s| s.with_sink(Arc::clone(&sink)))
                .collect(),
            None => self.stages,
        };
        Ok(Pipeline {
            config: self.config,
            stages,
        })
    }
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            stages: Vec::new(),
            sink: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the pipeline to completion.
    pub fn run<R: Read, W: Write>(&self, input: R, output: W) -> Result<RunSummary> {
        self.run_with_cancel(input, output, &CancellationToken::new())
    }

    /// Run the pipeline, stopping early once `cancel` is triggered.
    ///
    /// Each run starts from closed breakers, zeroed metrics and empty
    /// accumulating stages, whatever an earlier run left behind.
    pub fn run_with_cancel<R: Read, W: Write>(
        &self,
        input: R,
        output: W,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut reader = CsvReader::new(BufReader::new(input), self.config.csv.clone());
        let errors = ErrorCollector::new();
        let mut sink = Sink::new(CsvWriter::new(output, self.config.csv.clone()), &errors);
        for stage in &self.stages {
            stage.begin_run();
        }

        info!(
            stages = ?self.stage_names(),
            workers = self.config.concurrency.workers(),
            "pipeline run started"
        );

        let (status, records_read) = match self.config.concurrency {
            Concurrency::Sequential => self.run_sequential(&mut reader, &mut sink, cancel)?,
            Concurrency::Workers(n) => {
                workers::run_workers(self, n, &mut reader, &mut sink, cancel)?
            }
        };

        if status == RunStatus::Completed {
            let mut next_line = records_read + 1;
            flush_stages(&self.stages, &mut next_line, |outcome| {
                sink.deliver_flushed(outcome)
            })?;
        }

        let succeeded = sink.succeeded;
        let records_written = sink.writer.written();
        sink.writer.finish()?;
        let failures = errors.into_report();

        let summary = RunSummary {
            status,
            started_at,
            elapsed: started.elapsed(),
            records_read,
            succeeded,
            failed: failures.len() as u64,
            records_written,
            failures,
            stages: self
                .stages
                .iter()
                .map(|s| s.metrics().snapshot(s.name()))
                .collect(),
        };
        info!(
            status = ?summary.status,
            read = summary.records_read,
            succeeded = summary.succeeded,
            failed = summary.failed,
            written = summary.records_written,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "pipeline run finished"
        );
        Ok(summary)
    }

    /// Read up to `batch_size` rows. An empty batch means end of input.
    pub(crate) fn read_batch<R: std::io::BufRead>(
        &self,
        reader: &mut CsvReader<R>,
    ) -> Result<Vec<CsvRow>> {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        for row in reader.by_ref().take(self.config.batch_size) {
            batch.push(row?);
        }
        Ok(batch)
    }

    fn run_sequential<R: std::io::BufRead, W: Write>(
        &self,
        reader: &mut CsvReader<R>,
        sink: &mut Sink<'_, W>,
        cancel: &CancellationToken,
    ) -> Result<(RunStatus, u64)> {
        let mut read = 0;
        loop {
            if cancel.is_cancelled() {
                info!(read, "run cancelled");
                return Ok((RunStatus::Cancelled, read));
            }
            let batch = self.read_batch(reader)?;
            if batch.is_empty() {
                return Ok((RunStatus::Completed, read));
            }
            read += batch.len() as u64;
            debug!(rows = batch.len(), read, "dispatching batch");
            for row in batch {
                sink.deliver(process_row(&self.stages, row))?;
            }
        }
    }

    pub(crate) fn stages(&self) -> &[Intercepted] {
        &self.stages
    }
}

/// Build and run a pipeline in one call.
pub fn run<R, W, I, S>(input: R, output: W, stages: I, config: PipelineConfig) -> Result<RunSummary>
where
    R: Read,
    W: Write,
    I: IntoIterator<Item = S>,
    S: Stage + 'static,
{
    Pipeline::builder(config).stages(stages).build()?.run(input, output)
}
