//! Worker-pool execution.
//!
//! The calling thread reads batches and hands them to a fixed pool of
//! scoped worker threads over a bounded channel. Each worker runs the whole
//! stage chain for its rows and sends results back tagged with a sequence
//! number. The calling thread holds early results in a reordering window
//! and writes them in input order, so output matches a sequential run.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use super::{CancellationToken, FailureEntry, Pipeline, RowOutcome, RunStatus, Sink, process_row};
use crate::csv::{CsvReader, CsvRow};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::intercept::Intercepted;
use crate::record::Record;

type Job = Vec<(u64, CsvRow)>;

/// `None` marks a row that went to the error report.
type Done = (u64, Option<Vec<Record>>);

/// Run one row, turning a panicking stage into a failure for that row.
fn run_guarded(stages: &[Intercepted], row: CsvRow) -> RowOutcome {
    let line = row.line();
    let raw: Arc<str> = match &row {
        CsvRow::Record(r) => r.shared_raw(),
        CsvRow::Malformed(m) => Arc::from(m.raw.as_str()),
    };
    match panic::catch_unwind(AssertUnwindSafe(|| process_row(stages, row))) {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(line, "stage panicked");
            RowOutcome::Failed(FailureEntry {
                line,
                raw: raw.to_string(),
                stage: "worker".to_string(),
                kind: ErrorKind::PermanentStageFailure,
                message: "stage panicked".to_string(),
            })
        }
    }
}

fn workers_gone() -> PipelineError {
    PipelineError::StreamFault(std::io::Error::other("worker threads exited early"))
}

pub(crate) fn run_workers<R: BufRead, W: Write>(
    pipeline: &Pipeline,
    workers: usize,
    reader: &mut CsvReader<R>,
    sink: &mut Sink<'_, W>,
    cancel: &CancellationToken,
) -> Result<(RunStatus, u64)> {
    let stages = pipeline.stages();
    let errors = sink.errors;
    let window_limit = pipeline.config().reorder_window as u64;

    thread::scope(|scope| -> Result<(RunStatus, u64)> {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(workers);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<Done>();

        for id in 0..workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            thread::Builder::new()
                .name(format!("csvpipe-worker-{id}"))
                .spawn_scoped(scope, move || {
                    for batch in job_rx {
                        for (seq, row) in batch {
                            let done = match run_guarded(stages, row) {
                                RowOutcome::Passed(records) => Some(records),
                                RowOutcome::Failed(entry) => {
                                    errors.push(entry);
                                    None
                                }
                            };
                            if done_tx.send((seq, done)).is_err() {
                                return;
                            }
                        }
                    }
                })?;
        }
        drop(job_rx);
        drop(done_tx);
        debug!(workers, "worker pool started");

        let mut window: BTreeMap<u64, Option<Vec<Record>>> = BTreeMap::new();
        let mut dispatched: u64 = 0;
        let mut next_write: u64 = 0;
        let mut input_done = false;
        let mut status = RunStatus::Completed;

        loop {
            while let Ok((seq, done)) = done_rx.try_recv() {
                window.insert(seq, done);
            }
            while let Some(done) = window.remove(&next_write) {
                if let Some(records) = done {
                    sink.deliver(RowOutcome::Passed(records))?;
                }
                next_write += 1;
            }

            if !input_done && dispatched - next_write < window_limit {
                if cancel.is_cancelled() {
                    info!(read = dispatched, "run cancelled");
                    status = RunStatus::Cancelled;
                    input_done = true;
                    continue;
                }
                let batch = pipeline.read_batch(reader)?;
                if batch.is_empty() {
                    input_done = true;
                    continue;
                }
                let job: Job = batch
                    .into_iter()
                    .map(|row| {
                        let seq = dispatched;
                        dispatched += 1;
                        (seq, row)
                    })
                    .collect();
                job_tx.send(job).map_err(|_| workers_gone())?;
                continue;
            }

            if next_write == dispatched {
                break;
            }
            let (seq, done) = done_rx.recv().map_err(|_| workers_gone())?;
            window.insert(seq, done);
        }

        drop(job_tx);
        debug!(rows = dispatched, "worker pool drained");
        Ok((status, dispatched))
    })
}
