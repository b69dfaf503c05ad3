//! CLI tool to run a pipeline (.pipe) file over CSV input.
//!
//! Exit codes: 0 run completed (failed records go to the error report),
//! 1 usage or I/O error, 2 path outside `--root`, 3 invalid pipeline or
//! configuration, 130 interrupted.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, anyhow};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use csvpipe::{
    CancellationToken, PathGuard, Pipeline, PipelineConfig, PipelineError, RunStatus, RunSummary,
    build_stages,
};

const EXIT_IO: i32 = 1;
const EXIT_PATH: i32 = 2;
const EXIT_DEFINITION: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportFormat {
    Csv,
    Json,
}

/// Run a pipeline file over CSV input.
///
/// Records that fail a stage are left out of the output and listed in the
/// error report instead.
#[derive(Parser)]
#[command(name = "csvpipe", version)]
struct Cli {
    /// Pipeline definition file (.pipe)
    pipeline: PathBuf,

    /// Input CSV file, or - for stdin
    input: PathBuf,

    /// Write output to file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the error report to this file
    #[arg(long)]
    errors: Option<PathBuf>,

    /// Error report format
    #[arg(long, value_enum, default_value = "csv")]
    errors_format: ReportFormat,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker threads (overrides configuration; 1 runs sequentially)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Only read and write files inside this directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Show paths, record counts and per-stage metrics on stderr
    #[arg(short, long)]
    verbose: bool,
}

/// A failure, classified by exit code.
enum Failure {
    Io(anyhow::Error),
    Path(anyhow::Error),
    Definition(anyhow::Error),
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::Io(_) => EXIT_IO,
            Failure::Path(_) => EXIT_PATH,
            Failure::Definition(_) => EXIT_DEFINITION,
        }
    }

    fn error(&self) -> &anyhow::Error {
        match self {
            Failure::Io(e) | Failure::Path(e) | Failure::Definition(e) => e,
        }
    }
}

impl From<PipelineError> for Failure {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Config(_) | PipelineError::ConfigFile(_) | PipelineError::Dsl(_) => {
                Failure::Definition(e.into())
            }
            other => Failure::Io(other.into()),
        }
    }
}

/// `RUST_LOG` when set and valid, otherwise the level `-v` selects.
fn env_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let level = if verbose { "debug" } else { "warn" };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

fn init_tracing(verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter(verbose, rust_log.as_deref()))
        .init();
}

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == "-"
}

struct Paths {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    errors: Option<PathBuf>,
}

/// Resolve file arguments, confining them to `--root` when given.
fn resolve_paths(cli: &Cli) -> Result<Paths, Failure> {
    let input = (!is_stdin(&cli.input)).then(|| cli.input.clone());
    let Some(root) = &cli.root else {
        return Ok(Paths {
            input,
            output: cli.output.clone(),
            errors: cli.errors.clone(),
        });
    };

    let guard = PathGuard::new(root)
        .with_context(|| format!("invalid --root '{}'", root.display()))
        .map_err(Failure::Io)?;
    let to_failure = |e: csvpipe::PathError| match e {
        csvpipe::PathError::Resolve { .. } => Failure::Io(e.into()),
        _ => Failure::Path(e.into()),
    };
    Ok(Paths {
        input: input
            .map(|p| guard.input(&p))
            .transpose()
            .map_err(to_failure)?,
        output: cli
            .output
            .as_deref()
            .map(|p| guard.output(p))
            .transpose()
            .map_err(to_failure)?,
        errors: cli
            .errors
            .as_deref()
            .map(|p| guard.output(p))
            .transpose()
            .map_err(to_failure)?,
    })
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, Failure> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path).map_err(|e| match e {
            PipelineError::StreamFault(io) => Failure::Io(
                anyhow!(io).context(format!("cannot read config '{}'", path.display())),
            ),
            other => Failure::from(other),
        })?,
        None => PipelineConfig::default(),
    };
    config.apply_env()?;
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    Ok(config)
}

fn execute(cli: &Cli, cancel: &CancellationToken) -> Result<RunSummary, Failure> {
    let paths = resolve_paths(cli)?;
    let config = load_config(cli)?;

    let pipeline_text = std::fs::read_to_string(&cli.pipeline)
        .with_context(|| format!("cannot read pipeline file '{}'", cli.pipeline.display()))
        .map_err(Failure::Io)?;
    let stages = build_stages(&pipeline_text)?;
    let pipeline = Pipeline::builder(config).stages(stages).build()?;

    if cli.verbose {
        eprintln!("Pipeline: {}", cli.pipeline.display());
        eprintln!("Stages:   {}", pipeline.stage_names().join(" | "));
        eprintln!(
            "Input:    {}",
            paths
                .input
                .as_deref()
                .map_or("(stdin)".into(), |p| p.display().to_string())
        );
        eprintln!(
            "Output:   {}",
            paths
                .output
                .as_deref()
                .map_or("(stdout)".into(), |p| p.display().to_string())
        );
        eprintln!("Workers:  {}", pipeline.config().concurrency.workers());
    }

    let input: Box<dyn Read> = match &paths.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path)
                .with_context(|| format!("cannot open input '{}'", path.display()))
                .map_err(Failure::Io)?,
        )),
        None => Box::new(io::stdin().lock()),
    };
    let output: Box<dyn Write> = match &paths.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path)
                .with_context(|| format!("cannot create output '{}'", path.display()))
                .map_err(Failure::Io)?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let summary = pipeline.run_with_cancel(input, output, cancel)?;

    if let Some(path) = &paths.errors {
        let file = File::create(path)
            .with_context(|| format!("cannot create error report '{}'", path.display()))
            .map_err(Failure::Io)?;
        let out = BufWriter::new(file);
        match cli.errors_format {
            ReportFormat::Csv => summary.failures.write_csv(out, &pipeline.config().csv),
            ReportFormat::Json => summary.failures.write_json(out),
        }?
        .flush()
        .map_err(|e| Failure::Io(e.into()))?;
        info!(path = %path.display(), entries = summary.failed, "error report written");
    } else if summary.failed > 0 {
        warn!(
            failed = summary.failed,
            "records failed; pass --errors to keep the error report"
        );
    }

    Ok(summary)
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { EXIT_IO } else { 0 });
        }
    };
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing in-flight records...");
        handler_token.cancel();
    }) {
        warn!(error = %e, "cannot install interrupt handler");
    }

    match execute(&cli, &cancel) {
        Ok(summary) => {
            if cli.verbose {
                eprintln!(
                    "Records:  {} in -> {} out, {} failed",
                    summary.records_read, summary.records_written, summary.failed
                );
                for stage in &summary.stages {
                    eprintln!("  {stage}");
                }
            }
            if summary.status == RunStatus::Cancelled {
                eprintln!("Run cancelled after {} records", summary.records_read);
                process::exit(EXIT_INTERRUPTED);
            }
        }
        Err(failure) => {
            eprintln!("Error: {:#}", failure.error());
            process::exit(failure.exit_code());
        }
    }
}
