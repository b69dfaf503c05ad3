//! Pipeline configuration.
//!
//! Loaded from YAML, then overridden by `CSVPIPE_*` environment variables:
//!
//! ```yaml
//! csv:
//!   delimiter: ";"
//!   has_header: true
//! workers: 4
//! batch_size: 64
//! default_policy:
//!   logging: true
//! stages:
//!   scorer:
//!     timing: true
//!     retry: { max_attempts: 3, base_delay_ms: 50 }
//!     circuit_break: { threshold: 5, cooldown_ms: 10000 }
//!     timeout_ms: 500
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::csv::CsvConfig;
use crate::error::{PipelineError, Result};
use crate::intercept::InterceptPolicy;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "CSVPIPE_";

/// How records are dispatched to the stage chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "usize", into = "usize")]
pub enum Concurrency {
    /// One record at a time on the calling thread.
    #[default]
    Sequential,
    /// A fixed pool of worker threads, each running the full chain.
    Workers(usize),
}

impl From<usize> for Concurrency {
    fn from(workers: usize) -> Self {
        if workers <= 1 {
            Concurrency::Sequential
        } else {
            Concurrency::Workers(workers)
        }
    }
}

impl From<Concurrency> for usize {
    fn from(c: Concurrency) -> Self {
        c.workers()
    }
}

impl Concurrency {
    pub fn workers(self) -> usize {
        match self {
            Concurrency::Sequential => 1,
            Concurrency::Workers(n) => n,
        }
    }
}

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// CSV dialect for both input and output
    #[serde(default)]
    pub csv: CsvConfig,

    /// Worker threads; 0 or 1 runs sequentially
    #[serde(default, rename = "workers")]
    pub concurrency: Concurrency,

    /// Rows read per dispatch unit
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rows that may complete ahead of the oldest unwritten row in worker
    /// mode before dispatch pauses
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,

    /// Policy for stages without their own entry
    #[serde(default)]
    pub default_policy: InterceptPolicy,

    /// Per-stage policies, keyed by stage name or label
    #[serde(default)]
    pub stages: BTreeMap<String, InterceptPolicy>,
}

fn default_batch_size() -> usize {
    64
}

fn default_reorder_window() -> usize {
    1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            csv: CsvConfig::default(),
            concurrency: Concurrency::Sequential,
            batch_size: default_batch_size(),
            reorder_window: default_reorder_window(),
            default_policy: InterceptPolicy::default(),
            stages: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.concurrency = Concurrency::from(workers);
        self
    }

    pub fn with_csv(mut self, csv: CsvConfig) -> Self {
        self.csv = csv;
        self
    }

    pub fn with_stage_policy(mut self, stage: impl Into<String>, policy: InterceptPolicy) -> Self {
        self.stages.insert(stage.into(), policy);
        self
    }

    /// Policy for the stage called `name`.
    pub fn policy_for(&self, name: &str) -> &InterceptPolicy {
        self.stages.get(name).unwrap_or(&self.default_policy)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(std::env::vars())
    }

    /// Apply `CSVPIPE_*` overrides from `vars`. Unrelated variables are ignored.
    pub fn apply_env_from<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "DELIMITER" => self.csv.delimiter = parse_char(name, value)?,
                "QUOTE" => self.csv.quote = parse_char(name, value)?,
                "HAS_HEADER" => self.csv.has_header = parse_bool(name, value)?,
                "TRIM" => self.csv.trim = parse_bool(name, value)?,
                "WORKERS" => self.concurrency = Concurrency::from(parse_usize(name, value)?),
                "BATCH_SIZE" => self.batch_size = parse_usize(name, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.csv.validate()?;
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".to_string()));
        }
        if self.reorder_window == 0 {
            return Err(PipelineError::Config(
                "reorder_window must be at least 1".to_string(),
            ));
        }
        self.default_policy
            .validate()
            .map_err(|e| PipelineError::Config(format!("default_policy: {e}")))?;
        for (stage, policy) in &self.stages {
            policy
                .validate()
                .map_err(|e| PipelineError::Config(format!("stages.{stage}: {e}")))?;
        }
        Ok(())
    }
}

fn env_error(name: &str, value: &str, expected: &str) -> PipelineError {
    PipelineError::Config(format!("{ENV_PREFIX}{name}={value:?}: expected {expected}"))
}

fn parse_char(name: &str, value: &str) -> Result<char> {
    let value_for_error = value;
    let value = match value {
        "\\t" | "tab" => "\t",
        other => other,
    };
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(env_error(name, value_for_error, "a single character")),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(env_error(name, value, "true or false")),
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| env_error(name, value, "a non-negative integer"))
}
