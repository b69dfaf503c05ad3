//! Built-in stages.
//!
//! General record shaping (filter, rename, split, ...) plus the stages of
//! the message-moderation job this crate grew out of: translate a message,
//! score it, and aggregate scores per user.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::dsl::Command;
use crate::error::{StageFailure, StatusError};
use crate::record::Record;
use crate::stage::{Stage, StageResult};

/// Validation failure that also marks the record invalid.
fn reject(record: Record, reason: String) -> StageFailure {
    let marked = match record.clone().mark_invalid(reason.clone()) {
        Ok(marked) => marked,
        Err(_) => record,
    };
    StageFailure::validation(reason, marked)
}

fn status_failure(err: StatusError, record: Record) -> StageFailure {
    StageFailure::validation(err.to_string(), record)
}

/// Fetch `column` or fail the record.
macro_rules! field {
    ($record:expr, $column:expr) => {
        match $record.get($column) {
            Ok(v) => v.to_string(),
            Err(e) => return Err(e.into_failure($record)),
        }
    };
}

// ---------------------------------------------------------------------------
// Record shaping
// ---------------------------------------------------------------------------

/// REQUIRE - fails records where any listed column is missing or blank.
pub struct RequireStage {
    pub columns: Vec<String>,
}

impl Stage for RequireStage {
    fn process(&self, record: Record) -> StageResult {
        for column in &self.columns {
            let value = field!(record, column);
            if value.trim().is_empty() {
                return Err(reject(record, format!("column '{column}' is empty")));
            }
        }
        Ok(vec![record])
    }

    fn name(&self) -> &str {
        "REQUIRE"
    }
}

/// NUMBER - parses a column as a number and writes it back normalized.
pub struct ParseNumberStage {
    pub column: String,
}

fn normalize_number(text: &str) -> Option<String> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Some(n.to_string());
    }
    match text.parse::<f64>() {
        Ok(n) if n.is_finite() => Some(n.to_string()),
        _ => None,
    }
}

impl Stage for ParseNumberStage {
    fn process(&self, record: Record) -> StageResult {
        let value = field!(record, &self.column);
        match normalize_number(&value) {
            Some(n) => Ok(vec![record.with(&self.column, n)]),
            None => Err(reject(
                record,
                format!("cannot parse '{value}' as a number in column '{}'", self.column),
            )),
        }
    }

    fn name(&self) -> &str {
        "NUMBER"
    }
}

/// FILTER column = "value" - keeps records where the column equals value.
pub struct FilterEqStage {
    pub column: String,
    pub value: String,
}

impl Stage for FilterEqStage {
    fn process(&self, record: Record) -> StageResult {
        let value = field!(record, &self.column);
        if value == self.value {
            Ok(vec![record])
        } else {
            Ok(vec![])
        }
    }

    fn name(&self) -> &str {
        "FILTER"
    }
}

/// FILTER column != "value" - drops records where the column equals value.
pub struct FilterNeStage {
    pub column: String,
    pub value: String,
}

impl Stage for FilterNeStage {
    fn process(&self, record: Record) -> StageResult {
        let value = field!(record, &self.column);
        if value != self.value {
            Ok(vec![record])
        } else {
            Ok(vec![])
        }
    }

    fn name(&self) -> &str {
        "FILTER"
    }
}

/// RENAME old new
pub struct RenameStage {
    pub from: String,
    pub to: String,
}

impl Stage for RenameStage {
    fn process(&self, record: Record) -> StageResult {
        match record.renamed(&self.from, &self.to) {
            Ok(renamed) => Ok(vec![renamed]),
            Err(e) => Err(e.into_failure(record)),
        }
    }

    fn name(&self) -> &str {
        "RENAME"
    }
}

/// DROP column - removes a column. Unknown columns are ignored.
pub struct DropStage {
    pub column: String,
}

impl Stage for DropStage {
    fn process(&self, record: Record) -> StageResult {
        Ok(vec![record.without(&self.column)])
    }

    fn name(&self) -> &str {
        "DROP"
    }
}

/// SET column "value" - sets or adds a column.
pub struct SetStage {
    pub column: String,
    pub value: String,
}

impl Stage for SetStage {
    fn process(&self, record: Record) -> StageResult {
        Ok(vec![record.with(&self.column, self.value.as_str())])
    }

    fn name(&self) -> &str {
        "SET"
    }
}

/// Per-column text transforms: UPPER, LOWER, TRIM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseOp {
    Upper,
    Lower,
    Trim,
}

pub struct TextStage {
    pub column: String,
    pub op: CaseOp,
}

impl Stage for TextStage {
    fn process(&self, record: Record) -> StageResult {
        let value = field!(record, &self.column);
        let next = match self.op {
            CaseOp::Upper => value.to_uppercase(),
            CaseOp::Lower => value.to_lowercase(),
            CaseOp::Trim => value.trim().to_string(),
        };
        Ok(vec![record.with(&self.column, next)])
    }

    fn name(&self) -> &str {
        match self.op {
            CaseOp::Upper => "UPPER",
            CaseOp::Lower => "LOWER",
            CaseOp::Trim => "TRIM",
        }
    }
}

/// SPLIT column "sep" - one output record per piece of the column.
pub struct SplitStage {
    pub column: String,
    pub separator: String,
}

impl Stage for SplitStage {
    fn process(&self, record: Record) -> StageResult {
        let value = field!(record, &self.column);
        if self.separator.is_empty() {
            return Ok(vec![record]);
        }
        Ok(value
            .split(self.separator.as_str())
            .map(|piece| record.with(&self.column, piece))
            .collect())
    }

    fn name(&self) -> &str {
        "SPLIT"
    }
}

/// DUPLICATE n - repeats each record n times.
pub struct DuplicateStage {
    pub n: usize,
}

impl Stage for DuplicateStage {
    fn process(&self, record: Record) -> StageResult {
        Ok(std::iter::repeat_n(record, self.n).collect())
    }

    fn name(&self) -> &str {
        "DUPLICATE"
    }
}

/// VALIDATE - marks records that reached this point as valid.
pub struct MarkValidStage;

impl Stage for MarkValidStage {
    fn process(&self, record: Record) -> StageResult {
        match record.clone().mark_valid() {
            Ok(valid) => Ok(vec![valid]),
            Err(e) => Err(status_failure(e, record)),
        }
    }

    fn name(&self) -> &str {
        "VALIDATE"
    }
}

// ---------------------------------------------------------------------------
// Moderation stages
// ---------------------------------------------------------------------------

/// Memoized string results shared between invocations.
///
/// Keeps repeated calls for the same input idempotent, which is what makes
/// the moderation stages safe to retry.
#[derive(Default)]
pub struct MemoCache<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V: Clone> MemoCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached value for `key`, computing it at most once.
    pub fn get_or_compute(&self, key: &str, compute: impl FnOnce(&str) -> V) -> V {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(v) = entries.get(key) {
            return v.clone();
        }
        let v = compute(key);
        entries.insert(key.to_string(), v.clone());
        v
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TRANSLATE column - replaces the text with its translation.
///
/// The translation backend is simulated by reversing the text.
pub struct TranslateStage {
    pub column: String,
    cache: Arc<MemoCache<String>>,
}

impl TranslateStage {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            cache: Arc::new(MemoCache::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<MemoCache<String>>) -> Self {
        self.cache = cache;
        self
    }
}

impl Stage for TranslateStage {
    fn process(&self, record: Record) -> StageResult {
        let text = field!(record, &self.column);
        let translated = self
            .cache
            .get_or_compute(&text, |t| t.chars().rev().collect());
        Ok(vec![record.with(&self.column, translated)])
    }

    fn name(&self) -> &str {
        "TRANSLATE"
    }
}

/// 31-based polynomial hash over UTF-16 code units, wrapping at 32 bits.
fn text_hash(text: &str) -> i32 {
    text.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Deterministic offensiveness score in `[0, 1]`.
pub fn score_text(text: &str) -> f32 {
    (text_hash(text) % 1001).abs() as f32 / 1000.0
}

/// SCORE column target - scores the column's text into `target`.
pub struct ScoreStage {
    pub column: String,
    pub target: String,
    cache: Arc<MemoCache<f32>>,
}

impl ScoreStage {
    pub fn new(column: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            target: target.into(),
            cache: Arc::new(MemoCache::new()),
        }
    }
}

impl Stage for ScoreStage {
    fn process(&self, record: Record) -> StageResult {
        let text = field!(record, &self.column);
        let score = self.cache.get_or_compute(&text, score_text);
        Ok(vec![record.with(&self.target, format!("{score:.3}"))])
    }

    fn name(&self) -> &str {
        "SCORE"
    }
}

/// Values seen for one key, tagged with their source line so the mean
/// does not depend on the order records arrived in.
#[derive(Default)]
struct Tally {
    values: Vec<(u64, f64)>,
}

impl Tally {
    fn mean(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.sort_by_key(|(line, _)| *line);
        let sum: f64 = self.values.iter().map(|(_, v)| v).sum();
        sum / self.values.len() as f64
    }
}

/// AGGREGATE key value - per-key count and mean of a numeric column.
///
/// Emits nothing while processing and tallies a record only when it is
/// committed. On flush emits one record per key, in key order, with columns `key`, `total_messages` and `avg_score` (names
/// configurable).
pub struct AggregateStage {
    pub key: String,
    pub value: String,
    pub count_column: String,
    pub mean_column: String,
    tallies: Mutex<BTreeMap<String, Tally>>,
}

impl AggregateStage {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            count_column: "total_messages".to_string(),
            mean_column: "avg_score".to_string(),
            tallies: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_output_columns(
        mut self,
        count_column: impl Into<String>,
        mean_column: impl Into<String>,
    ) -> Self {
        self.count_column = count_column.into();
        self.mean_column = mean_column.into();
        self
    }
}

impl Stage for AggregateStage {
    fn process(&self, record: Record) -> StageResult {
        field!(record, &self.key);
        let raw = field!(record, &self.value);
        if raw.trim().parse::<f64>().is_err() {
            return Err(reject(
                record,
                format!("cannot parse '{raw}' as a number in column '{}'", self.value),
            ));
        }
        Ok(vec![])
    }

    fn commit(&self, input: &Record) {
        let (Ok(key), Ok(raw)) = (input.get(&self.key), input.get(&self.value)) else {
            return;
        };
        let Ok(value) = raw.trim().parse::<f64>() else {
            return;
        };
        let mut tallies = match self.tallies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tallies
            .entry(key.to_string())
            .or_default()
            .values
            .push((input.line(), value));
    }

    fn flush(&self) -> Vec<Record> {
        let mut tallies = match self.tallies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *tallies)
            .into_iter()
            .map(|(key, mut tally)| {
                let mean = tally.mean();
                Record::from_pairs(
                    0,
                    [
                        (self.key.clone(), key),
                        (self.count_column.clone(), tally.values.len().to_string()),
                        (self.mean_column.clone(), format!("{mean:.3}")),
                    ],
                )
            })
            .collect()
    }

    fn name(&self) -> &str {
        "AGGREGATE"
    }
}

/// Gives a stage a different display name, so it can carry its own
/// interception policy.
pub struct Named<S> {
    name: String,
    inner: S,
}

impl<S: Stage> Named<S> {
    pub fn new(name: impl Into<String>, inner: S) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

impl<S: Stage> Stage for Named<S> {
    fn process(&self, record: Record) -> StageResult {
        self.inner.process(record)
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

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Create a stage from a parsed `Command`.
pub fn command_to_stage(cmd: &Command) -> Box<dyn Stage> {
    match cmd {
        Command::Require { columns } => Box::new(RequireStage {
            columns: columns.clone(),
        }),
        Command::Number { column } => Box::new(ParseNumberStage {
            column: column.clone(),
        }),
        Command::FilterEq { column, value } => Box::new(FilterEqStage {
            column: column.clone(),
            value: value.clone(),
        }),
        Command::FilterNe { column, value } => Box::new(FilterNeStage {
            column: column.clone(),
            value: value.clone(),
        }),
        Command::Rename { from, to } => Box::new(RenameStage {
            from: from.clone(),
            to: to.clone(),
        }),
        Command::Drop { column } => Box::new(DropStage {
            column: column.clone(),
        }),
        Command::Set { column, value } => Box::new(SetStage {
            column: column.clone(),
            value: value.clone(),
        }),
        Command::Upper { column } => Box::new(TextStage {
            column: column.clone(),
            op: CaseOp::Upper,
        }),
        Command::Lower { column } => Box::new(TextStage {
            column: column.clone(),
            op: CaseOp::Lower,
        }),
        Command::Trim { column } => Box::new(TextStage {
            column: column.clone(),
            op: CaseOp::Trim,
        }),
        Command::Split { column, separator } => Box::new(SplitStage {
            column: column.clone(),
            separator: separator.clone(),
        }),
        Command::Duplicate { n } => Box::new(DuplicateStage { n: *n }),
        Command::Validate => Box::new(MarkValidStage),
        Command::Translate { column } => Box::new(TranslateStage::new(column.clone())),
        Command::Score { column, target } => {
            Box::new(ScoreStage::new(column.clone(), target.clone()))
        }
        Command::Aggregate { key, value } => {
            Box::new(AggregateStage::new(key.clone(), value.clone()))
        }
    }
}
