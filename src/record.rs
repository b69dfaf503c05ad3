//! Record model.
//!
//! A [`Record`] is one parsed CSV row: an ordered mapping from column name to
//! string value. Column names are shared between all records of a stream, so
//! copying a record only copies its values.
//!
//! Records are values. Stages that "change" a record build a new one with
//! [`Record::with`], [`Record::without`] or [`Record::renamed`]; the source
//! line number and raw text travel with every derived record so failures can
//! always be attributed to an input row.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{MissingColumn, RenameError, StatusError};

/// Validation state of a record within one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Valid,
    Invalid(String),
}

impl ValidationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ValidationStatus::Pending)
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Pending => f.write_str("pending"),
            ValidationStatus::Valid => f.write_str("valid"),
            ValidationStatus::Invalid(reason) => write!(f, "invalid ({reason})"),
        }
    }
}

/// One row of tabular data.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<String>,
    line: u64,
    raw: Arc<str>,
    status: ValidationStatus,
}

impl Record {
    /// Create a record from a shared column list and matching values.
    ///
    /// `values` must have one entry per column.
    pub fn new(columns: Arc<[String]>, values: Vec<String>, line: u64, raw: Arc<str>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self {
            columns,
            values,
            line,
            raw,
            status: ValidationStatus::Pending,
        }
    }

    /// Build a record from `(column, value)` pairs.
    ///
    /// The raw text is the comma-joined values. Mostly useful for records
    /// that do not come from a reader, such as aggregation output.
    pub fn from_pairs<K, V>(line: u64, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<String>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        let raw: Arc<str> = Arc::from(values.join(","));
        Self::new(columns.into(), values, line, raw)
    }

    /// Value of `column`.
    pub fn get(&self, column: &str) -> Result<&str, MissingColumn> {
        self.position(column)
            .map(|idx| self.values[idx].as_str())
            .ok_or_else(|| MissingColumn {
                column: column.to_string(),
                line: self.line,
            })
    }

    /// Index of `column` in the column order.
    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.position(column).is_some()
    }

    /// Copy of this record with `column` set to `value`.
    ///
    /// An existing column keeps its position; a new column is appended.
    pub fn with(&self, column: &str, value: impl Into<String>) -> Record {
        let mut next = self.clone();
        match self.position(column) {
            Some(idx) => next.values[idx] = value.into(),
            None => {
                let mut columns = self.columns.to_vec();
                columns.push(column.to_string());
                next.columns = columns.into();
                next.values.push(value.into());
            }
        }
        next
    }

    /// Copy of this record without `column`. Unknown columns are ignored.
    pub fn without(&self, column: &str) -> Record {
        let Some(idx) = self.position(column) else {
            return self.clone();
        };
        let mut next = self.clone();
        let mut columns = self.columns.to_vec();
        columns.remove(idx);
        next.columns = columns.into();
        next.values.remove(idx);
        next
    }

    /// Copy of this record with column `from` renamed to `to`. Fails if
    /// `from` is missing or `to` already names another column.
    pub fn renamed(&self, from: &str, to: &str) -> Result<Record, RenameError> {
        let idx = self.position(from).ok_or_else(|| MissingColumn {
            column: from.to_string(),
            line: self.line,
        })?;
        if from != to && self.position(to).is_some() {
            return Err(RenameError::Exists {
                column: to.to_string(),
                line: self.line,
            });
        }
        let mut next = self.clone();
        let mut columns = self.columns.to_vec();
        columns[idx] = to.to_string();
        next.columns = columns.into();
        Ok(next)
    }

    /// Mark the record valid. Fails if the status is already terminal.
    pub fn mark_valid(self) -> Result<Record, StatusError> {
        self.transition(ValidationStatus::Valid)
    }

    /// Mark the record invalid. Fails if the status is already terminal.
    pub fn mark_invalid(self, reason: impl Into<String>) -> Result<Record, StatusError> {
        self.transition(ValidationStatus::Invalid(reason.into()))
    }

    fn transition(mut self, next: ValidationStatus) -> Result<Record, StatusError> {
        if self.status.is_terminal() {
            return Err(StatusError {
                line: self.line,
                current: self.status,
            });
        }
        self.status = next;
        Ok(self)
    }

    pub fn status(&self) -> &ValidationStatus {
        &self.status
    }

    /// Source line number: the 1-based ordinal of the data row.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// The row exactly as it appeared in the input.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn shared_raw(&self) -> Arc<str> {
        Arc::clone(&self.raw)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Shared handle to the column list.
    pub fn column_list(&self) -> Arc<[String]> {
        Arc::clone(&self.columns)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Does the record have exactly `columns`, in that order?
    pub fn matches_columns(&self, columns: &[String]) -> bool {
        self.columns.as_ref() == columns
    }

    /// Re-number a record. Used for records produced after the input ends.
    pub(crate) fn at_line(mut self, line: u64) -> Record {
        self.line = line;
        self
    }
}
