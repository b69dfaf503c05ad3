//! Streaming CSV codec.
//!
//! [`CsvReader`] decodes delimited text into [`Record`]s with an explicit
//! state machine; [`CsvWriter`] encodes records back, quoting only where
//! needed. Both share one [`CsvConfig`] so that writing then reading with the
//! same configuration yields the same records.

mod reader;
mod writer;

pub use reader::CsvReader;
pub use writer::CsvWriter;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::record::Record;

/// Dialect settings shared by the reader and the writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvConfig {
    /// Field separator
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Quote character; doubled inside a quoted field for a literal quote
    #[serde(default = "default_quote")]
    pub quote: char,

    /// First row holds column names
    #[serde(default = "default_true")]
    pub has_header: bool,

    /// Strip whitespace around fields
    #[serde(default)]
    pub trim: bool,
}

fn default_delimiter() -> char {
    ','
}

fn default_quote() -> char {
    '"'
}

fn default_true() -> bool {
    true
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            quote: default_quote(),
            has_header: true,
            trim: false,
        }
    }
}

impl CsvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_quote(mut self, quote: char) -> Self {
        self.quote = quote;
        self
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_trim(mut self, trim: bool) -> Self {
        self.trim = trim;
        self
    }

    /// Reject dialects the scanner cannot disambiguate.
    pub fn validate(&self) -> Result<()> {
        if self.delimiter == self.quote {
            return Err(PipelineError::Config(format!(
                "delimiter and quote are both '{}'",
                self.delimiter
            )));
        }
        for (name, c) in [("delimiter", self.delimiter), ("quote", self.quote)] {
            if c == '\n' || c == '\r' {
                return Err(PipelineError::Config(format!(
                    "{name} cannot be a line break"
                )));
            }
        }
        Ok(())
    }
}

/// A data row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Malformed {
    /// Data row ordinal, numbered like [`Record::line`]
    pub line: u64,
    /// The offending input text
    pub raw: String,
    pub message: String,
}

/// One item from a [`CsvReader`].
#[derive(Debug, Clone, PartialEq)]
pub enum CsvRow {
    Record(Record),
    Malformed(Malformed),
}

impl CsvRow {
    pub fn line(&self) -> u64 {
        match self {
            CsvRow::Record(r) => r.line(),
            CsvRow::Malformed(m) => m.line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(text: &str, config: &CsvConfig) -> Vec<CsvRow> {
        CsvReader::new(text.as_bytes(), config.clone())
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn write_all(records: &[Record], config: &CsvConfig) -> String {
        let mut writer = CsvWriter::new(Vec::new(), config.clone());
        for r in records {
            writer.write_record(r).unwrap();
        }
        String::from_utf8(writer.finish().unwrap()).unwrap()
    }

    fn values(rows: &[CsvRow]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| match row {
                CsvRow::Record(r) => r.values().to_vec(),
                CsvRow::Malformed(m) => panic!("unexpected malformed row: {m:?}"),
            })
            .collect()
    }

    #[test]
    fn test_validate_rejects_same_delimiter_and_quote() {
        let config = CsvConfig::new().with_quote(',');
        assert!(config.validate().is_err());
        assert!(CsvConfig::new().with_delimiter('\n').validate().is_err());
        assert!(CsvConfig::new().validate().is_ok());
    }

    #[test]
    fn test_round_trip_awkward_fields() {
        let config = CsvConfig::new();
        let records = vec![
            Record::from_pairs(1, [("name", "plain"), ("note", "has, comma")]),
            Record::from_pairs(2, [("name", "say \"hi\""), ("note", "two\nlines")]),
            Record::from_pairs(3, [("name", ""), ("note", "  padded  ")]),
        ];
        let text = write_all(&records, &config);
        let rows = read_all(&text, &config);
        let expected: Vec<Vec<String>> = records.iter().map(|r| r.values().to_vec()).collect();
        assert_eq!(values(&rows), expected);
        for (row, original) in rows.iter().zip(&records) {
            let CsvRow::Record(r) = row else { unreachable!() };
            assert_eq!(r.columns(), original.columns());
        }
    }

    #[test]
    fn test_round_trip_custom_dialect() {
        let config = CsvConfig::new().with_delimiter(';').with_quote('\'');
        let records = vec![
            Record::from_pairs(1, [("a", "x;y"), ("b", "it's")]),
            Record::from_pairs(2, [("a", "1,2"), ("b", "\"dq\"")]),
        ];
        let text = write_all(&records, &config);
        assert!(text.contains("'x;y'"));
        assert!(text.contains("'it''s'"));
        assert!(text.contains("1,2;\"dq\""));
        let rows = read_all(&text, &config);
        assert_eq!(values(&rows)[0], vec!["x;y", "it's"]);
        assert_eq!(values(&rows)[1], vec!["1,2", "\"dq\""]);
    }

    #[test]
    fn test_round_trip_single_empty_column() {
        let config = CsvConfig::new();
        let records = vec![
            Record::from_pairs(1, [("only", "")]),
            Record::from_pairs(2, [("only", "x")]),
        ];
        let text = write_all(&records, &config);
        let rows = read_all(&text, &config);
        assert_eq!(values(&rows), vec![vec![""], vec!["x"]]);
    }
}
