//! Error report: one entry per diverted input record.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

use crate::csv::{CsvConfig, CsvWriter, Malformed};
use crate::error::{ErrorKind, Result, StageFailure};
use crate::record::Record;

/// Stage name reported for rows the reader could not decode.
pub const READER_STAGE: &str = "reader";

/// Stage name reported for records the writer refused.
pub const WRITER_STAGE: &str = "writer";

/// Why one input record did not reach the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub line: u64,
    pub raw: String,
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<StageFailure> for FailureEntry {
    fn from(failure: StageFailure) -> Self {
        Self {
            line: failure.record.line(),
            raw: failure.record.raw().to_string(),
            stage: failure.stage,
            kind: failure.kind,
            message: failure.message,
        }
    }
}

impl From<Malformed> for FailureEntry {
    fn from(row: Malformed) -> Self {
        Self {
            line: row.line,
            raw: row.raw,
            stage: READER_STAGE.to_string(),
            kind: ErrorKind::Parse,
            message: row.message,
        }
    }
}

impl FailureEntry {
    fn to_record(&self) -> Record {
        Record::from_pairs(
            self.line,
            [
                ("line", self.line.to_string()),
                ("stage", self.stage.clone()),
                ("kind", self.kind.to_string()),
                ("message", self.message.clone()),
                ("raw", self.raw.clone()),
            ],
        )
    }
}

/// Append-only failure list shared by all workers of a run.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    entries: Mutex<Vec<FailureEntry>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: FailureEntry) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finish collecting. Entries are ordered by line.
    pub fn into_report(self) -> ErrorReport {
        let mut entries = match self.entries.into_inner() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.sort_by_key(|e| e.line);
        ErrorReport { entries }
    }
}

/// Failures of a finished run, in line order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ErrorReport {
    entries: Vec<FailureEntry>,
}

impl ErrorReport {
    pub fn entries(&self) -> &[FailureEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FailureEntry> {
        self.entries.iter()
    }

    /// Write the report as CSV with columns `line,stage,kind,message,raw`.
    pub fn write_csv<W: Write>(&self, out: W, config: &CsvConfig) -> Result<W> {
        let mut writer = CsvWriter::new(out, config.clone())
            .with_columns(["line", "stage", "kind", "message", "raw"]);
        for entry in &self.entries {
            writer.write_record(&entry.to_record())?;
        }
        writer.finish()
    }

    /// Write the report as a pretty-printed JSON array.
    pub fn write_json<W: Write>(&self, mut out: W) -> Result<W> {
        serde_json::to_writer_pretty(&mut out, &self.entries).map_err(std::io::Error::from)?;
        out.write_all(b"\n")?;
        Ok(out)
    }
}

impl<'a> IntoIterator for &'a ErrorReport {
    type Item = &'a FailureEntry;
    type IntoIter = std::slice::Iter<'a, FailureEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv::{CsvReader, CsvRow};

    fn entry(line: u64, raw: &str) -> FailureEntry {
        FailureEntry {
            line,
            raw: raw.to_string(),
            stage: "NUMBER".to_string(),
            kind: ErrorKind::Validation,
            message: "cannot parse".to_string(),
        }
    }

    #[test]
    fn test_report_sorted_by_line() {
        let collector = ErrorCollector::new();
        collector.push(entry(5, "e"));
        collector.push(entry(2, "b"));
        collector.push(entry(9, "i"));
        assert_eq!(collector.len(), 3);
        let report = collector.into_report();
        let lines: Vec<u64> = report.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 5, 9]);
    }

    #[test]
    fn test_from_stage_failure() {
        let record = Record::from_pairs(3, [("id", "3"), ("amount", "x")]);
        let failure = StageFailure::validation("bad", record).in_stage("NUMBER");
        let entry = FailureEntry::from(failure);
        assert_eq!(entry.line, 3);
        assert_eq!(entry.raw, "3,x");
        assert_eq!(entry.stage, "NUMBER");
    }

    #[test]
    fn test_from_malformed() {
        let entry = FailureEntry::from(Malformed {
            line: 4,
            raw: "\"open".to_string(),
            message: "unterminated quoted field".to_string(),
        });
        assert_eq!(entry.kind, ErrorKind::Parse);
        assert_eq!(entry.stage, READER_STAGE);
    }

    #[test]
    fn test_write_csv_reads_back() {
        let collector = ErrorCollector::new();
        collector.push(entry(2, "2,\"a,b\""));
        let report = collector.into_report();
        let out = report.write_csv(Vec::new(), &CsvConfig::default()).unwrap();

        let rows: Vec<CsvRow> = CsvReader::new(out.as_slice(), CsvConfig::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        let CsvRow::Record(r) = &rows[0] else {
            panic!("expected a record");
        };
        assert_eq!(r.get("line").unwrap(), "2");
        assert_eq!(r.get("kind").unwrap(), "validation");
        assert_eq!(r.get("raw").unwrap(), "2,\"a,b\"");
    }

    #[test]
    fn test_empty_csv_report_has_header() {
        let out = ErrorReport::default()
            .write_csv(Vec::new(), &CsvConfig::default())
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "line,stage,kind,message,raw\n");
    }

    #[test]
    fn test_write_json() {
        let collector = ErrorCollector::new();
        collector.push(entry(7, "7,x"));
        let out = collector.into_report().write_json(Vec::new()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json[0]["line"], 7);
        assert_eq!(json[0]["kind"], "validation");
        assert_eq!(json[0]["stage"], "NUMBER");
    }
}
