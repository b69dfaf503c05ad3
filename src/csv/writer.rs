//! CSV encoding.

use std::io::Write;
use std::sync::Arc;

use super::CsvConfig;
use crate::error::{PipelineError, Result};
use crate::record::Record;

/// Streaming CSV writer. Each record is encoded and written as it arrives.
pub struct CsvWriter<W: Write> {
    out: W,
    config: CsvConfig,
    columns: Option<Arc<[String]>>,
    header_written: bool,
    written: u64,
    line: String,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(out: W, config: CsvConfig) -> Self {
        Self {
            out,
            config,
            columns: None,
            header_written: false,
            written: 0,
            line: String::new(),
        }
    }

    /// Fix the output columns up front instead of taking them from the
    /// first record. Lets an empty run still produce a header line.
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Output columns, once known.
    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Number of data records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Encode and write one record.
    ///
    /// The record's columns must equal the writer's columns, in order.
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        let columns = match &self.columns {
            Some(columns) => Arc::clone(columns),
            None => {
                let columns = record.column_list();
                self.columns = Some(Arc::clone(&columns));
                columns
            }
        };
        if !record.matches_columns(&columns) {
            return Err(PipelineError::SchemaMismatch {
                line: record.line(),
                expected: columns.to_vec(),
                found: record.columns().to_vec(),
            });
        }
        self.write_header()?;
        self.encode_line(record.values().iter().map(String::as_str));
        self.out.write_all(self.line.as_bytes())?;
        self.written += 1;
        Ok(())
    }

    /// Write the header if configured and not yet written.
    pub fn write_header(&mut self) -> Result<()> {
        if self.header_written || !self.config.has_header {
            return Ok(());
        }
        let Some(columns) = self.columns.clone() else {
            return Ok(());
        };
        self.encode_line(columns.iter().map(String::as_str));
        self.out.write_all(self.line.as_bytes())?;
        self.header_written = true;
        Ok(())
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.write_header()?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn encode_line<'a>(&mut self, fields: impl Iterator<Item = &'a str>) {
        self.line.clear();
        let mut count = 0;
        for (i, field) in fields.enumerate() {
            if i > 0 {
                self.line.push(self.config.delimiter);
            }
            encode_field(&mut self.line, field, &self.config);
            count += 1;
        }
        // A lone empty field would read back as a blank line.
        if count == 1 && self.line.is_empty() {
            self.line.push(self.config.quote);
            self.line.push(self.config.quote);
        }
        self.line.push('\n');
    }
}

fn needs_quoting(field: &str, config: &CsvConfig) -> bool {
    field
        .chars()
        .any(|c| c == config.delimiter || c == config.quote || c == '\n' || c == '\r')
}

fn encode_field(out: &mut String, field: &str, config: &CsvConfig) {
    if !needs_quoting(field, config) {
        out.push_str(field);
        return;
    }
    out.push(config.quote);
    for c in field.chars() {
        if c == config.quote {
            out.push(c);
        }
        out.push(c);
    }
    out.push(config.quote);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(records: &[Record], config: CsvConfig) -> String {
        let mut writer = CsvWriter::new(Vec::new(), config);
        for r in records {
            writer.write_record(r).unwrap();
        }
        String::from_utf8(writer.finish().unwrap()).unwrap()
    }

    #[test]
    fn test_header_then_rows() {
        let records = vec![
            Record::from_pairs(1, [("id", "1"), ("amount", "10")]),
            Record::from_pairs(2, [("id", "2"), ("amount", "20")]),
        ];
        assert_eq!(
            write(&records, CsvConfig::default()),
            "id,amount\n1,10\n2,20\n"
        );
    }

    #[test]
    fn test_no_header() {
        let records = vec![Record::from_pairs(1, [("id", "1")])];
        let config = CsvConfig::default().with_header(false);
        assert_eq!(write(&records, config), "1\n");
    }

    #[test]
    fn test_quotes_only_when_needed() {
        let records = vec![Record::from_pairs(
            1,
            [("a", "plain"), ("b", "x,y"), ("c", "q\"q"), ("d", "l\nm")],
        )];
        assert_eq!(
            write(&records, CsvConfig::default()),
            "a,b,c,d\nplain,\"x,y\",\"q\"\"q\",\"l\nm\"\n"
        );
    }

    #[test]
    fn test_schema_mismatch() {
        let mut writer = CsvWriter::new(Vec::new(), CsvConfig::default());
        writer
            .write_record(&Record::from_pairs(1, [("a", "1")]))
            .unwrap();
        let err = writer
            .write_record(&Record::from_pairs(2, [("b", "1")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { line: 2, .. }));
        assert_eq!(writer.written(), 1);
    }

    #[test]
    fn test_empty_output_with_fixed_columns_has_header() {
        let writer = CsvWriter::new(Vec::new(), CsvConfig::default()).with_columns(["a", "b"]);
        let out = writer.finish().unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a,b\n");
    }

    #[test]
    fn test_empty_output_without_columns_is_empty() {
        let writer = CsvWriter::new(Vec::new(), CsvConfig::default());
        assert!(writer.finish().unwrap().is_empty());
    }
}
