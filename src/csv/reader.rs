//! CSV decoding.
//!
//! The reader works one physical line at a time. A row is scanned by a small
//! state machine; a quoted field that is still open at the end of a physical
//! line pulls in the next line. Malformed rows are reported as
//! [`CsvRow::Malformed`] and scanning carries on with the next row.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Arc;

use super::{CsvConfig, CsvRow, Malformed};
use crate::error::{PipelineError, Result};
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the first character of a field
    FieldStart,
    /// Inside a field that did not start with a quote
    Unquoted,
    /// Inside a quoted field
    Quoted,
    /// Saw a quote inside a quoted field: closing quote or first half of an escape
    QuoteInQuoted,
    /// Past the closing quote, only whitespace (when trimming) or a delimiter allowed
    AfterQuoted,
}

/// Field accumulator for one row.
struct Scan {
    state: State,
    fields: Vec<String>,
    field: String,
    quoted: bool,
}

impl Scan {
    fn new() -> Self {
        Self {
            state: State::FieldStart,
            fields: Vec::new(),
            field: String::new(),
            quoted: false,
        }
    }

    fn end_field(&mut self, trim: bool) {
        let value = std::mem::take(&mut self.field);
        let value = if trim && !self.quoted {
            value.trim().to_string()
        } else {
            value
        };
        self.fields.push(value);
        self.quoted = false;
        self.state = State::FieldStart;
    }

    /// Feed one physical line. Returns `Ok(true)` when the row is complete,
    /// `Ok(false)` when a quoted field continues on the next line.
    fn feed(&mut self, line: &str, config: &CsvConfig) -> std::result::Result<bool, String> {
        let (delim, quote, trim) = (config.delimiter, config.quote, config.trim);

        for c in line.chars() {
            match self.state {
                State::FieldStart => {
                    if c == quote {
                        self.quoted = true;
                        self.state = State::Quoted;
                    } else if c == delim {
                        self.end_field(trim);
                    } else if trim && c.is_whitespace() {
                        // leading whitespace
                    } else {
                        self.field.push(c);
                        self.state = State::Unquoted;
                    }
                }
                State::Unquoted => {
                    if c == delim {
                        self.end_field(trim);
                    } else if c == quote {
                        return Err(format!("quote character {quote:?} inside unquoted field"));
                    } else {
                        self.field.push(c);
                    }
                }
                State::Quoted => {
                    if c == quote {
                        self.state = State::QuoteInQuoted;
                    } else {
                        self.field.push(c);
                    }
                }
                State::QuoteInQuoted => {
                    if c == quote {
                        self.field.push(quote);
                        self.state = State::Quoted;
                    } else if c == delim {
                        self.end_field(trim);
                    } else if trim && c.is_whitespace() {
                        self.state = State::AfterQuoted;
                    } else {
                        return Err(format!("unexpected {c:?} after closing quote"));
                    }
                }
                State::AfterQuoted => {
                    if c == delim {
                        self.end_field(trim);
                    } else if !c.is_whitespace() {
                        return Err(format!("unexpected {c:?} after closing quote"));
                    }
                }
            }
        }

        if self.state == State::Quoted {
            self.field.push('\n');
            return Ok(false);
        }
        self.end_field(trim);
        Ok(true)
    }
}

/// Lazy, finite, non-restartable sequence of rows from delimited text.
pub struct CsvReader<R> {
    input: R,
    config: CsvConfig,
    columns: Option<Arc<[String]>>,
    header_done: bool,
    /// Physical lines to scan again before reading more input
    pending: VecDeque<String>,
    next_row: u64,
    physical_line: u64,
    finished: bool,
}

impl<R: BufRead> CsvReader<R> {
    pub fn new(input: R, config: CsvConfig) -> Self {
        Self {
            input,
            config,
            columns: None,
            header_done: false,
            pending: VecDeque::new(),
            next_row: 1,
            physical_line: 0,
            finished: false,
        }
    }

    /// Column names: the header row, or positional names once the first
    /// row has been read from a headerless input. `None` for empty input.
    pub fn headers(&mut self) -> Result<Option<&[String]>> {
        self.ensure_header()?;
        Ok(self.columns.as_deref())
    }

    pub fn config(&self) -> &CsvConfig {
        &self.config
    }

    fn read_physical(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }
        let mut buf = Vec::new();
        if self.input.read_until(b'\n', &mut buf)? == 0 {
            return Ok(None);
        }
        self.physical_line += 1;
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        String::from_utf8(buf).map(Some).map_err(|_| PipelineError::InvalidUtf8 {
            line: self.physical_line,
        })
    }

    fn is_blank(&self, line: &str) -> bool {
        if self.config.trim {
            line.trim().is_empty()
        } else {
            line.is_empty()
        }
    }

    /// Scan the next non-blank row. Returns the consumed physical lines and
    /// either the fields or an error message.
    #[allow(clippy::type_complexity)]
    fn scan_row(
        &mut self,
    ) -> Result<Option<(Vec<String>, std::result::Result<Vec<String>, String>)>> {
        let first = loop {
            match self.read_physical()? {
                None => return Ok(None),
                Some(line) if self.is_blank(&line) => continue,
                Some(line) => break line,
            }
        };

        let mut scan = Scan::new();
        let mut lines = vec![first];
        loop {
            let current = lines.last().map(String::as_str).unwrap_or_default();
            match scan.feed(current, &self.config) {
                Ok(true) => return Ok(Some((lines, Ok(scan.fields)))),
                Ok(false) => match self.read_physical()? {
                    Some(next) => lines.push(next),
                    None => {
                        // Unterminated quote: blame the first line, re-scan the rest.
                        let swallowed: Vec<String> = lines.drain(1..).collect();
                        for line in swallowed.into_iter().rev() {
                            self.pending.push_front(line);
                        }
                        return Ok(Some((lines, Err("unterminated quoted field".to_string()))));
                    }
                },
                Err(message) => return Ok(Some((lines, Err(message)))),
            }
        }
    }

    fn ensure_header(&mut self) -> Result<()> {
        if self.header_done {
            return Ok(());
        }
        self.header_done = true;
        if !self.config.has_header {
            return Ok(());
        }
        let Some((lines, fields)) = self.scan_row()? else {
            return Ok(());
        };
        let names = fields.map_err(|message| {
            PipelineError::MalformedHeader(format!("{message}: {}", lines.join("\n")))
        })?;
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(PipelineError::MalformedHeader(format!(
                    "column {} has no name",
                    i + 1
                )));
            }
            if names[..i].contains(name) {
                return Err(PipelineError::MalformedHeader(format!(
                    "duplicate column '{name}'"
                )));
            }
        }
        self.columns = Some(names.into());
        Ok(())
    }

    fn read_row(&mut self) -> Result<Option<CsvRow>> {
        self.ensure_header()?;
        let Some((lines, fields)) = self.scan_row()? else {
            return Ok(None);
        };

        let line = self.next_row;
        self.next_row += 1;
        let raw = lines.join("\n");

        let fields = match fields {
            Ok(fields) => fields,
            Err(message) => return Ok(Some(CsvRow::Malformed(Malformed { line, raw, message }))),
        };

        let columns = match &self.columns {
            Some(columns) => Arc::clone(columns),
            None => {
                // Headerless input: the first row fixes the width.
                let names: Arc<[String]> = (1..=fields.len()).map(|i| i.to_string()).collect();
                self.columns = Some(Arc::clone(&names));
                names
            }
        };

        if fields.len() != columns.len() {
            return Ok(Some(CsvRow::Malformed(Malformed {
                line,
                raw,
                message: format!(
                    "expected {} fields, found {}",
                    columns.len(),
                    fields.len()
                ),
            })));
        }

        Ok(Some(CsvRow::Record(Record::new(
            columns,
            fields,
            line,
            Arc::from(raw),
        ))))
    }
}

impl<R: BufRead> Iterator for CsvReader<R> {
    type Item = Result<CsvRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
