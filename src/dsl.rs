//! DSL parser for pipeline definitions.
//!
//! Pipeline format (CMS Pipelines style):
//! ```text
//! PIPE CSV
//! | REQUIRE user_id, message
//! | TRANSLATE message
//! | scorer: SCORE message score
//! | AGGREGATE user_id score
//! | CSV
//! ?
//! ```
//!
//! - `PIPE CSV` starts the pipeline, reading records from the CSV input
//! - `| <stage>` continues to the next stage
//! - `| CSV` writes to the CSV output (optional; output is always written)
//! - `?` on its own line marks the end of the pipeline
//! - `label: <stage>` gives a stage its own name, so it can carry its own
//!   interception policy in the configuration
//!
//! Supported stages:
//! - `REQUIRE col[, col...]` - Fail records where a column is missing or blank
//! - `NUMBER col` - Parse a column as a number (fails on non-numbers)
//! - `FILTER col = "value"` - Keep records where the column equals value
//! - `FILTER col != "value"` - Drop records where the column equals value
//! - `RENAME old new` - Rename a column
//! - `DROP col` - Remove a column
//! - `SET col "value"` - Set or add a column
//! - `UPPER col` / `LOWER col` / `TRIM col` - Transform a column's text
//! - `SPLIT col "sep"` - Emit one record per piece of the column
//! - `DUPLICATE n` - Repeat each record n times
//! - `VALIDATE` - Mark records as valid
//! - `TRANSLATE col` - Translate a column's text
//! - `SCORE col target` - Score a column's text into `target`
//! - `AGGREGATE key value` - Per-key count and mean, emitted at end of input
//! - Lines starting with `#` are comments

use crate::error::{PipelineError, Result};
use crate::stage::Stage;
use crate::stages::{Named, command_to_stage};

/// Parsed pipeline command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// REQUIRE col[, col...]
    Require { columns: Vec<String> },
    /// NUMBER col
    Number { column: String },
    /// FILTER col = "value"
    FilterEq { column: String, value: String },
    /// FILTER col != "value"
    FilterNe { column: String, value: String },
    /// RENAME old new
    Rename { from: String, to: String },
    /// DROP col
    Drop { column: String },
    /// SET col "value"
    Set { column: String, value: String },
    /// UPPER col
    Upper { column: String },
    /// LOWER col
    Lower { column: String },
    /// TRIM col
    Trim { column: String },
    /// SPLIT col "sep"
    Split { column: String, separator: String },
    /// DUPLICATE n
    Duplicate { n: usize },
    /// VALIDATE
    Validate,
    /// TRANSLATE col
    Translate { column: String },
    /// SCORE col target
    Score { column: String, target: String },
    /// AGGREGATE key value
    Aggregate { key: String, value: String },
}

impl Command {
    /// Get the stage name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Require { .. } => "REQUIRE",
            Command::Number { .. } => "NUMBER",
            Command::FilterEq { .. } | Command::FilterNe { .. } => "FILTER",
            Command::Rename { .. } => "RENAME",
            Command::Drop { .. } => "DROP",
            Command::Set { .. } => "SET",
            Command::Upper { .. } => "UPPER",
            Command::Lower { .. } => "LOWER",
            Command::Trim { .. } => "TRIM",
            Command::Split { .. } => "SPLIT",
            Command::Duplicate { .. } => "DUPLICATE",
            Command::Validate => "VALIDATE",
            Command::Translate { .. } => "TRANSLATE",
            Command::Score { .. } => "SCORE",
            Command::Aggregate { .. } => "AGGREGATE",
        }
    }
}

/// One stage of a parsed pipeline, with its optional label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDef {
    pub label: Option<String>,
    pub command: Command,
}

impl StageDef {
    /// The name the stage will report: its label, or the command name.
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or(self.command.name())
    }

    pub fn build(&self) -> Box<dyn Stage> {
        let stage = command_to_stage(&self.command);
        match &self.label {
            Some(label) => Box::new(Named::new(label.clone(), stage)),
            None => stage,
        }
    }
}

/// Parse a pipeline definition into stage definitions.
pub fn parse_pipeline(text: &str) -> Result<Vec<StageDef>> {
    parse_commands(text).map_err(PipelineError::Dsl)
}

/// Parse a pipeline definition and build its stages.
pub fn build_stages(text: &str) -> Result<Vec<Box<dyn Stage>>> {
    Ok(parse_pipeline(text)?.iter().map(StageDef::build).collect())
}

/// Parse DSL text into stage definitions.
///
/// The first stage must be the `CSV` source; a final `CSV` sink is
/// accepted and dropped.
pub fn parse_commands(text: &str) -> std::result::Result<Vec<StageDef>, String> {
    let mut defs = Vec::new();
    let mut saw_source = false;
    let mut saw_sink = false;

    for (line_num, line) in text.lines().enumerate() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Handle "PIPE COMMAND" - extract command after PIPE
        let line = if line.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("PIPE ")) {
            line[5..].trim()
        } else if line.eq_ignore_ascii_case("PIPE") {
            continue;
        } else {
            line
        };

        // Handle continuation lines: "| COMMAND ..."
        let line = if let Some(stripped) = line.strip_prefix('|') {
            stripped.trim()
        } else {
            line
        };

        // Remove trailing ? (explicit end of pipeline)
        let line = line.trim_end_matches('?').trim();

        if line.is_empty() {
            continue;
        }

        let at = |e: String| format!("Line {}: {}", line_num + 1, e);

        if line.eq_ignore_ascii_case("CSV") {
            if !saw_source {
                saw_source = true;
            } else if !saw_sink {
                saw_sink = true;
            } else {
                return Err(at("CSV can only be the first and last stage".to_string()));
            }
            continue;
        }

        if !saw_source {
            return Err(at(format!(
                "pipeline must start with CSV, found {}",
                line.split_whitespace().next().unwrap_or(line)
            )));
        }
        if saw_sink {
            return Err(at("no stages may follow the CSV sink".to_string()));
        }

        defs.push(parse_stage(line).map_err(at)?);
    }

    if !saw_source {
        return Err("Pipeline is empty".to_string());
    }
    Ok(defs)
}

/// Parse one stage line, including an optional `label:` prefix.
fn parse_stage(line: &str) -> std::result::Result<StageDef, String> {
    let first = line.split_whitespace().next().unwrap_or(line);
    if let Some(label) = first.strip_suffix(':') {
        if label.is_empty() {
            return Err("empty stage label".to_string());
        }
        let rest = line[first.len()..].trim();
        return Ok(StageDef {
            label: Some(label.to_string()),
            command: parse_command(rest)?,
        });
    }
    Ok(StageDef {
        label: None,
        command: parse_command(line)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Text(String),
    Eq,
    Ne,
}

impl Token {
    fn into_value(self) -> Option<String> {
        match self {
            Token::Word(s) | Token::Text(s) => Some(s),
            Token::Eq | Token::Ne => None,
        }
    }
}

/// Split stage arguments into words, quoted strings and operators.
///
/// Commas separate words like whitespace. Inside quotes a doubled quote is
/// a literal quote.
fn tokenize(s: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == ',' {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        text.push('"');
                    }
                    Some('"') => break,
                    Some(c) => text.push(c),
                    None => return Err("Unterminated string".to_string()),
                }
            }
            tokens.push(Token::Text(text));
        } else if c == '=' {
            chars.next();
            tokens.push(Token::Eq);
        } else if c == '!' {
            chars.next();
            if chars.next() != Some('=') {
                return Err("Expected != operator".to_string());
            }
            tokens.push(Token::Ne);
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || matches!(c, ',' | '=' | '!' | '"') {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }

    Ok(tokens)
}

/// Take exactly `n` value arguments.
fn values(
    cmd: &str,
    tokens: Vec<Token>,
    n: usize,
    usage: &str,
) -> std::result::Result<Vec<String>, String> {
    if tokens.len() != n {
        return Err(format!("{cmd} expects: {cmd} {usage}"));
    }
    tokens
        .into_iter()
        .map(|t| t.into_value().ok_or_else(|| format!("{cmd} expects: {cmd} {usage}")))
        .collect()
}

/// Parse a single command line.
fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let (word, args) = match line.split_once(char::is_whitespace) {
        Some((word, args)) => (word, args.trim()),
        None => (line, ""),
    };
    let cmd = word.to_uppercase();
    let tokens = tokenize(args)?;

    match cmd.as_str() {
        "REQUIRE" => {
            if tokens.is_empty() {
                return Err("REQUIRE expects at least one column".to_string());
            }
            let n = tokens.len();
            let columns = values("REQUIRE", tokens, n, "col[, col...]")?;
            Ok(Command::Require { columns })
        }
        "NUMBER" => {
            let mut v = values("NUMBER", tokens, 1, "col")?;
            Ok(Command::Number { column: v.remove(0) })
        }
        "FILTER" => parse_filter(tokens),
        "RENAME" => {
            let mut v = values("RENAME", tokens, 2, "old new")?;
            let to = v.remove(1);
            Ok(Command::Rename {
                from: v.remove(0),
                to,
            })
        }
        "DROP" => {
            let mut v = values("DROP", tokens, 1, "col")?;
            Ok(Command::Drop { column: v.remove(0) })
        }
        "SET" => {
            let mut v = values("SET", tokens, 2, "col \"value\"")?;
            let value = v.remove(1);
            Ok(Command::Set {
                column: v.remove(0),
                value,
            })
        }
        "UPPER" | "LOWER" | "TRIM" => {
            let mut v = values(&cmd, tokens, 1, "col")?;
            let column = v.remove(0);
            Ok(match cmd.as_str() {
                "UPPER" => Command::Upper { column },
                "LOWER" => Command::Lower { column },
                _ => Command::Trim { column },
            })
        }
        "SPLIT" => {
            let mut v = values("SPLIT", tokens, 2, "col \"sep\"")?;
            let separator = v.remove(1);
            if separator.is_empty() {
                return Err("SPLIT separator cannot be empty".to_string());
            }
            Ok(Command::Split {
                column: v.remove(0),
                separator,
            })
        }
        "DUPLICATE" => {
            let v = values("DUPLICATE", tokens, 1, "n")?;
            let n = v[0]
                .parse()
                .map_err(|_| format!("Invalid DUPLICATE count: {}", v[0]))?;
            Ok(Command::Duplicate { n })
        }
        "VALIDATE" => {
            values("VALIDATE", tokens, 0, "")?;
            Ok(Command::Validate)
        }
        "TRANSLATE" => {
            let mut v = values("TRANSLATE", tokens, 1, "col")?;
            Ok(Command::Translate { column: v.remove(0) })
        }
        "SCORE" => {
            let mut v = values("SCORE", tokens, 2, "col target")?;
            let target = v.remove(1);
            Ok(Command::Score {
                column: v.remove(0),
                target,
            })
        }
        "AGGREGATE" => {
            let mut v = values("AGGREGATE", tokens, 2, "key value")?;
            let value = v.remove(1);
            Ok(Command::Aggregate {
                key: v.remove(0),
                value,
            })
        }
        _ => Err(format!("Unknown command: {word}")),
    }
}

/// Parse FILTER arguments: `col = "value"` or `col != "value"`.
fn parse_filter(tokens: Vec<Token>) -> std::result::Result<Command, String> {
    let usage = || "FILTER expects: FILTER col = \"value\" or FILTER col != \"value\"".to_string();
    let mut it = tokens.into_iter();
    let (Some(column), Some(op), Some(value), None) = (it.next(), it.next(), it.next(), it.next())
    else {
        return Err(usage());
    };
    let column = column.into_value().ok_or_else(usage)?;
    let value = value.into_value().ok_or_else(usage)?;
    match op {
        Token::Eq => Ok(Command::FilterEq { column, value }),
        Token::Ne => Ok(Command::FilterNe { column, value }),
        _ => Err(usage()),
    }
}
