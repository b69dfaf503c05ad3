//! Record-at-a-time (RAT) chain execution.
//!
//! Each input record is pushed through the entire stage chain before the
//! next one is read. A failure at any stage diverts the whole input record:
//! sibling records from an earlier fan-out are discarded with it.

use std::convert::Infallible;

use crate::error::StageFailure;
use crate::record::Record;
use crate::stage::Stage;

/// Push records through a slice of stages, processing each record
/// through each stage in sequence.
///
/// Stage commits are held back until every record has passed every stage,
/// so a diverted record leaves no trace in accumulating stages.
pub fn push_through_stages<S: Stage>(
    records: Vec<Record>,
    stages: &[S],
) -> Result<Vec<Record>, StageFailure> {
    let mut accepted: Vec<(&S, Record)> = Vec::new();
    let mut current = records;
    for stage in stages {
        let mut next = Vec::with_capacity(current.len());
        for r in current {
            let input = r.clone();
            next.extend(stage.process(r).map_err(|f| f.in_stage(stage.name()))?);
            accepted.push((stage, input));
        }
        current = next;
    }
    for (stage, input) in &accepted {
        stage.commit(input);
    }
    Ok(current)
}

/// Flush propagation: flush each stage in order and push every flushed
/// record through the stages downstream of it.
///
/// Flushed records are numbered from `next_line` onward so report entries
/// for them sort after the input rows.
pub fn flush_stages<S, F, E>(stages: &[S], next_line: &mut u64, mut emit: F) -> Result<(), E>
where
    S: Stage,
    F: FnMut(Result<Vec<Record>, StageFailure>) -> Result<(), E>,
{
    for i in 0..stages.len() {
        for record in stages[i].flush() {
            let record = record.at_line(*next_line);
            *next_line += 1;
            emit(push_through_stages(vec![record], &stages[i + 1..]))?;
        }
    }
    Ok(())
}

/// Run records through the chain in memory, flushing at the end.
///
/// Returns the output records and one failure per diverted record.
pub fn execute_rat<S: Stage>(input: Vec<Record>, stages: &[S]) -> (Vec<Record>, Vec<StageFailure>) {
    let mut output = Vec::new();
    let mut failures = Vec::new();
    let mut next_line = input.iter().map(Record::line).max().unwrap_or(0) + 1;

    for record in input {
        match push_through_stages(vec![record], stages) {
            Ok(records) => output.extend(records),
            Err(failure) => failures.push(failure),
        }
    }

    let Ok(()) = flush_stages(stages, &mut next_line, |outcome| -> Result<(), Infallible> {
        match outcome {
            Ok(records) => output.extend(records),
            Err(failure) => failures.push(failure),
        }
        Ok(())
    });

    (output, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Command;
    use crate::error::ErrorKind;
    use crate::stages::command_to_stage;

    fn stages(commands: &[Command]) -> Vec<Box<dyn Stage>> {
        commands.iter().map(command_to_stage).collect()
    }

    fn rows(pairs: &[(&str, &str)]) -> Vec<Record> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (user, amount))| {
                Record::from_pairs(i as u64 + 1, [("user", *user), ("amount", *amount)])
            })
            .collect()
    }

    #[test]
    fn test_simple_passthrough() {
        let (out, failures) = execute_rat::<Box<dyn Stage>>(rows(&[("a", "1"), ("b", "2")]), &[]);
        assert_eq!(out.len(), 2);
        assert!(failures.is_empty());
        assert_eq!(out[0].get("user").unwrap(), "a");
        assert_eq!(out[1].get("user").unwrap(), "b");
    }

    #[test]
    fn test_failure_diverts_record() {
        let chain = stages(&[
            Command::Number {
                column: "amount".to_string(),
            },
            Command::Upper {
                column: "user".to_string(),
            },
        ]);
        let (out, failures) = execute_rat(rows(&[("a", "1"), ("b", "x"), ("c", "3")]), &chain);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].get("user").unwrap(), "C");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, "NUMBER");
        assert_eq!(failures[0].kind, ErrorKind::Validation);
        assert_eq!(failures[0].record.line(), 2);
    }

    #[test]
    fn test_fan_out_failure_is_one_entry() {
        let chain = stages(&[
            Command::Duplicate { n: 3 },
            Command::Number {
                column: "amount".to_string(),
            },
        ]);
        let (out, failures) = execute_rat(rows(&[("a", "nope")]), &chain);
        assert!(out.is_empty());
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_duplicate_expansion() {
        let chain = stages(&[Command::Duplicate { n: 3 }]);
        let (out, _) = execute_rat(rows(&[("a", "1")]), &chain);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_flush_output_runs_downstream() {
        let chain = stages(&[
            Command::Aggregate {
                key: "user".to_string(),
                value: "amount".to_string(),
            },
            Command::Upper {
                column: "user".to_string(),
            },
        ]);
        let (out, failures) =
            execute_rat(rows(&[("b", "1"), ("a", "2"), ("b", "3")]), &chain);
        assert!(failures.is_empty());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("user").unwrap(), "A");
        assert_eq!(out[1].get("total_messages").unwrap(), "2");
        assert_eq!(out[1].get("avg_score").unwrap(), "2.000");
        // Flushed records are numbered after the last input row.
        assert_eq!(out[0].line(), 4);
        assert_eq!(out[1].line(), 5);
    }

    #[test]
    fn test_flush_on_empty_input() {
        let chain = stages(&[Command::Aggregate {
            key: "user".to_string(),
            value: "amount".to_string(),
        }]);
        let (out, failures) = execute_rat(vec![], &chain);
        assert!(out.is_empty());
        assert!(failures.is_empty());
    }

    #[test]
    fn test_diverted_row_is_not_aggregated() {
        let chain = stages(&[
            Command::Split {
                column: "amount".to_string(),
                separator: ";".to_string(),
            },
            Command::Aggregate {
                key: "user".to_string(),
                value: "amount".to_string(),
            },
        ]);
        // The first piece of row 1 parses; the second does not.
        let (out, failures) = execute_rat(rows(&[("a", "1;x"), ("a", "4")]), &chain);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].record.line(), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("total_messages").unwrap(), "1");
        assert_eq!(out[0].get("avg_score").unwrap(), "4.000");
    }
}
