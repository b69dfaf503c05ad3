//! Stage contract.
//!
//! A [`Stage`] turns one record into zero or more records, or fails. Stages
//! are composed purely by position; a stage never sees its neighbours.
//!
//! Returning `Vec<Record>` covers every shape a stage needs: filters emit
//! nothing, transforms emit one record, expansions emit many.

use crate::error::StageFailure;
use crate::record::Record;

/// Outcome of one stage invocation.
pub type StageResult = Result<Vec<Record>, StageFailure>;

/// A pipeline step that processes records one at a time.
///
/// `process` may be called more than once for the same record, and a call
/// that overran its timeout keeps running after its result was dropped. It
/// must therefore leave shared state alone. Stages that accumulate across
/// records do that in `commit`, which runs once per record and only after
/// the record made it through the whole chain.
pub trait Stage: Send + Sync {
    /// Process a single record.
    fn process(&self, record: Record) -> StageResult;

    /// Keep whatever `input` contributes to accumulated state.
    fn commit(&self, _input: &Record) {}

    /// Emit any accumulated output once the input is exhausted.
    fn flush(&self) -> Vec<Record> {
        vec![]
    }

    /// Display name, used in logs, metrics and the error report.
    fn name(&self) -> &str;
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn process(&self, record: Record) -> StageResult {
        (**self).process(record)
    }

    fn commit(&self, input: &Record) {
        (**self).commit(input)
    }

    fn flush(&self) -> Vec<Record> {
        (**self).flush()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<S: Stage + ?Sized> Stage for std::sync::Arc<S> {
    fn process(&self, record: Record) -> StageResult {
        (**self).process(record)
    }

    fn commit(&self, input: &Record) {
        (**self).commit(input)
    }

    fn flush(&self) -> Vec<Record> {
        (**self).flush()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// A stage backed by a closure.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> Stage for FnStage<F>
where
    F: Fn(Record) -> StageResult + Send + Sync,
{
    fn process(&self, record: Record) -> StageResult {
        (self.f)(record)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure as a named stage.
pub fn stage_fn<F>(name: impl Into<String>, f: F) -> FnStage<F>
where
    F: Fn(Record) -> StageResult + Send + Sync,
{
    FnStage {
        name: name.into(),
        f,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_stage() {
        let stage = stage_fn("DOUBLE", |r: Record| Ok(vec![r.clone(), r]));
        assert_eq!(stage.name(), "DOUBLE");
        let out = stage.process(Record::from_pairs(1, [("a", "x")])).unwrap();
        assert_eq!(out.len(), 2);
        assert!(stage.flush().is_empty());
    }

    #[test]
    fn test_boxed_stage_delegates() {
        let stage: Box<dyn Stage> = Box::new(stage_fn("NONE", |_r: Record| Ok(vec![])));
        assert_eq!(stage.name(), "NONE");
        assert!(stage.process(Record::from_pairs(1, [("a", "x")])).unwrap().is_empty());
    }
}
