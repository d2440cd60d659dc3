//! Correlation annotations linking a run to its archived Result and Record.

use crate::run::RunView;

/// Names the Result grouping the archived run.
pub const RESULT: &str = "runvault.dev/result";
/// Names the Record holding the archived run.
pub const RECORD: &str = "runvault.dev/record";

/// Annotations as observed on a run; either may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub result: Option<String>,
    pub record: Option<String>,
}

impl Correlation {
    /// Both halves present. A half-written pair is never trusted.
    pub fn complete(&self) -> Option<CorrelationRefs> {
        match (&self.result, &self.record) {
            (Some(result), Some(record)) => Some(CorrelationRefs { result: result.clone(), record: record.clone() }),
            _ => None,
        }
    }
}

/// A complete annotation pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRefs {
    pub result: String,
    pub record: String,
}

pub fn read<R: RunView>(run: &R) -> Correlation {
    Correlation {
        result: run.annotation(RESULT).map(str::to_string),
        record: run.annotation(RECORD).map(str::to_string),
    }
}

/// Returns the annotated copy, or `None` when both values already match and
/// no update call should be made.
pub fn write<R: RunView + Clone>(run: &R, refs: &CorrelationRefs) -> Option<R> {
    if run.annotation(RESULT) == Some(refs.result.as_str()) && run.annotation(RECORD) == Some(refs.record.as_str()) {
        return None;
    }
    let mut next = run.clone();
    next.set_annotation(RESULT, &refs.result);
    next.set_annotation(RECORD, &refs.record);
    Some(next)
}
