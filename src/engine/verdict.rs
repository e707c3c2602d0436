use std::fmt;

use crate::engine::sandbox::{ExecutionOutcome, Termination};

/// Canonical form used for output comparison: CRLF becomes LF, then leading
/// and trailing whitespace of the whole text is dropped. Inner lines and
/// spacing are left alone.
///
/// A run of CRs before an LF collapses as a whole; a single-pass replace
/// would turn `\r\r\n` into a fresh `\r\n` and break idempotence.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_cr = 0usize;
    for ch in text.chars() {
        match ch {
            '\r' => pending_cr += 1,
            '\n' => {
                pending_cr = 0;
                out.push('\n');
            }
            other => {
                out.extend(std::iter::repeat_n('\r', pending_cr));
                pending_cr = 0;
                out.push(other);
            }
        }
    }
    out.extend(std::iter::repeat_n('\r', pending_cr));
    out.trim().to_string()
}

/// Terminal result of a graded submission. Indices are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    CompileError(String),
    WrongAnswer(usize),
    TimeLimitExceeded(usize),
    MemoryLimitExceeded(usize),
    OutputLimitExceeded(usize),
    RuntimeError { index: usize, detail: String },
}

impl Verdict {
    /// Grades one test case. `None` means it passed.
    pub fn evaluate(index: usize, outcome: &ExecutionOutcome, expected: &str) -> Option<Self> {
        match &outcome.termination {
            Termination::TimedOut => Some(Verdict::TimeLimitExceeded(index)),
            Termination::MemoryExceeded => Some(Verdict::MemoryLimitExceeded(index)),
            Termination::OutputLimitExceeded => Some(Verdict::OutputLimitExceeded(index)),
            Termination::RuntimeError { .. } => Some(Verdict::RuntimeError {
                index,
                detail: outcome.runtime_detail(),
            }),
            Termination::Normal if normalize(&outcome.output) == normalize(expected) => None,
            Termination::Normal => Some(Verdict::WrongAnswer(index)),
        }
    }

    pub fn failed_test_case(&self) -> Option<usize> {
        match self {
            Verdict::Accepted | Verdict::CompileError(_) => None,
            Verdict::WrongAnswer(index)
            | Verdict::TimeLimitExceeded(index)
            | Verdict::MemoryLimitExceeded(index)
            | Verdict::OutputLimitExceeded(index)
            | Verdict::RuntimeError { index, .. } => Some(*index),
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Verdict::RuntimeError { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accepted => f.write_str("Accepted"),
            Verdict::CompileError(detail) => write!(f, "Compilation Error: {detail}"),
            Verdict::WrongAnswer(i) => write!(f, "WA on Testcase {i}"),
            Verdict::TimeLimitExceeded(i) => write!(f, "TLE on Testcase {i}"),
            Verdict::MemoryLimitExceeded(i) => write!(f, "MLE on Testcase {i}"),
            Verdict::OutputLimitExceeded(i) => write!(f, "OLE on Testcase {i}"),
            Verdict::RuntimeError { index, .. } => write!(f, "Runtime Error on Testcase {index}"),
        }
    }
}
