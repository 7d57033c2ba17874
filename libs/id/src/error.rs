//! UID parse failures.

use std::fmt;

use thiserror::Error;

/// A string that is not a valid UID of the requested kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind} UID {input:?}: {problem}")]
pub struct IdError {
    /// Prefix of the UID type that was being parsed.
    pub kind: &'static str,
    pub input: String,
    pub problem: IdProblem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdProblem {
    Empty,
    MissingSeparator,
    /// Well-formed, but minted for another object kind.
    ForeignPrefix(String),
    BadUlid(String),
}

impl fmt::Display for IdProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdProblem::Empty => f.write_str("empty"),
            IdProblem::MissingSeparator => f.write_str("no '_' between prefix and ULID"),
            IdProblem::ForeignPrefix(found) => {
                write!(f, "prefix '{found}' belongs to another kind")
            }
            IdProblem::BadUlid(reason) => write!(f, "bad ULID ({reason})"),
        }
    }
}

impl IdError {
    pub fn new(kind: &'static str, input: &str, problem: IdProblem) -> Self {
        Self {
            kind,
            input: input.to_string(),
            problem,
        }
    }
}
