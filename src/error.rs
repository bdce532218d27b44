use std::num::{ParseFloatError, ParseIntError};

/// Local parse failures. Callers recover from all of these by skipping
/// or stopping; none of them abort an inspection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("no input left")]
    NoInput,
    #[error("not a thread header: {0}")]
    UnrecognizedHeader(String),
    #[error("no process header before end of input")]
    MissingProcessHeader,
    #[error("parse error: {0}")]
    Int(#[from] ParseIntError),
    #[error("parse error: {0}")]
    Float(#[from] ParseFloatError),
    #[error("bad timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("timestamp out of range: {0}")]
    OutOfRange(String),
}
