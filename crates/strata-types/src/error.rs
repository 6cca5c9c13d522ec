use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid byte range: end {end} is before start {start}")]
    InvalidRange { start: u64, end: u64 },

    #[error("malformed range header: {0}")]
    MalformedRange(String),
}
