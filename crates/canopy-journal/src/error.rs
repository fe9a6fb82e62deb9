use thiserror::Error;

/// Errors from journal reads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JournalError {
    /// `from_seq` exceeds `to_seq`, or the range starts at zero.
    #[error("invalid delta range [{from}, {to}]")]
    InvalidRange { from: u64, to: u64 },
}

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;
