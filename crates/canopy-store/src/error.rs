use canopy_types::Hash;

/// Errors from local store and object store operations.
///
/// A missing key is not an error: reads return `Ok(None)` for absent keys.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A persisted record could not be decoded. Names the offending key.
    #[error("failed to parse {what} for {key}: {reason}")]
    Parse {
        what: &'static str,
        key: Hash,
        reason: String,
    },

    /// A tree carried two entries with the same name.
    #[error("duplicate tree entry {0:?}")]
    DuplicateEntry(String),

    /// I/O error from the underlying engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage engine failure (query, transaction, or task scheduling).
    #[error("storage engine error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
