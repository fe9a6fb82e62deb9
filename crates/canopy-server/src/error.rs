use thiserror::Error;

/// Errors from the service front-end and management surface.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Another daemon instance holds the state lock.
    #[error("failed to acquire lock on {0}")]
    LockContention(String),

    /// A management option name this daemon does not recognize.
    #[error("unknown option {0:?}")]
    UnknownOption(String),

    /// A recognized option received an unparseable value.
    #[error("invalid value {value:?} for option {name:?}")]
    InvalidOptionValue { name: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local store engine failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<canopy_store::StoreError> for ServerError {
    fn from(e: canopy_store::StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
