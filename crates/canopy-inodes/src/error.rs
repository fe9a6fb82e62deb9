use canopy_store::StoreError;
use canopy_types::InodeNumber;
use thiserror::Error;

/// Filesystem-facing error taxonomy.
///
/// One variant per kernel-visible failure kind; the dispatcher owns the
/// mapping to protocol error numbers. Cloneable so a failed load can be
/// fanned out to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("stale inode {0}")]
    StaleInode(InodeNumber),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("parse error: {0}")]
    Parse(String),

    /// No such extended attribute.
    #[error("no attribute {0:?}")]
    NoAttr(String),

    /// Invariant violation. Logged and surfaced; never exits the process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Parse { .. } | StoreError::DuplicateEntry(_) => {
                FsError::Parse(e.to_string())
            }
            StoreError::Io(io) => FsError::Io(io.to_string()),
            StoreError::Storage(s) => FsError::Io(s),
        }
    }
}

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;
