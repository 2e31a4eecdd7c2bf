use thiserror::Error;
use tokio::task::JoinError;

/// Errors returned by the index, its backends and the scheduler.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Previously indexed, immutable data differs from what was just read.
    #[error("index value drift: {0}")]
    IndexValueDrift(String),

    #[error("missing value: {0}")]
    MissingValue(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("capacity exceeded: at most {0} sessions")]
    CapacityExceeded(usize),

    #[error("busy running task: {0}")]
    Busy(String),

    #[error("monitor session fell behind by {0} lines")]
    Lagged(usize),

    #[error("schema version mismatch: found {found}, expected {expected}")]
    SchemaVersion { found: String, expected: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("closed")]
    Closed,

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::StorageError(format!("unable to decode record: {}", value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(value.to_string()),
            std::io::ErrorKind::InvalidInput => Error::InvalidArgument(value.to_string()),
            _ => Error::StorageError(value.to_string()),
        }
    }
}

impl From<crate::digests::Error> for Error {
    fn from(value: crate::digests::Error) -> Self {
        Error::InvalidArgument(value.to_string())
    }
}

impl From<crate::inventory::Error> for Error {
    fn from(value: crate::inventory::Error) -> Self {
        Error::Validation(value.to_string())
    }
}

impl From<crate::tree::Error> for Error {
    fn from(value: crate::tree::Error) -> Self {
        match value {
            crate::tree::Error::MissingSize(_) => Error::MissingValue(value.to_string()),
            _ => Error::Validation(value.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound(msg) => Self::new(std::io::ErrorKind::NotFound, msg),
            Error::InvalidArgument(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            e => Self::new(std::io::ErrorKind::Other, e.to_string()),
        }
    }
}
