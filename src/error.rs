// Error kinds for the storage engine. Every fallible operation returns
// `Result<T>`; nothing in library code panics on expected failure modes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unique constraint violated on index {index}: key already present")]
    UniqueConstraint { index: String },

    #[error("foreign key violation: {collection}.{field} = {value:?} not found in {target}")]
    ForeignKeyViolation {
        collection: String,
        field: String,
        value: String,
        target: String,
    },

    #[error("lock timeout waiting for {mode} lock on {resource}")]
    LockTimeout { resource: String, mode: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database is read-only")]
    ReadOnly,

    #[error("database is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}
