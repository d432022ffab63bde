//! Error types for the database layer.

use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors from database backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// SQLite error (open, prepare, step, blob I/O)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error (actor thread spawn, file system)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The connection actor has shut down or dropped the request.
    #[error("Database connection closed")]
    Closed,
}

impl BackendError {
    /// Create a type conversion error.
    pub fn type_conversion(msg: impl Into<String>) -> Self {
        Self::TypeConversion(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
