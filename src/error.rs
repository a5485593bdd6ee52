//! Error types for kettle.

use thiserror::Error;

/// Common error type for kettle.
///
/// Script execution failures are not represented here; they travel as
/// [`crate::script::ExecutionFailure`] so callers can match on the tag.
#[derive(Error, Debug)]
pub enum KettleError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error for authored input (command names, sources).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A resource with the same key already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Permission denied error.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Script compilation error raised while authoring a command.
    #[error("script error: {0}")]
    Script(String),
}

impl From<sqlx::Error> for KettleError {
    fn from(e: sqlx::Error) -> Self {
        KettleError::Database(e.to_string())
    }
}

/// Result type alias for kettle operations.
pub type Result<T> = std::result::Result<T, KettleError>;
