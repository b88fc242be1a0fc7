//! Error types for tributary.

use thiserror::Error;

use crate::feeder::media::MediaError;

/// Common error type for tributary.
#[derive(Error, Debug)]
pub enum TributaryError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Feed retrieval or parsing error.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Media download or storage error.
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// Content conversion error (HTML to markdown).
    #[error("content error: {0}")]
    Content(String),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A panic recovered at a feed or tick boundary.
    #[error("unexpected fault: {0}")]
    Fault(String),
}

impl From<sqlx::Error> for TributaryError {
    fn from(e: sqlx::Error) -> Self {
        TributaryError::Database(e.to_string())
    }
}

/// Result type alias for tributary operations.
pub type Result<T> = std::result::Result<T, TributaryError>;
