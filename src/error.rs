//! Error types for mailsink.

use thiserror::Error;

/// Common error type for mailsink.
#[derive(Error, Debug)]
pub enum MailsinkError {
    /// The raw message could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] crate::mail::DecodeError),

    /// Database error.
    ///
    /// Wraps I/O, constraint and transaction failures from the storage engine.
    /// Database errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Invalid caller-supplied argument (pagination, empty query, bad id).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store has been closed and accepts no further writes.
    #[error("storage is shut down")]
    Shutdown,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MailsinkError {
    /// Machine-readable classification of the error.
    pub fn code(&self) -> &'static str {
        match self {
            MailsinkError::Decode(_) => "DECODE_ERROR",
            MailsinkError::Database(_) | MailsinkError::Io(_) => "STORAGE_ERROR",
            MailsinkError::NotFound(_) => "NOT_FOUND",
            MailsinkError::InvalidArgument(_) => "INVALID_REQUEST",
            MailsinkError::Shutdown => "SHUTTING_DOWN",
            MailsinkError::Config(_) => "CONFIG_ERROR",
        }
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for MailsinkError {
    fn from(e: sqlx::Error) -> Self {
        MailsinkError::Database(e.to_string())
    }
}

/// Result type alias for mailsink operations.
pub type Result<T> = std::result::Result<T, MailsinkError>;
