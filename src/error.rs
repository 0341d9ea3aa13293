//! Error types for dynhashtag
//!
//! Structured error definitions use thiserror; the binary wraps them with
//! anyhow for top-level context.

use thiserror::Error;

/// Main error type for dynhashtag operations
#[derive(Error, Debug)]
pub enum DynHashtagError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Subscription failed
    #[error("Stream error: {0}")]
    Stream(#[from] crate::stream::StreamError),

    /// Retraining cycle failed
    #[error("Retrain error: {0}")]
    Retrain(#[from] crate::filter::RetrainError),

    /// Ingestion loop stopped on an unrecoverable condition
    #[error("Ingest error: {0}")]
    Ingest(#[from] crate::filter::IngestError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored row could not be mapped back to a document
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for dynhashtag operations
pub type Result<T> = std::result::Result<T, DynHashtagError>;

impl From<libsql::Error> for DynHashtagError {
    fn from(err: libsql::Error) -> Self {
        DynHashtagError::Database(err.to_string())
    }
}

/// Convert anyhow::Error to DynHashtagError
impl From<anyhow::Error> for DynHashtagError {
    fn from(err: anyhow::Error) -> Self {
        DynHashtagError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DynHashtagError::InvalidRecord("documents.created_at".to_string());
        assert_eq!(err.to_string(), "Invalid stored record: documents.created_at");
    }

    #[test]
    fn test_stream_error_conversion() {
        let err: DynHashtagError = crate::stream::StreamError::Unauthorized(401).into();
        assert!(matches!(err, DynHashtagError::Stream(_)));
        assert!(err.to_string().contains("401"));
    }
}
