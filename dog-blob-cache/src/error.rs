use std::sync::Arc;

use thiserror::Error;

/// Result type for blob cache operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob operations.
///
/// Cloneable so that one failed block download can be reported to every
/// reader waiting on it.
#[derive(Error, Debug, Clone)]
pub enum BlobError {
    #[error("Blob not found: {key}")]
    NotFound { key: String },

    #[error("Operation not supported by this store: {operation}")]
    Unsupported { operation: &'static str },

    #[error("Unexpected end of data for {key} at offset {offset}: expected {expected} bytes, got {actual}")]
    Truncated {
        key: String,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Cache is shutting down")]
    Shutdown,
}

impl From<std::io::Error> for BlobError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}

impl BlobError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Arc::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    /// Create a short-read error
    pub fn truncated<S: Into<String>>(key: S, offset: u64, expected: u64, actual: u64) -> Self {
        Self::Truncated {
            key: key.into(),
            offset,
            expected,
            actual,
        }
    }

    /// True for a missing key, whether reported by a store or by the local filesystem.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Map a local `ENOENT` onto `NotFound` for `key`, leaving other errors untouched.
    pub(crate) fn io_for_key(err: std::io::Error, key: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(key)
        } else {
            err.into()
        }
    }
}
