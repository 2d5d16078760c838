//! Error types for beacon-core

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error (SQLite queue backend)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (bad server URL, app key, or config file)
    #[error("configuration error: {0}")]
    Config(String),

    /// A record was built from values that violate its contract
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A recording call was made while no session is active
    #[error("session is not active")]
    SessionNotActive,

    /// Network or HTTP failure talking to the collector
    #[error("transport error: {0}")]
    Transport(String),

    /// Persisted data could not be decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the failure is temporary and the work should be retried later.
    ///
    /// Every delivery failure is retriable; only caller mistakes are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Io(_) | Error::Database(_)
        )
    }
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(Error::Transport("connection refused".to_string()).is_retryable());
        assert!(Error::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!Error::SessionNotActive.is_retryable());
        assert!(!Error::Config("invalid app key".to_string()).is_retryable());
        assert!(!Error::InvalidArgument("empty key".to_string()).is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::SessionNotActive.to_string(), "session is not active");
        assert_eq!(
            Error::Transport("API error (500)".to_string()).to_string(),
            "transport error: API error (500)"
        );
    }
}
