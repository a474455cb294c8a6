//! Error types for the analysis pipeline
//!
//! `LowConfidence` and `Suppressed` are outcomes carried as data, so they do not
//! appear here.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied an empty, malformed or identity-shaped session handle
    #[error("Invalid session handle: {0}")]
    InvalidHandle(String),

    /// A feature summary violates its shape or range contract
    #[error("Invalid feature summary: {0}")]
    InvalidFeatureSummary(String),

    /// The evaluation layer or a backing store could not be reached
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Interaction timestamp too far from server time to be trusted
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl Error {
    /// Whether this error should be reported back to the caller as a rejected request
    /// rather than absorbed into a fallback path.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            Error::InvalidHandle(_)
                | Error::InvalidFeatureSummary(_)
                | Error::InvalidTimestamp(_)
                | Error::SessionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_faults() {
        assert!(Error::InvalidHandle("x".into()).is_caller_fault());
        assert!(Error::InvalidTimestamp("x".into()).is_caller_fault());
        assert!(Error::SessionClosed.is_caller_fault());
        assert!(!Error::UpstreamUnavailable("x".into()).is_caller_fault());
        assert!(!Error::Serialization("x".into()).is_caller_fault());
    }
}
