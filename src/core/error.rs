//! Error types for the block store

use thiserror::Error;

/// Main error type for the block store
///
/// Missing blocks are not errors: lookups return `Ok(None)` for them.
#[derive(Debug, Error)]
pub enum Error {
    /// The store does not implement the requested capability
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A stored blob failed structural validation while decoding
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    /// The backing database could not be opened or used
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// The task was cancelled before it ran
    #[error("Task cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::ConnectionFailure(e.to_string())
    }
}

impl Error {
    /// Shorthand for building a `CorruptPayload` error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptPayload(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_error_is_connection_failure() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::ConnectionFailure(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Unsupported("instances").to_string(),
            "Unsupported operation: instances"
        );
        assert_eq!(Error::corrupt("bad tag").to_string(), "Corrupt payload: bad tag");
    }
}
