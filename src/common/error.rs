//! Error types for kv2pc

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Log Errors ===
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // === Client protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Transport Errors ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Remote fault: {0}")]
    Rpc(String),

    // === 2PC Errors ===
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("No reachable participants")]
    NoParticipants,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transport faults: the peer may be fine, the call just did not make it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionFailed(_))
    }

    /// Protocol-fatal faults. These signal a bug or lost durability and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Inconsistent(_) | Error::Wal(_) | Error::Corrupted(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(format!("bincode: {}", e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(Error::Timeout("prepare".into()).is_retryable());
        assert!(Error::ConnectionFailed("127.0.0.1:8001".into()).is_retryable());
        assert!(!Error::Inconsistent("commit 7 ahead of 5".into()).is_retryable());

        assert!(Error::Inconsistent("double prepare".into()).is_fatal());
        assert!(Error::Wal("short write".into()).is_fatal());
        assert!(!Error::Timeout("heartbeat".into()).is_fatal());
        assert!(!Error::NoParticipants.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("disk gone"));
    }
}
