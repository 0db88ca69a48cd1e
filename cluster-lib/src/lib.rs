mod entry_id;
mod path;
mod types;

pub use entry_id::*;
pub use path::*;
pub use types::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("illegal transition from {from} to {to}: {detail}")]
    IllegalTransition {
        from: String,
        to: String,
        detail: String,
    },
    #[error("replica broken: {0}")]
    Broken(String),
    #[error("locked: {0}")]
    Locked(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    pub fn illegal_transition(from: impl ToString, to: impl ToString, detail: impl Into<String>) -> Self {
        ClusterError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout(_))
    }
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::IoError(err.to_string())
    }
}

/// Milliseconds since the unix epoch, the time base shared by sticky records
/// and scan timestamps.
pub fn unix_timestamp_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => {
            warn!("system clock is before the unix epoch: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClusterError::illegal_transition("Cached", "New", "explicit target");
        assert_eq!(
            err.to_string(),
            "illegal transition from Cached to New: explicit target"
        );
        assert!(!err.is_not_found());
        assert!(ClusterError::NotFound("x".to_string()).is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: ClusterError = io.into();
        assert!(matches!(err, ClusterError::IoError(_)));
    }
}
