// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the
/// router. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// A peer sent a line the protocol does not allow. The line is dropped
    /// and the session survives.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A line exceeded the maximum length; the remainder of the line is
    /// discarded.
    #[error("Line exceeds maximum length of {0} bytes")]
    LineTooLong(usize),

    #[error("unauthorized")]
    Unauthorized,

    #[error("Variable catalogue error: {0}")]
    Catalogue(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Invariant broken: {0}")]
    Invariant(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not
// cloneable; the Arc makes the clone cheap and shared.
impl Clone for RouterError {
    fn clone(&self) -> Self {
        match self {
            RouterError::Io(e) => RouterError::Io(Arc::clone(e)),
            RouterError::ProtocolViolation(s) => RouterError::ProtocolViolation(s.clone()),
            RouterError::LineTooLong(n) => RouterError::LineTooLong(*n),
            RouterError::Unauthorized => RouterError::Unauthorized,
            RouterError::Catalogue(s) => RouterError::Catalogue(s.clone()),
            RouterError::Cache(s) => RouterError::Cache(s.clone()),
            RouterError::Upstream(s) => RouterError::Upstream(s.clone()),
            RouterError::Invariant(s) => RouterError::Invariant(s.clone()),
            RouterError::Internal(s) => RouterError::Internal(s.clone()),
        }
    }
}

impl From<std::io::Error> for RouterError {
    fn from(e: std::io::Error) -> Self {
        RouterError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(e: serde_json::Error) -> Self {
        RouterError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl RouterError {
    /// True for errors that indicate a normal peer disconnect rather than
    /// a fault worth a warning.
    pub fn is_normal_disconnect(&self) -> bool {
        matches!(self, RouterError::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
        ))
    }
}
