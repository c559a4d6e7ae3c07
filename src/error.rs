//! Session error types
//!
//! Configuration problems are reported synchronously as [`SessionError`].
//! Network and broker failures never show up here: they arrive as the
//! [`EngineStatus`] of a command result or through the disconnect callback.

use crate::protocol::codes::EngineStatus;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No tokio runtime available to host the session worker")]
    NoRuntime,

    #[error("Session command queue is closed")]
    QueueClosed,
}

impl SessionError {
    /// Closest engine status for callers that only deal in status codes
    pub fn status(&self) -> EngineStatus {
        match self {
            SessionError::Config(crate::config::ConfigError::Rejected { status, .. }) => *status,
            SessionError::Config(_) => EngineStatus::Inval,
            SessionError::NoRuntime => EngineStatus::Unknown,
            SessionError::QueueClosed => EngineStatus::NoConn,
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
