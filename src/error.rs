//! Error types for the realtime connection pool.

use thiserror::Error;

/// Main error type for pool operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Missing or invalid instance descriptor, credential, or subscription
    /// parameters. Raised synchronously, before any connection attempt.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure to establish or maintain a socket.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected inbound envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A subscriber callback failed.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection pool is shut down")]
    Shutdown,
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Connection(e.to_string())
    }
}

/// Error returned by a subscriber callback.
///
/// Handler errors are isolated: they are logged and counted against the
/// connection, never propagated to sibling handlers or to the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;
