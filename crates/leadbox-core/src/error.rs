//! Error types for the core module

use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Neither address belongs to a known campaign sender
    #[error("No campaign sender matches {from} -> {to}")]
    UnresolvedSender { from: String, to: String },

    /// Inbound event is missing a required field
    #[error("Invalid inbound event: {0}")]
    InvalidEvent(String),

    /// Message does not exist or is not owned by the caller
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// No messages and no thread exist for a conversation key
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Thread row kept changing underneath the aggregator
    #[error("Concurrent update on thread {0}")]
    ConcurrentUpdate(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the transport should redeliver the event that produced this error.
    ///
    /// Ingestion is idempotent, so redelivery after a storage hiccup is safe.
    /// Resolution and validation failures will fail again and are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::DatabaseError(_) | CoreError::ConcurrentUpdate(_) | CoreError::IoError(_)
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::ConfigError(e.to_string())
    }
}
