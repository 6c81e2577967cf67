//! Error types for the durable request queue.

use thiserror::Error;

/// Result type used throughout the queue.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced to the host application.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The key-space on the head or tail side is exhausted.
    #[error("storage full: {0}")]
    StorageFull(String),

    /// A disk read or write failed.
    #[error("storage I/O error: {0}")]
    StorageIO(#[from] std::io::Error),

    /// The transport reported a retriable failure (timeout, disconnect, 5xx).
    #[error("transient transport failure: {0}")]
    TransportTransient(String),

    /// The transport reported a non-retriable failure (4xx, malformed response).
    #[error("terminal transport failure: {0}")]
    TransportTerminal(String),

    /// The request was explicitly aborted or timed out.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// An on-disk entry failed to deserialize.
    #[error("failed to decode queue entry: {0}")]
    DecodeError(String),

    /// No registered handler matches the given token.
    #[error("no handler registered for token {0}")]
    UnknownHandler(u64),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::DecodeError(e.to_string())
    }
}
