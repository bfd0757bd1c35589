//! Error types for forgewire.

use thiserror::Error;

/// Main error type for all forgewire operations.
#[derive(Debug, Error)]
pub enum ForgewireError {
    /// I/O error during socket/pipe/file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed frame, tag/payload bounds, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed (or never established).
    #[error("Connection closed")]
    ConnectionClosed,

    /// A pooled task was dropped before producing a result, either because
    /// the pool was already stopped at submission or the task panicked.
    #[error("Task abandoned")]
    TaskAbandoned,

    /// Subprocess orchestration failure (fork, pipe, redirection).
    #[error("Process error: {0}")]
    Process(String),
}

/// Result type alias using ForgewireError.
pub type Result<T> = std::result::Result<T, ForgewireError>;
