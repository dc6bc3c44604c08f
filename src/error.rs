//! Error types for snapferry.

use thiserror::Error;

/// Main error type for all snapferry operations.
#[derive(Debug, Error)]
pub enum SnapferryError {
    /// I/O error on the frame connection or a bulk stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MessagePack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol error (reserved frame type, oversized payload, schema mismatch).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error trailer received from the sending side of a bulk stream.
    ///
    /// The message is the payload of the `SOURCE_ERR` frame, i.e. the
    /// textual rendering of whatever failed on the peer's source.
    #[error("stream error: {0}")]
    StreamTrailer(String),

    /// A version's creation timestamp failed to parse as RFC 3339.
    #[error("invalid creation date {value:?}: {source}")]
    InvalidCreation {
        value: String,
        source: chrono::ParseError,
    },

    /// The remote peer reported an application-level error for an RPC call.
    #[error("remote error: {0}")]
    Remote(String),

    /// Connection closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The ambient context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid retention-rule configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SnapferryError {
    /// Whether the operation that produced this error may be retried.
    ///
    /// Transport-level failures are transient: timeouts, resets and other
    /// I/O errors, or a connection that went away under us. Everything
    /// else is permanent: protocol violations, parse failures, remote
    /// application errors, configuration problems, cancellation.
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            SnapferryError::Io(_) | SnapferryError::ConnectionClosed
        )
    }
}

/// Result type alias using SnapferryError.
pub type Result<T> = std::result::Result<T, SnapferryError>;
