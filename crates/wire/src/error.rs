//! Error types for the framed TCP channel.

/// Errors produced while talking the framed protocol.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("header of {len} bytes exceeds limit of {max}")]
    HeaderTooLarge { len: usize, max: usize },

    #[error("body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge { len: u64, max: u64 },

    #[error("connection timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}
