use chunkferry_protocol::SessionStatus;
use chunkferry_protocol::constants::{
    ERR_BAD_REQUEST, ERR_CONFLICT, ERR_INTERNAL, ERR_NOT_FOUND, ERR_TIMEOUT, ERR_TOO_LARGE,
    ERR_UNAUTHORIZED,
};
use chunkferry_transfer::TransferError;
use chunkferry_wire::ChannelError;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("file of {size} bytes exceeds limit of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {session_id} is {status}")]
    SessionClosed {
        session_id: String,
        status: SessionStatus,
    },

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { index: u32, expected: u64, actual: u64 },

    #[error("checksum mismatch on chunk {index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("{count} chunks missing: {listed:?}")]
    MissingChunks { listed: Vec<u32>, count: usize },

    #[error("assembled size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("file checksum mismatch: expected {expected}, got {actual}")]
    FileChecksumMismatch { expected: String, actual: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request timed out")]
    Timeout,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("capability token rejected")]
    Unauthorized,
}

impl ServerError {
    /// Wire error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_)
            | Self::ChunkOutOfRange { .. }
            | Self::ChunkSizeMismatch { .. }
            | Self::ChecksumMismatch { .. }
            | Self::MissingChunks { .. }
            | Self::SizeMismatch { .. }
            | Self::FileChecksumMismatch { .. }
            | Self::Json(_) => ERR_BAD_REQUEST,
            Self::Unauthorized => ERR_UNAUTHORIZED,
            Self::SessionNotFound(_) => ERR_NOT_FOUND,
            Self::SessionClosed { .. } => ERR_CONFLICT,
            Self::FileTooLarge { .. } => ERR_TOO_LARGE,
            Self::Timeout => ERR_TIMEOUT,
            Self::Io(_) | Self::Channel(_) | Self::Storage(_) | Self::Task(_) => ERR_INTERNAL,
        }
    }
}

impl From<TransferError> for ServerError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Io(io) => Self::Io(io),
            TransferError::ChecksumMismatch { expected, actual } => {
                Self::FileChecksumMismatch { expected, actual }
            }
            TransferError::IndexOutOfRange { index, total } => {
                Self::ChunkOutOfRange { index, total }
            }
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}
