use serde::{Deserialize, Serialize};

/// Length of the capability token sent at the start of every connection.
pub const TOKEN_LEN: usize = 32;

/// Largest JSON envelope accepted on the wire (1 MiB).
pub const MAX_HEADER_LEN: usize = 1024 * 1024;

/// Maximum number of missing indices listed in a finalize rejection.
pub const MAX_LISTED_MISSING: usize = 20;

// Error codes carried in [`WireError::code`](crate::WireError).

/// Validation failure, checksum mismatch, invalid index, missing chunks.
pub const ERR_BAD_REQUEST: i32 = 400;
/// Capability token rejected.
pub const ERR_UNAUTHORIZED: i32 = 401;
/// Session not found or expired.
pub const ERR_NOT_FOUND: i32 = 404;
/// Session already completed (chunk ingest only; finalize is idempotent).
pub const ERR_CONFLICT: i32 = 409;
/// Declared file size above the server limit.
pub const ERR_TOO_LARGE: i32 = 413;
/// Storage or internal failure.
pub const ERR_INTERNAL: i32 = 500;
/// Handler exceeded the server request timeout.
pub const ERR_TIMEOUT: i32 = 504;

/// Message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Session lifecycle
    #[serde(rename = "create_session")]
    CreateSession,
    #[serde(rename = "session_created")]
    SessionCreated,
    #[serde(rename = "get_session")]
    GetSession,
    #[serde(rename = "session_status")]
    SessionStatus,
    #[serde(rename = "cancel_session")]
    CancelSession,
    #[serde(rename = "session_cancelled")]
    SessionCancelled,

    // Data
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "chunk_accepted")]
    ChunkAccepted,
    #[serde(rename = "finalize")]
    Finalize,
    #[serde(rename = "finalized")]
    Finalized,

    #[serde(rename = "error")]
    Error,
}

impl MessageType {
    /// Returns the response type a server sends for this request type.
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            Self::CreateSession => Some(Self::SessionCreated),
            Self::GetSession => Some(Self::SessionStatus),
            Self::CancelSession => Some(Self::SessionCancelled),
            Self::UploadChunk => Some(Self::ChunkAccepted),
            Self::Finalize => Some(Self::Finalized),
            _ => None,
        }
    }
}
