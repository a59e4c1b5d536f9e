use serde::{Deserialize, Serialize};

use crate::types::SessionStatus;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens a new upload session.
///
/// `chunk_size` is a request; the server may substitute its own value and the
/// client must use the one returned in [`CreateSessionResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    #[serde(default)]
    pub chunk_size: u64,
}

/// Queries the state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSessionRequest {
    pub session_id: String,
}

/// Deletes a session and its stored chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSessionRequest {
    pub session_id: String,
}

/// Header for one chunk. The chunk bytes follow as the frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub session_id: String,
    pub chunk_index: u32,
    /// Truncated SHA-256 of the chunk body (32 hex chars).
    pub checksum: String,
}

/// Requests assembly of a fully uploaded session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_file_checksum: Option<String>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Parameters of a freshly created session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// RFC 3339 timestamp.
    pub expires_at: String,
}

/// Current state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
    /// URLs reported by post-processing once it has run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_assets: Vec<String>,
    pub expires_at: String,
}

/// Acknowledges a session deletion. Deleting an unknown id succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSessionResponse {
    pub session_id: String,
}

/// Acknowledges a stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub chunk_index: u32,
    pub uploaded_chunks: Vec<u32>,
    pub progress_percent: f64,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub already_uploaded: bool,
}

/// Result of a successful finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub final_path: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Full SHA-256 hex digest of the assembled file.
    pub checksum: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub already_completed: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}
