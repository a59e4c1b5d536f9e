//! The durable upload session record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chunkferry_protocol::SessionStatus;
use chunkferry_protocol::messages::{FinalizeResponse, SessionStatusResponse};
use chunkferry_protocol::types::progress_percent;

/// One file transfer attempt.
///
/// `chunk_size` and `total_chunks` are fixed at creation. `uploaded_chunks`
/// only grows and is written exclusively through the session store's
/// compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub uploaded_chunks: BTreeSet<u32>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Correlation handed to post-processing when the session completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_assets: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Every chunk index has been received.
    pub fn has_all_chunks(&self) -> bool {
        self.uploaded_chunks.len() as u64 == u64::from(self.total_chunks)
    }

    /// Indices not yet received, ascending.
    pub fn missing_chunks(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total_chunks).filter(|i| !self.uploaded_chunks.contains(i))
    }

    pub fn uploaded_list(&self) -> Vec<u32> {
        self.uploaded_chunks.iter().copied().collect()
    }

    pub fn progress_percent(&self) -> f64 {
        progress_percent(self.uploaded_chunks.len(), self.total_chunks)
    }

    pub fn to_status_response(&self) -> SessionStatusResponse {
        SessionStatusResponse {
            session_id: self.id.clone(),
            status: self.status,
            uploaded_chunks: self.uploaded_list(),
            total_chunks: self.total_chunks,
            chunk_size: self.chunk_size,
            file_size: self.file_size,
            final_path: self.final_path.clone(),
            derived_assets: self.derived_assets.clone(),
            expires_at: self.expires_at.to_rfc3339(),
        }
    }

    /// The stored finalize result, if the session has completed.
    pub fn finalize_result(&self, already_completed: bool) -> Option<FinalizeResponse> {
        if self.status != SessionStatus::Completed {
            return None;
        }
        Some(FinalizeResponse {
            final_path: self.final_path.clone()?,
            file_size: self.file_size,
            mime_type: self.mime_type.clone(),
            checksum: self.checksum.clone()?,
            already_completed,
        })
    }
}
