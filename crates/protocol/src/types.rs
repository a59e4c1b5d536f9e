use serde::{Deserialize, Serialize};

/// Lifecycle state of an upload session.
///
/// `Failed` is only ever set by an explicit abandon; a stalled session
/// stays `Pending`/`Uploading` until it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Returns `true` while the session still accepts chunks.
    pub fn accepts_chunks(self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Returns `uploaded / total` as a percentage in `[0, 100]`.
///
/// A session with zero chunks is reported as fully uploaded.
pub fn progress_percent(uploaded: usize, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    uploaded as f64 / total as f64 * 100.0
}
