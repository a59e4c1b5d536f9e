use std::path::{Component, Path};

use crate::TransferError;

/// Longest sanitised filename kept, in bytes.
const MAX_FILENAME_LEN: usize = 100;

/// Reduces a client-supplied filename to a safe storage name.
///
/// Keeps ASCII alphanumerics, `.`, `_` and `-`; everything else becomes `_`.
/// Leading dots are stripped so the result is never hidden or `..`.
/// Returns `"file"` when nothing usable is left.
pub fn sanitize_filename(name: &str) -> String {
    // Only the last path segment is meaningful.
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let mut out: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = out.trim_start_matches('.').len();
    out.drain(..out.len() - trimmed);

    if out.len() > MAX_FILENAME_LEN {
        // All chars are ASCII at this point, so any byte index is a boundary.
        out.truncate(MAX_FILENAME_LEN);
    }

    if out.is_empty() || out.chars().all(|c| c == '_') {
        return "file".into();
    }
    out
}

/// Validates a key used as a single directory or file name in storage.
///
/// Rejects:
/// - Empty keys
/// - Anything with a path separator or more than one component
/// - `.` and `..`
/// - Absolute paths and Windows prefixes
pub fn validate_storage_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidPath("empty key".into()));
    }
    if key.contains(['/', '\\']) {
        return Err(TransferError::InvalidPath(format!(
            "separator not allowed: {key}"
        )));
    }

    let mut components = Path::new(key).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidPath(format!(
            "not a plain name: {key}"
        ))),
    }
}
