//! Path hygiene for model-supplied paths.
//!
//! Every path a tool or user hands the workspace is normalized before it
//! touches the filesystem: slash-separated, relative, and free of `..`
//! components, so it cannot resolve outside `llm/`.

use tiller_domain::{Error, Result};

/// Normalize a workspace-relative path.
///
/// Accepts forward- or backslash-separated input, strips `.` components and
/// redundant separators, and rejects empty, absolute, or traversing paths.
pub fn normalize(path: &str) -> Result<String> {
    let slashed = path.replace('\\', "/");
    let trimmed = slashed.trim();

    if trimmed.is_empty() {
        return Err(Error::PathEscape("empty path".into()));
    }
    if trimmed.starts_with('/') || has_drive_prefix(trimmed) {
        return Err(Error::PathEscape(format!(
            "absolute path not allowed: {path}"
        )));
    }

    let mut parts = Vec::new();
    for comp in trimmed.split('/') {
        match comp {
            "" | "." => continue,
            ".." => {
                return Err(Error::PathEscape(format!(
                    "parent traversal not allowed: {path}"
                )))
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(Error::PathEscape(format!("path resolves to nothing: {path}")));
    }

    Ok(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}
