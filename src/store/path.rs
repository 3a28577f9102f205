//! Slash separated store paths.

use crate::core::errors::{Result, ScoutError};

const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

/// Split a path into validated segments. The empty path is the root.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = trimmed.split('/').collect();
    for part in &parts {
        if part.is_empty() {
            return Err(ScoutError::validation_field(
                format!("empty segment in path '{}'", path),
                "path",
            ));
        }
        if part.contains(FORBIDDEN) {
            return Err(ScoutError::validation_field(
                format!("segment '{}' contains a reserved character", part),
                "path",
            ));
        }
    }
    Ok(parts)
}

/// Join segments into a canonical path
pub fn join<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a mutation at `changed` can alter what a watcher of `watched` sees.
///
/// True when one path is a segment-wise prefix of the other.
pub fn overlaps(changed: &str, watched: &str) -> bool {
    let a: Vec<&str> = changed.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let b: Vec<&str> = watched.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

/// Whether `key` can be used as a single path segment
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('/') && !key.contains(FORBIDDEN)
}
