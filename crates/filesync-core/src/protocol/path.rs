//! Validation of paths received from other peers.

use super::ProtocolError;

/// Normalize a wire path to forward slashes and make sure it stays inside the
/// sync root.
pub fn normalize_relative_path(raw: &str) -> Result<String, ProtocolError> {
    let invalid = |reason| ProtocolError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    let path = raw.replace('\\', "/");
    if path.is_empty() {
        return Err(invalid("empty"));
    }
    if path.contains('\0') {
        return Err(invalid("contains NUL"));
    }
    if path.starts_with('/') || has_drive_prefix(&path) {
        return Err(invalid("absolute"));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            _ => {}
        }
    }
    Ok(path)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
