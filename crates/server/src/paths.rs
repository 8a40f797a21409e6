//! Request path → filesystem path under the media root.

use std::path::{Path, PathBuf};

/// Resolve a request path (`/shows/a.mkv`, `shows/`) below `root`.
///
/// One leading `/` is accepted. Returns `None` for absolute paths after that
/// prefix and for any segment starting with `.`, which covers `.` and `..`
/// as well as hidden entries. Empty segments are skipped.
pub fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.strip_prefix('/').unwrap_or(request_path);
    if relative.starts_with('/') || relative.contains('\0') || relative.contains('\\') {
        return None;
    }

    let mut resolved = root.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        if segment.starts_with('.') {
            return None;
        }
        resolved.push(segment);
    }
    Some(resolved)
}

/// A safe path that exists as a regular file.
pub async fn resolve_file(root: &Path, request_path: &str) -> Option<PathBuf> {
    let path = resolve(root, request_path)?;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Some(path),
        _ => None,
    }
}

/// A safe path that exists as a directory.
pub async fn resolve_dir(root: &Path, request_path: &str) -> Option<PathBuf> {
    let path = resolve(root, request_path)?;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => Some(path),
        _ => None,
    }
}
