//! Path utilities shared by the virtualization components.
//!
//! Repository-relative paths cross the dispatcher boundary as plain UTF-8
//! strings; these helpers cover the few places where absolute filesystem
//! paths are handled.

use std::path::{Path, PathBuf};

/// Normalize a path, falling back to the original if canonicalization fails.
///
/// Useful when the path might not exist yet and that's acceptable.
pub fn normalize_or_original(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Check if a path is within a directory (guard against path traversal).
///
/// Both paths are canonicalized before comparison to handle symlinks and
/// `..`. Returns false if either path cannot be canonicalized.
pub fn is_within_directory(path: impl AsRef<Path>, dir: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    let dir = dir.as_ref();

    match (path.canonicalize(), dir.canonicalize()) {
        (Ok(canonical_path), Ok(canonical_dir)) => canonical_path.starts_with(&canonical_dir),
        _ => false,
    }
}

/// Reject repository-relative paths that could escape the working tree.
///
/// The dispatcher receives these from the notification binding; a `..`
/// component or an absolute path is never legitimate there.
pub fn is_safe_relative(relative: &str) -> bool {
    if relative.is_empty() || relative.starts_with('/') || relative.contains('\0') {
        return false;
    }
    !relative
        .split(['/', '\\'])
        .any(|component| component == "..")
}
