//! Lexical path helpers for sandbox checks.
//!
//! These never touch the filesystem: a path that does not exist yet (a file
//! about to be written) must still be checkable.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `base` and remove `.`/`..` components lexically.
pub fn normalize(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `path` (already normalized) lies within one of `roots`.
pub fn within_roots(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}
