//! Relative path handling
//!
//! Every path that crosses a component boundary (tracker state, archive
//! headers, deletion lists) is a `/`-separated UTF-8 string relative to a
//! root. These helpers are pure and never touch the filesystem, except
//! [`contained_join`], which also looks for symbolic links along the way.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Strip `root` from `path`, producing a portable relative path
///
/// # Errors
/// Returns [`Error::InvalidPath`] if `path` is not strictly below `root` or
/// contains a component that is not valid UTF-8.
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let stripped = path
        .strip_prefix(root)
        .map_err(|_| Error::invalid_path(path.to_string_lossy(), "not under root"))?;
    normalize(stripped)
}

/// Turn a relative filesystem path into its portable string form.
///
/// `.` components are dropped; `..`, root and prefix components are rejected.
///
/// # Errors
/// Returns [`Error::InvalidPath`] for absolute paths, parent components,
/// non-UTF-8 names and paths that normalize to nothing.
pub fn normalize(path: &Path) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => {
                let name = name
                    .to_str()
                    .ok_or_else(|| Error::invalid_path(path.to_string_lossy(), "not UTF-8"))?;
                parts.push(name);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::invalid_path(
                    path.to_string_lossy(),
                    "parent component",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::invalid_path(path.to_string_lossy(), "absolute path"));
            }
        }
    }

    if parts.is_empty() {
        return Err(Error::invalid_path(path.to_string_lossy(), "empty path"));
    }
    Ok(parts.join("/"))
}

/// Check that `rel` is already in portable form
///
/// # Errors
/// Returns [`Error::InvalidPath`] describing the first violation.
pub fn validate_relative(rel: &str) -> Result<()> {
    if rel.is_empty() {
        return Err(Error::invalid_path(rel, "empty path"));
    }
    if rel.starts_with('/') {
        return Err(Error::invalid_path(rel, "absolute path"));
    }
    if rel.contains('\0') {
        return Err(Error::invalid_path(rel, "contains NUL"));
    }
    for part in rel.split('/') {
        match part {
            "" => return Err(Error::invalid_path(rel, "empty component")),
            "." => return Err(Error::invalid_path(rel, "current-directory component")),
            ".." => return Err(Error::invalid_path(rel, "parent component")),
            _ => {}
        }
    }
    Ok(())
}

/// Re-join a portable relative path onto `root`
///
/// # Errors
/// Returns [`Error::InvalidPath`] if `rel` fails [`validate_relative`].
pub fn join_relative(root: &Path, rel: &str) -> Result<PathBuf> {
    validate_relative(rel)?;
    let mut joined = root.to_path_buf();
    for part in rel.split('/') {
        joined.push(part);
    }
    Ok(joined)
}

/// [`join_relative`] for a path about to be written or removed
///
/// Every existing directory between `root` and the final component must be
/// a real directory, so the operation cannot follow a link out of `root`.
///
/// # Errors
/// Returns [`Error::InvalidPath`] if a parent is a symbolic link, and
/// [`Error::Io`] if a parent cannot be inspected.
pub fn contained_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let joined = join_relative(root, rel)?;
    let mut current = root.to_path_buf();
    let mut parents = rel.split('/').peekable();
    while let Some(part) = parents.next() {
        if parents.peek().is_none() {
            break;
        }
        current.push(part);
        match std::fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(Error::invalid_path(rel, "parent is a symbolic link"));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(Error::io("failed to stat", current, e)),
        }
    }
    Ok(joined)
}
