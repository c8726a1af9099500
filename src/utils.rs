//! Validation helpers shared by config and the bridge API

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Validate and canonicalize a directory the child will run in
///
/// Resolves symlinks and `..` so the launched process sees a stable absolute
/// path.
pub fn validate_and_canonicalize_path(path: &Path) -> Result<PathBuf> {
    let canonical_path = path
        .canonicalize()
        .map_err(|_| Error::Config(format!("Invalid or non-existent path: {}", path.display())))?;

    if !canonical_path.is_dir() {
        return Err(Error::Config(format!(
            "Working directory is not a directory: {}",
            canonical_path.display()
        )));
    }

    Ok(canonical_path)
}

/// Reject empty method or tool names before anything is written to the child.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{} name must not be empty", kind)));
    }
    if name.chars().any(char::is_control) {
        return Err(Error::InvalidRequest(format!(
            "{} name contains control characters: {:?}",
            kind, name
        )));
    }
    Ok(())
}
