//! Evidence directory layout and path-safety checks.
//!
//! Every path an operator writes must resolve strictly under the run root,
//! both lexically (no `..`, no absolute parts) and after symlink resolution.

use std::path::{Component, Path, PathBuf};

use cadence_common::PathSafetyViolation;

/// `tasks/<task_id>/attempts/<attempt_id>`
pub fn attempt_relative_dir(
    root: &Path,
    task_id: &str,
    attempt_id: &str,
) -> Result<PathBuf, PathSafetyViolation> {
    Ok(PathBuf::from("tasks")
        .join(segment(root, task_id)?)
        .join("attempts")
        .join(segment(root, attempt_id)?))
}

/// `operators/<operator_type>/<id>`, used when no attempt id is known.
pub fn legacy_relative_dir(
    root: &Path,
    operator_type: &str,
    id: &str,
) -> Result<PathBuf, PathSafetyViolation> {
    Ok(PathBuf::from("operators")
        .join(segment(root, operator_type)?)
        .join(segment(root, id)?))
}

/// Resolve `relative` under `root`, rejecting traversal and symlink escape.
///
/// `root` must exist. Components of the target that do not exist yet are
/// checked lexically; the deepest existing ancestor is canonicalized.
pub fn resolve_under_root(root: &Path, relative: &Path) -> Result<PathBuf, PathSafetyViolation> {
    let violation = |reason: &str| PathSafetyViolation {
        root: root.to_path_buf(),
        candidate: relative.to_path_buf(),
        reason: reason.to_string(),
    };

    if relative.as_os_str().is_empty() {
        return Err(violation("empty path"));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(violation("parent directory traversal")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(violation("absolute path"));
            }
        }
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| violation(&format!("run root is not accessible: {}", e)))?;
    let candidate = canonical_root.join(relative);

    let mut existing = candidate.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let resolved = existing
        .canonicalize()
        .map_err(|e| violation(&format!("cannot resolve path: {}", e)))?;
    if !resolved.starts_with(&canonical_root) {
        return Err(violation("resolves outside the run root"));
    }
    if resolved == canonical_root && existing != canonical_root.as_path() {
        // An existing component resolved back to the root itself (symlink loop to root).
        return Err(violation("resolves to the run root"));
    }
    Ok(candidate)
}

/// Create `relative` under `root` after verifying it, then verify again.
pub fn create_dir_under_root(
    root: &Path,
    relative: &Path,
) -> Result<PathBuf, cadence_common::OperatorError> {
    let dir = resolve_under_root(root, relative)?;
    std::fs::create_dir_all(&dir).map_err(|e| cadence_common::OperatorError::io(&dir, e))?;
    resolve_under_root(root, relative)?;
    Ok(dir)
}

/// A single path component taken from an identifier.
fn segment<'a>(root: &Path, value: &'a str) -> Result<&'a str, PathSafetyViolation> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0']);
    if ok {
        Ok(value)
    } else {
        Err(PathSafetyViolation {
            root: root.to_path_buf(),
            candidate: PathBuf::from(value),
            reason: "identifier is not a single path component".to_string(),
        })
    }
}
