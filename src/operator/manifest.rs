//! File manifests of evidence directories.

use std::io::Read;
use std::path::Path;

use cadence_common::{FileEntry, OperatorError};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Every regular file under `dir`, sorted by relative path, with size and
/// SHA-256. Symlinks are not followed. A missing directory yields an empty list.
pub fn build_manifest(dir: &Path) -> Result<Vec<FileEntry>, OperatorError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            OperatorError::io(path, std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let (size, sha256) = hash_file(path)?;
        entries.push(FileEntry {
            path: relative,
            size,
            sha256,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn hash_file(path: &Path) -> Result<(u64, String), OperatorError> {
    let mut file = std::fs::File::open(path).map_err(|e| OperatorError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| OperatorError::io(path, e))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, hex::encode(hasher.finalize())))
}
