//! Filesystem helpers: path joining, directory creation, atomic writes.

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::constants::LOCK_FILE_NAME;
use crate::errors::{DbError, Result};

pub fn join_path(base: &Path, parts: &[&str]) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in parts {
        path.push(part);
    }
    path
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn list_subdirs(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub fn read(path: &Path) -> Result<Vec<u8>> {
    Ok(fs::read(path)?)
}

/// Writes `bytes` to `path` without ever leaving a torn file behind: the
/// data lands in a sibling `.tmp` file first, then an atomic rename
/// replaces the target.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn remove_dir_all(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Acquires an advisory exclusive lock on the data directory, enforcing
/// the single-writer-at-a-time assumption. The returned file must be
/// kept alive for as long as the lock should be held; dropping it
/// releases the lock.
pub fn lock_data_dir(dir: &Path) -> Result<fs::File> {
    ensure_dir(dir)?;
    let path = dir.join(LOCK_FILE_NAME);
    let file = fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| DbError::State(format!("{}: data directory is already locked by another process", dir.display())))?;
    Ok(file)
}
