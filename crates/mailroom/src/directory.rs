//! Filesystem primitives for queue state directories.
//!
//! All ownership transfers in the queue are same-filesystem renames, which
//! are atomic on POSIX filesystems. No locks are taken anywhere; two racing
//! renames of the same source resolve to exactly one winner.

use crate::error::{QueueError, QueueResult};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Ensures the directory exists, creating parents as needed. Idempotent.
pub async fn setup(path: &Path) -> QueueResult<PathBuf> {
    fs::create_dir_all(path).await?;
    Ok(path.to_path_buf())
}

/// Number of regular files directly inside `dir`.
pub async fn file_count(dir: &Path) -> QueueResult<usize> {
    let mut entries = fs::read_dir(dir).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

/// The regular file with the lexicographically smallest name, or `None` when
/// the directory holds no files. Names begin with the push timestamp, so this
/// approximates oldest-first.
pub async fn first_file(dir: &Path) -> QueueResult<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut smallest: Option<OsString> = None;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if smallest.as_ref().map_or(true, |s| name < *s) {
            smallest = Some(name);
        }
    }
    Ok(smallest.map(|name| dir.join(name)))
}

/// Snapshot of all regular files directly inside `dir`.
pub async fn all_files(dir: &Path) -> QueueResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// Atomically renames `src` into `dest_dir`. With `new_name` the destination
/// file name is replaced; otherwise the source name is kept. `src` and
/// `dest_dir` must share a filesystem.
pub async fn move_file(
    src: &Path,
    dest_dir: &Path,
    new_name: Option<&str>,
) -> QueueResult<PathBuf> {
    let name = match new_name {
        Some(name) => OsString::from(name),
        None => src
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| QueueError::MalformedName(src.display().to_string()))?,
    };
    let dest = dest_dir.join(name);
    fs::rename(src, &dest).await?;
    Ok(dest)
}
