//! Payload codec.
//!
//! Payloads are opaque bytes. They are staged in a temp directory on the same
//! filesystem as the queues so the subsequent rename into `queued/` is
//! atomic. Temp names begin with the epoch-millisecond timestamp, which
//! becomes the sortable queue file name.

use crate::error::{QueueError, QueueResult};
use crate::message;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// A payload staged on disk, ready to be renamed into a queue.
#[derive(Debug)]
pub struct EncodedPayload {
    /// Location of the staged temp file.
    pub path: PathBuf,

    /// Creation time encoded into the eventual queue file name.
    pub timestamp_ms: u64,
}

/// Writes `payload` to a fresh temp file under `tmp_dir`, enforcing the size
/// bound (`max_bytes`, 0 = unlimited).
pub async fn write_to_tmp(
    payload: &[u8],
    tmp_dir: &Path,
    max_bytes: u64,
) -> QueueResult<EncodedPayload> {
    let size = payload.len() as u64;
    if max_bytes > 0 && size > max_bytes {
        return Err(QueueError::MessageTooLarge {
            size,
            limit: max_bytes,
        });
    }
    let timestamp_ms = message::unique_now_ms();
    // uuid suffix keeps concurrent producers from clobbering each other's
    // staging files; it is dropped by the rename into queued/
    let name = format!("{timestamp_ms}-{}", Uuid::new_v4().simple());
    let path = tmp_dir.join(name);
    fs::write(&path, payload).await?;
    Ok(EncodedPayload { path, timestamp_ms })
}

/// Reads a payload back from a queue or staging file.
pub async fn read_payload(path: &Path) -> QueueResult<Vec<u8>> {
    Ok(fs::read(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let encoded = write_to_tmp(b"hello", tmp.path(), 0).await.unwrap();

        assert_eq!(read_payload(&encoded.path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let tmp = TempDir::new().unwrap();
        let encoded = write_to_tmp(b"", tmp.path(), 0).await.unwrap();

        assert_eq!(read_payload(&encoded.path).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_size_bound_enforced() {
        let tmp = TempDir::new().unwrap();
        let result = write_to_tmp(&[0u8; 64], tmp.path(), 16).await;

        assert!(matches!(
            result,
            Err(QueueError::MessageTooLarge { size: 64, limit: 16 })
        ));
        // nothing staged on rejection
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_size_at_bound_accepted() {
        let tmp = TempDir::new().unwrap();
        assert!(write_to_tmp(&[0u8; 16], tmp.path(), 16).await.is_ok());
    }

    #[tokio::test]
    async fn test_tmp_name_begins_with_timestamp() {
        let tmp = TempDir::new().unwrap();
        let encoded = write_to_tmp(b"x", tmp.path(), 0).await.unwrap();

        let name = encoded.path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(&encoded.timestamp_ms.to_string()));
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(read_payload(&tmp.path().join("missing")).await.is_err());
    }
}
