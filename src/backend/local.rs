//! Directory-backed backend with a size cap
//!
//! Each blob is one file named by its id. Space is reserved before writing
//! and the directory size is recomputed if a write fails part way.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::Backend;
use crate::error::{Error, Result};

/// Blob store in a local directory
pub struct LocalBackend {
    id: String,
    dir: PathBuf,
    max_size: u64,
    current_size: Mutex<u64>,
}

impl LocalBackend {
    /// Open (creating if needed) the store directory and measure its usage
    pub async fn open(id: impl Into<String>, dir: impl AsRef<Path>, max_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        let current_size = directory_size(&dir).await?;

        let id = id.into();
        debug!(
            "Opened local backend {} at {:?} ({} of {} bytes used)",
            id, dir, current_size, max_size
        );

        Ok(Self {
            id,
            dir,
            max_size,
            current_size: Mutex::new(current_size),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn used(&self) -> u64 {
        *self.current_size.lock()
    }

    fn blob_path(&self, blob_id: &str) -> Result<PathBuf> {
        if blob_id.is_empty()
            || blob_id.contains(['/', '\\'])
            || blob_id == "."
            || blob_id == ".."
        {
            return Err(Error::backend(
                &self.id,
                format!("invalid blob id {:?}", blob_id),
            ));
        }
        Ok(self.dir.join(blob_id))
    }

    async fn existing_size(path: &Path) -> Result<u64> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn recompute_size(&self) {
        match directory_size(&self.dir).await {
            Ok(size) => *self.current_size.lock() = size,
            Err(e) => warn!("Failed to recompute size of {:?}: {}", self.dir, e),
        }
    }
}

async fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

#[async_trait]
impl Backend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(
        &self,
        blob_id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<u64> {
        let path = self.blob_path(blob_id)?;
        let staging = self.dir.join(format!(".{}.part", blob_id));
        let replaced = Self::existing_size(&path).await?;

        {
            let mut current = self.current_size.lock();
            let new_size = *current - replaced.min(*current) + length;
            if new_size > self.max_size {
                return Err(Error::InsufficientCapacity {
                    needed: length,
                    available: self.max_size.saturating_sub(*current),
                });
            }
            *current = new_size;
        }

        let written = async {
            let mut file = fs::File::create(&staging).await?;
            let copied = tokio::io::copy(&mut (&mut *source).take(length), &mut file).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(copied)
        }
        .await;

        let failure = match written {
            Ok(copied) if copied == length => match fs::rename(&staging, &path).await {
                Ok(()) => return Ok(length),
                Err(e) => Error::backend(&self.id, e),
            },
            Ok(copied) => Error::backend(
                &self.id,
                format!("source ended after {} of {} bytes", copied, length),
            ),
            Err(e) => Error::backend(&self.id, e),
        };

        if let Err(e) = fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staging file {:?}: {}", staging, e);
            }
        }
        self.recompute_size().await;
        Err(failure)
    }

    async fn get(&self, blob_id: &str, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        let path = self.blob_path(blob_id)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BlobNotFound(blob_id.to_string()));
            }
            Err(e) => return Err(Error::backend(&self.id, e)),
        };

        let copied = tokio::io::copy(&mut file, &mut *sink)
            .await
            .map_err(|e| Error::backend(&self.id, e))?;
        sink.flush().await?;
        Ok(copied)
    }

    async fn delete(&self, blob_id: &str) -> Result<()> {
        let path = self.blob_path(blob_id)?;
        let size = Self::existing_size(&path).await?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                let mut current = self.current_size.lock();
                *current = current.saturating_sub(size);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::backend(&self.id, e)),
        }
    }

    async fn total_capacity(&self) -> Result<u64> {
        Ok(self.max_size)
    }

    async fn available_capacity(&self) -> Result<u64> {
        Ok(self.max_size.saturating_sub(self.used()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::open("disk-0", tmp.path(), 1024).await.unwrap();

        backend.put_bytes("blob-a", b"abcdef").await.unwrap();
        assert!(tmp.path().join("blob-a").exists());
        assert_eq!(backend.get_bytes("blob-a").await.unwrap(), b"abcdef");
        assert_eq!(backend.used(), 6);

        backend.delete("blob-a").await.unwrap();
        assert_eq!(backend.used(), 0);
        assert!(matches!(
            backend.get_bytes("blob-a").await,
            Err(Error::BlobNotFound(_))
        ));

        // Deleting a missing blob is not an error
        backend.delete("blob-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_streams_into_sink() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::open("disk-0", tmp.path(), 1 << 20).await.unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut source = data.as_slice();
        backend
            .put("big", &mut source, data.len() as u64)
            .await
            .unwrap();

        let mut sink = Vec::new();
        let copied = backend.get("big", &mut sink).await.unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn test_short_source_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::open("disk-0", tmp.path(), 100).await.unwrap();

        let mut source: &[u8] = b"abc";
        let err = backend.put("blob", &mut source, 10).await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert_eq!(backend.used(), 0);
    }

    #[tokio::test]
    async fn test_max_size_enforced() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::open("disk-0", tmp.path(), 10).await.unwrap();

        backend.put_bytes("a", &[1u8; 8]).await.unwrap();
        let err = backend.put_bytes("b", &[1u8; 3]).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { needed: 3, .. }));
        assert!(!tmp.path().join("b").exists());

        // Replacing a blob only counts the difference
        backend.put_bytes("a", &[2u8; 10]).await.unwrap();
        assert_eq!(backend.available_capacity().await.unwrap(), 0);
        assert_eq!(backend.total_capacity().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_reopen_measures_existing_blobs() {
        let tmp = TempDir::new().unwrap();
        {
            let backend = LocalBackend::open("disk-0", tmp.path(), 100).await.unwrap();
            backend.put_bytes("a", &[0u8; 40]).await.unwrap();
        }
        let backend = LocalBackend::open("disk-0", tmp.path(), 100).await.unwrap();
        assert_eq!(backend.used(), 40);
        assert_eq!(backend.available_capacity().await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::open("disk-0", tmp.path(), 100).await.unwrap();
        assert!(backend.put_bytes("../escape", b"x").await.is_err());
        assert!(backend.get_bytes("..").await.is_err());
    }
}
