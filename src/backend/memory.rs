//! In-process backend
//!
//! Keeps blobs in a map bounded by a byte capacity. Availability can be
//! switched off to simulate an outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Backend;
use crate::error::{Error, Result};

/// Blob store held in memory
pub struct MemoryBackend {
    id: String,
    capacity: u64,
    blobs: RwLock<HashMap<String, Bytes>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new(id: impl Into<String>, capacity: u64) -> Self {
        Self {
            id: id.into(),
            capacity,
            blobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn contains(&self, blob_id: &str) -> bool {
        self.blobs.read().contains_key(blob_id)
    }

    pub fn used(&self) -> u64 {
        self.blobs.read().values().map(|b| b.len() as u64).sum()
    }

    /// Replace a stored blob without any checks
    #[cfg(test)]
    pub(crate) fn overwrite(&self, blob_id: &str, data: Bytes) {
        self.blobs.write().insert(blob_id.to_string(), data);
    }

    /// Bytes free for `blob_id`, counting its current blob as free
    fn free_for(&self, blobs: &HashMap<String, Bytes>, blob_id: &str) -> u64 {
        let used: u64 = blobs.values().map(|b| b.len() as u64).sum();
        let replaced = blobs.get(blob_id).map(|b| b.len() as u64).unwrap_or(0);
        self.capacity.saturating_sub(used - replaced)
    }

    fn check_capacity(&self, blob_id: &str, needed: u64) -> Result<()> {
        let available = self.free_for(&self.blobs.read(), blob_id);
        if needed > available {
            return Err(Error::InsufficientCapacity { needed, available });
        }
        Ok(())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable(self.id.clone()))
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(
        &self,
        blob_id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<u64> {
        self.ensure_available()?;
        self.check_capacity(blob_id, length)?;

        let mut data = Vec::new();
        (&mut *source).take(length).read_to_end(&mut data).await?;
        if data.len() as u64 != length {
            return Err(Error::backend(
                &self.id,
                format!("source ended after {} of {} bytes", data.len(), length),
            ));
        }

        // Capacity may have been taken while the source was read
        let mut blobs = self.blobs.write();
        let available = self.free_for(&blobs, blob_id);
        if length > available {
            return Err(Error::InsufficientCapacity {
                needed: length,
                available,
            });
        }
        blobs.insert(blob_id.to_string(), Bytes::from(data));
        Ok(length)
    }

    async fn get(&self, blob_id: &str, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        self.ensure_available()?;
        let data = self
            .blobs
            .read()
            .get(blob_id)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(blob_id.to_string()))?;

        sink.write_all(&data).await?;
        sink.flush().await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, blob_id: &str) -> Result<()> {
        self.ensure_available()?;
        self.blobs.write().remove(blob_id);
        Ok(())
    }

    async fn total_capacity(&self) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.capacity)
    }

    async fn available_capacity(&self) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.capacity.saturating_sub(self.used()))
    }
}
