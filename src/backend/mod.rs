//! Storage backends and the registry that hands them out
//!
//! A backend stores opaque blobs by id. Backends are individually
//! unreliable; redundancy comes from spreading erasure-coded fragments over
//! many of them.

pub mod health;
pub mod local;
pub mod memory;
pub mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

pub use health::{BackendHealth, BackendStatus, HealthTracker, PoolHealth, PoolStatus};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use pool::BackendPool;

/// A blob store holding fragments.
///
/// Blobs move as streams so a fragment never has to be held in memory.
/// Calls for distinct blob ids may run concurrently. Timeouts and retries
/// are the backend's own business.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identity recorded in fragment metadata
    fn id(&self) -> &str;

    /// Store exactly `length` bytes read from `source` under `blob_id`,
    /// returning the number of bytes written. A source that ends early is
    /// an error and leaves no blob behind.
    async fn put(
        &self,
        blob_id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<u64>;

    /// Write a blob to `sink`, returning its length
    async fn get(&self, blob_id: &str, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64>;

    /// Remove a blob
    async fn delete(&self, blob_id: &str) -> Result<()>;

    /// Total capacity in bytes
    async fn total_capacity(&self) -> Result<u64>;

    /// Free capacity in bytes
    async fn available_capacity(&self) -> Result<u64>;

    /// Store an in-memory blob
    async fn put_bytes(&self, blob_id: &str, data: &[u8]) -> Result<u64> {
        let mut source = data;
        self.put(blob_id, &mut source, data.len() as u64).await
    }

    /// Fetch a whole blob into memory
    async fn get_bytes(&self, blob_id: &str) -> Result<Vec<u8>> {
        let mut sink = Vec::new();
        self.get(blob_id, &mut sink).await?;
        Ok(sink)
    }
}

/// Enumerates backends in placement preference order and resolves them by id
pub trait BackendRegistry: Send + Sync {
    /// Backends in preference order (least recently used for upload first)
    fn list(&self) -> Vec<Arc<dyn Backend>>;

    /// Resolve a backend recorded in fragment metadata
    fn find(&self, backend_id: &str) -> Option<Arc<dyn Backend>>;

    /// A fragment transfer against `backend_id` succeeded
    fn record_success(&self, _backend_id: &str, _kind: TransferKind) {}

    /// A fragment transfer against `backend_id` failed
    fn record_failure(&self, _backend_id: &str, _error: &Error) {}
}

/// Kind of fragment transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
    Delete,
}
