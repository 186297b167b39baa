//! Backend pool: the default [`BackendRegistry`]
//!
//! Lists backends least-recently-uploaded-to first so placements rotate over
//! the pool. Backends the health tracker marks unavailable sort last.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::health::{BackendStatus, HealthTracker, PoolHealth};
use super::{Backend, BackendRegistry, LocalBackend, MemoryBackend, TransferKind};
use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};

struct Entry {
    backend: Arc<dyn Backend>,
    /// Registration order, the final tie breaker
    position: usize,
    /// Monotonic upload stamp; 0 = never uploaded to
    upload_stamp: u64,
    last_upload: Option<DateTime<Utc>>,
}

/// Pool of registered backends
pub struct BackendPool {
    entries: RwLock<HashMap<String, Entry>>,
    next_stamp: AtomicU64,
    health: Arc<HealthTracker>,
}

impl BackendPool {
    /// Empty pool; `k` and `k + m` size the pool health summary
    pub fn new(data_fragments: usize, total_fragments: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_stamp: AtomicU64::new(1),
            health: Arc::new(HealthTracker::new(data_fragments, total_fragments)),
        }
    }

    /// Build the pool from the `backends` section of the configuration
    pub async fn from_config(
        configs: &[BackendConfig],
        data_fragments: usize,
        total_fragments: usize,
    ) -> Result<Self> {
        let pool = Self::new(data_fragments, total_fragments);

        for config in configs {
            let backend: Arc<dyn Backend> = match &config.kind {
                BackendKind::Memory { capacity } => {
                    Arc::new(MemoryBackend::new(config.id.clone(), *capacity))
                }
                BackendKind::Local { path, max_size } => {
                    Arc::new(LocalBackend::open(config.id.clone(), path, *max_size).await?)
                }
            };
            pool.register(backend)?;
        }

        info!(
            "Created backend pool with {} backends (K={}, N={})",
            pool.len(),
            data_fragments,
            total_fragments
        );
        Ok(pool)
    }

    /// Add a backend; ids must be unique
    pub fn register(&self, backend: Arc<dyn Backend>) -> Result<()> {
        let id = backend.id().to_string();
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(Error::InvalidConfig(format!(
                "Backend {} registered twice",
                id
            )));
        }

        let position = entries.len();
        entries.insert(
            id.clone(),
            Entry {
                backend,
                position,
                upload_stamp: 0,
                last_upload: None,
            },
        );
        self.health.register(&id);
        debug!("Registered backend {}", id);
        Ok(())
    }

    /// Remove a backend; fragments it holds become erased
    pub fn unregister(&self, backend_id: &str) -> Option<Arc<dyn Backend>> {
        let removed = self.entries.write().remove(backend_id);
        self.health.remove(backend_id);
        removed.map(|e| e.backend)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Time of the last successful fragment upload to a backend
    pub fn last_upload(&self, backend_id: &str) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .get(backend_id)
            .and_then(|e| e.last_upload)
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn pool_health(&self) -> PoolHealth {
        self.health.pool_health()
    }
}

impl BackendRegistry for BackendPool {
    fn list(&self) -> Vec<Arc<dyn Backend>> {
        let entries = self.entries.read();
        let mut ordered: Vec<(bool, u64, usize, Arc<dyn Backend>)> = entries
            .iter()
            .map(|(id, entry)| {
                let unavailable = self.health.status(id) == BackendStatus::Unavailable;
                (
                    unavailable,
                    entry.upload_stamp,
                    entry.position,
                    Arc::clone(&entry.backend),
                )
            })
            .collect();

        ordered.sort_by_key(|(unavailable, stamp, position, _)| (*unavailable, *stamp, *position));
        ordered.into_iter().map(|(_, _, _, backend)| backend).collect()
    }

    fn find(&self, backend_id: &str) -> Option<Arc<dyn Backend>> {
        self.entries
            .read()
            .get(backend_id)
            .map(|e| Arc::clone(&e.backend))
    }

    fn record_success(&self, backend_id: &str, kind: TransferKind) {
        self.health.record_success(backend_id);

        if kind == TransferKind::Upload {
            let stamp = self.next_stamp.fetch_add(1, Ordering::SeqCst);
            if let Some(entry) = self.entries.write().get_mut(backend_id) {
                entry.upload_stamp = stamp;
                entry.last_upload = Some(Utc::now());
            }
        }
    }

    fn record_failure(&self, backend_id: &str, error: &Error) {
        // Missing blobs say nothing about the backend's health
        if error.is_not_found() {
            return;
        }
        self.health.record_failure(backend_id, &error.to_string());
        if self.health.status(backend_id) == BackendStatus::Unavailable {
            warn!("Backend {} marked unavailable: {}", backend_id, error);
        }
    }
}
