//! Backend health monitoring
//!
//! Tracks per-backend success/failure history and summarises the pool
//! relative to the `k + m` placements an upload needs and the `k` fragments
//! a download needs.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Default number of consecutive failures before marking a backend unavailable
const DEFAULT_MAX_FAILURES: u32 = 3;

/// Error rate threshold for degraded status (10%)
const DEGRADED_ERROR_RATE_THRESHOLD: f64 = 0.10;

/// Status of a single backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendStatus {
    /// Backend is answering normally
    Healthy,
    /// High error rate but still answering
    Degraded,
    /// Too many consecutive failures
    Unavailable,
}

/// Health information for a single backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend_id: String,
    pub status: BackendStatus,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Consecutive failures
    pub failure_count: u32,
    pub total_operations: u64,
    pub failed_operations: u64,
}

impl BackendHealth {
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: BackendStatus::Healthy,
            last_success: None,
            last_error: None,
            failure_count: 0,
            total_operations: 0,
            failed_operations: 0,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.failed_operations as f64 / self.total_operations as f64
    }

    /// Usable for new placements and retrievals
    pub fn is_usable(&self) -> bool {
        self.status != BackendStatus::Unavailable
    }
}

/// Overall pool status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PoolStatus {
    /// At least `k + m` usable backends, all healthy
    Healthy,
    /// Fewer than `k + m` usable (or some degraded) but at least `k`
    Degraded,
    /// Fewer than `k` usable backends: nothing can be read back
    Failed,
}

/// Snapshot of the pool's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealth {
    pub status: PoolStatus,
    pub backends: Vec<BackendHealth>,
    /// Fragments needed to read an object (k)
    pub required_backends: usize,
    /// Placements per upload (k + m)
    pub placement_width: usize,
}

/// Health tracker keyed by backend id
pub struct HealthTracker {
    backends: RwLock<HashMap<String, BackendHealth>>,
    required_backends: usize,
    placement_width: usize,
    max_failures_before_unavailable: u32,
}

impl HealthTracker {
    pub fn new(required_backends: usize, placement_width: usize) -> Self {
        Self::with_max_failures(required_backends, placement_width, DEFAULT_MAX_FAILURES)
    }

    pub fn with_max_failures(
        required_backends: usize,
        placement_width: usize,
        max_failures: u32,
    ) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            required_backends,
            placement_width,
            max_failures_before_unavailable: max_failures,
        }
    }

    /// Start tracking a backend (no-op if already tracked)
    pub fn register(&self, backend_id: &str) {
        self.backends
            .write()
            .entry(backend_id.to_string())
            .or_insert_with(|| BackendHealth::new(backend_id));
    }

    /// Stop tracking a backend
    pub fn remove(&self, backend_id: &str) {
        self.backends.write().remove(backend_id);
    }

    pub fn record_success(&self, backend_id: &str) {
        let mut backends = self.backends.write();
        let health = backends
            .entry(backend_id.to_string())
            .or_insert_with(|| BackendHealth::new(backend_id));

        health.total_operations += 1;
        health.last_success = Some(Utc::now());
        health.failure_count = 0;

        // A success proves the backend answers again
        health.status = if health.error_rate() < DEGRADED_ERROR_RATE_THRESHOLD {
            BackendStatus::Healthy
        } else {
            BackendStatus::Degraded
        };
    }

    pub fn record_failure(&self, backend_id: &str, error: &str) {
        let mut backends = self.backends.write();
        let health = backends
            .entry(backend_id.to_string())
            .or_insert_with(|| BackendHealth::new(backend_id));

        health.total_operations += 1;
        health.failed_operations += 1;
        health.failure_count += 1;
        health.last_error = Some(error.to_string());

        if health.failure_count >= self.max_failures_before_unavailable {
            health.status = BackendStatus::Unavailable;
        } else if health.error_rate() >= DEGRADED_ERROR_RATE_THRESHOLD {
            health.status = BackendStatus::Degraded;
        }
    }

    /// Health of one backend; untracked backends report healthy
    pub fn backend_health(&self, backend_id: &str) -> BackendHealth {
        self.backends
            .read()
            .get(backend_id)
            .cloned()
            .unwrap_or_else(|| BackendHealth::new(backend_id))
    }

    pub fn status(&self, backend_id: &str) -> BackendStatus {
        self.backends
            .read()
            .get(backend_id)
            .map(|h| h.status)
            .unwrap_or(BackendStatus::Healthy)
    }

    pub fn pool_health(&self) -> PoolHealth {
        let backends = self.backends.read();
        let usable = backends.values().filter(|h| h.is_usable()).count();
        let all_healthy = backends
            .values()
            .all(|h| h.status == BackendStatus::Healthy);

        let status = if usable < self.required_backends {
            PoolStatus::Failed
        } else if usable >= self.placement_width && all_healthy {
            PoolStatus::Healthy
        } else {
            PoolStatus::Degraded
        };

        let mut snapshot: Vec<BackendHealth> = backends.values().cloned().collect();
        snapshot.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));

        PoolHealth {
            status,
            backends: snapshot,
            required_backends: self.required_backends,
            placement_width: self.placement_width,
        }
    }

    pub fn usable_count(&self) -> usize {
        self.backends
            .read()
            .values()
            .filter(|h| h.is_usable())
            .count()
    }

    /// At least `k` backends usable
    pub fn can_operate(&self) -> bool {
        self.usable_count() >= self.required_backends
    }

    /// Clear failure history (e.g. after manual intervention)
    pub fn reset_failures(&self, backend_id: &str) {
        if let Some(health) = self.backends.write().get_mut(backend_id) {
            health.failure_count = 0;
            health.failed_operations = 0;
            health.last_error = None;
            health.status = BackendStatus::Healthy;
        }
    }
}
