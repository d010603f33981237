// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend registry: the set of known storage backends and their live
//! capacity state.
//!
//! The registry is the only owner of [`StorageBackend`] mutability. Every
//! change goes through a method that takes the write lock for the whole
//! read-modify-write, so `record_usage` is atomic per backend even when
//! placement and migration race from different jobs. Reads (placement,
//! status) take the read lock and get cloned values.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BackendSpec;
use crate::error::AtlasError;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Active,
    Full,
    Migrating,
    Error,
}

impl BackendStatus {
    /// Numeric code for the status gauge.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Migrating => 1,
            Self::Full => 2,
            Self::Error => 3,
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Full => write!(f, "Full"),
            Self::Migrating => write!(f, "Migrating"),
            Self::Error => write!(f, "Error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    Bounded(u64),
    Unbounded,
}

impl Capacity {
    #[must_use]
    pub fn from_bytes(bytes: Option<u64>) -> Self {
        bytes.map_or(Self::Unbounded, Self::Bounded)
    }

    #[must_use]
    pub fn bytes(&self) -> Option<u64> {
        match self {
            Self::Bounded(b) => Some(*b),
            Self::Unbounded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageBackend {
    pub platform_id: String,
    pub capacity: Capacity,
    pub used_bytes: u64,
    pub status: BackendStatus,
    /// Epoch millis of the last successful sync push
    pub last_sync_at: Option<i64>,
    /// Untrusted backends only ever receive sealed payloads
    pub trusted: bool,
    /// Consecutive adapter failures (reset on success)
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl StorageBackend {
    #[must_use]
    pub fn from_spec(spec: &BackendSpec) -> Self {
        Self {
            platform_id: spec.id.clone(),
            capacity: Capacity::from_bytes(spec.capacity_bytes),
            used_bytes: spec.used_bytes,
            status: BackendStatus::Active,
            last_sync_at: None,
            trusted: spec.trusted,
            error_count: 0,
            last_error: None,
        }
    }

    /// Free bytes; `u64::MAX` for unbounded backends.
    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        match self.capacity {
            Capacity::Bounded(total) => total.saturating_sub(self.used_bytes),
            Capacity::Unbounded => u64::MAX,
        }
    }

    /// Used fraction of capacity (0.0 for unbounded).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        match self.capacity {
            Capacity::Bounded(0) => 1.0,
            Capacity::Bounded(total) => self.used_bytes as f64 / total as f64,
            Capacity::Unbounded => 0.0,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == BackendStatus::Active
    }

    #[must_use]
    pub fn fits(&self, bytes: u64) -> bool {
        self.available_bytes() >= bytes
    }

    fn over(&self, threshold: f64) -> bool {
        !matches!(self.capacity, Capacity::Unbounded) && self.utilization() > threshold
    }
}

/// A status change caused by a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: BackendStatus,
    pub to: BackendStatus,
}

/// Outcome of [`BackendRegistry::record_usage`].
#[derive(Debug, Clone)]
pub struct UsageUpdate {
    pub backend: StorageBackend,
    pub transition: Option<StatusTransition>,
}

impl UsageUpdate {
    /// Whether this update flipped the backend to Full.
    #[must_use]
    pub fn became_full(&self) -> bool {
        matches!(self.transition, Some(t) if t.to == BackendStatus::Full)
    }
}

/// Aggregate capacity across all backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacitySummary {
    /// "Unlimited", "<n>TB+" or "<n>GB"
    pub total: String,
    pub used_bytes: u64,
    /// None when any backend is unbounded
    pub total_bytes: Option<u64>,
    /// None when any backend is unbounded
    pub available_bytes: Option<u64>,
}

pub struct BackendRegistry {
    backends: RwLock<BTreeMap<String, StorageBackend>>,
    full_threshold: f64,
}

impl BackendRegistry {
    /// Build the registry from static configuration.
    ///
    /// Backends start Active regardless of their configured usage; the full
    /// threshold is evaluated on the next usage change.
    #[must_use]
    pub fn new(specs: &[BackendSpec], full_threshold: f64) -> Self {
        let backends = specs
            .iter()
            .map(|spec| (spec.id.clone(), StorageBackend::from_spec(spec)))
            .collect();
        Self {
            backends: RwLock::new(backends),
            full_threshold,
        }
    }

    #[must_use]
    pub fn full_threshold(&self) -> f64 {
        self.full_threshold
    }

    /// All backends ordered by platform id.
    #[must_use]
    pub fn list(&self) -> Vec<StorageBackend> {
        self.backends.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<StorageBackend, AtlasError> {
        self.backends
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AtlasError::UnknownBackend(id.to_string()))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.backends.read().contains_key(id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.backends.read().values().filter(|b| b.is_active()).count()
    }

    /// Apply a usage delta. The single mutation point for `used_bytes`.
    ///
    /// Negative deltas saturate at zero. A positive delta that pushes an
    /// Active, bounded backend over the full threshold flips it to Full and
    /// reports the transition so the caller can migrate.
    pub fn record_usage(&self, id: &str, delta: i64) -> Result<UsageUpdate, AtlasError> {
        let mut backends = self.backends.write();
        let backend = backends
            .get_mut(id)
            .ok_or_else(|| AtlasError::UnknownBackend(id.to_string()))?;

        backend.used_bytes = if delta >= 0 {
            backend.used_bytes.saturating_add(delta as u64)
        } else {
            backend.used_bytes.saturating_sub(delta.unsigned_abs())
        };

        let mut transition = None;
        if delta > 0 && backend.status == BackendStatus::Active && backend.over(self.full_threshold) {
            backend.status = BackendStatus::Full;
            transition = Some(StatusTransition {
                from: BackendStatus::Active,
                to: BackendStatus::Full,
            });
            warn!(
                backend = %id,
                used = backend.used_bytes,
                utilization = backend.utilization(),
                "Backend crossed full threshold"
            );
        }

        crate::metrics::set_backend_used_bytes(id, backend.used_bytes);
        crate::metrics::set_backend_status(id, backend.status);
        Ok(UsageUpdate {
            backend: backend.clone(),
            transition,
        })
    }

    /// Force a status. Returns the transition if the status changed.
    pub fn mark_status(
        &self,
        id: &str,
        status: BackendStatus,
    ) -> Result<Option<StatusTransition>, AtlasError> {
        let mut backends = self.backends.write();
        let backend = backends
            .get_mut(id)
            .ok_or_else(|| AtlasError::UnknownBackend(id.to_string()))?;
        Ok(Self::transition(id, backend, status))
    }

    /// End of a migration: Active if headroom recovered, else Full.
    pub fn settle(&self, id: &str) -> Result<BackendStatus, AtlasError> {
        let mut backends = self.backends.write();
        let backend = backends
            .get_mut(id)
            .ok_or_else(|| AtlasError::UnknownBackend(id.to_string()))?;
        if matches!(backend.status, BackendStatus::Migrating | BackendStatus::Full) {
            let next = if backend.over(self.full_threshold) {
                BackendStatus::Full
            } else {
                BackendStatus::Active
            };
            Self::transition(id, backend, next);
        }
        Ok(backend.status)
    }

    /// Promote Full backends whose usage dropped back under the threshold.
    pub fn rebalance_statuses(&self) -> Vec<String> {
        let mut backends = self.backends.write();
        let mut recovered = Vec::new();
        for (id, backend) in backends.iter_mut() {
            if backend.status == BackendStatus::Full && !backend.over(self.full_threshold) {
                Self::transition(id, backend, BackendStatus::Active);
                recovered.push(id.clone());
            }
        }
        recovered
    }

    /// A call to this backend succeeded. Clears the error state.
    pub fn record_success(&self, id: &str) -> Option<StatusTransition> {
        let mut backends = self.backends.write();
        let backend = backends.get_mut(id)?;
        backend.error_count = 0;
        backend.last_error = None;
        if backend.status != BackendStatus::Error {
            return None;
        }
        let next = if backend.over(self.full_threshold) {
            BackendStatus::Full
        } else {
            BackendStatus::Active
        };
        info!(backend = %id, status = %next, "Backend reachable again");
        Self::transition(id, backend, next)
    }

    /// A call failed outright. The backend is Error until it next succeeds.
    pub fn record_failure(&self, id: &str, reason: &str) -> Option<StatusTransition> {
        let mut backends = self.backends.write();
        let backend = backends.get_mut(id)?;
        backend.error_count += 1;
        backend.last_error = Some(reason.to_string());
        crate::metrics::record_backend_error(id, "unavailable");
        Self::transition(id, backend, BackendStatus::Error)
    }

    /// A call timed out. Counted, but no status change.
    pub fn record_timeout(&self, id: &str, reason: &str) {
        let mut backends = self.backends.write();
        if let Some(backend) = backends.get_mut(id) {
            backend.error_count += 1;
            backend.last_error = Some(reason.to_string());
            crate::metrics::record_backend_error(id, "timeout");
        }
    }

    pub fn touch_sync(&self, id: &str, at: i64) {
        if let Some(backend) = self.backends.write().get_mut(id) {
            backend.last_sync_at = Some(at);
        }
    }

    /// Adopt usage recorded in a restored snapshot.
    ///
    /// Capacity and trust stay as configured; unknown ids are ignored.
    pub fn restore_usage(&self, snapshot: &[StorageBackend]) {
        let mut backends = self.backends.write();
        for saved in snapshot {
            if let Some(backend) = backends.get_mut(&saved.platform_id) {
                backend.used_bytes = saved.used_bytes;
                backend.last_sync_at = saved.last_sync_at;
                if backend.status == BackendStatus::Active && backend.over(self.full_threshold) {
                    backend.status = BackendStatus::Full;
                }
                debug!(backend = %saved.platform_id, used = saved.used_bytes, "Restored backend usage");
            }
        }
    }

    #[must_use]
    pub fn capacity_summary(&self) -> CapacitySummary {
        let backends = self.backends.read();
        let used_bytes: u64 = backends.values().map(|b| b.used_bytes).sum();
        let total_bytes = backends
            .values()
            .try_fold(0u64, |acc, b| b.capacity.bytes().map(|c| acc.saturating_add(c)));

        let total = match total_bytes {
            None => "Unlimited".to_string(),
            Some(bytes) => {
                let gb = bytes / GIB;
                let tb = gb / 1024;
                if tb > 0 {
                    format!("{}TB+", tb)
                } else {
                    format!("{}GB", gb)
                }
            }
        };
        CapacitySummary {
            total,
            used_bytes,
            total_bytes,
            available_bytes: total_bytes.map(|t| t.saturating_sub(used_bytes)),
        }
    }

    fn transition(
        id: &str,
        backend: &mut StorageBackend,
        to: BackendStatus,
    ) -> Option<StatusTransition> {
        if backend.status == to {
            return None;
        }
        let from = backend.status;
        backend.status = to;
        crate::metrics::set_backend_status(id, to);
        debug!(backend = %id, %from, %to, "Backend status changed");
        Some(StatusTransition { from, to })
    }
}
