// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operational and status API.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::AtlasError;
use crate::node::NodeCategory;
use crate::operational::MemoryEntry;
use crate::placement::PlacementEngine;
use crate::registry::BackendRegistry;
use crate::replication::ReplicationSet;
use crate::storage::layout;

use super::{MemoryStatus, Orchestrator, RegistryStatus};

impl Orchestrator {
    // ═══════════════════════════════════════════════════════════════════════
    // Operational API
    // ═══════════════════════════════════════════════════════════════════════

    /// Shallow-merge `partial` into the value at `key` and persist it.
    ///
    /// Same-key puts are serialized; each one sees the result of the one
    /// before it. Returns the committed entry (value and version).
    ///
    /// # Errors
    ///
    /// - `InvalidValue` if `partial` is not a JSON object
    /// - `NoCapacity` if the key is new and no Active backend can hold it
    ///
    /// An unreachable backend does not fail the put: the entry is committed
    /// and pushed on the next node sync.
    pub async fn put(&self, key: &str, partial: Value) -> Result<MemoryEntry, AtlasError> {
        let result = self.core.memory.put(key, partial).await;
        crate::metrics::record_operation("put", if result.is_ok() { "success" } else { "error" });
        result
    }

    /// Current value at `key`.
    ///
    /// Falls back to the key's node on its backend when the entry is not
    /// held in memory.
    pub async fn get(&self, key: &str) -> Result<Map<String, Value>, AtlasError> {
        if let Some(value) = self.core.memory.get(key) {
            crate::metrics::record_operation("get", "success");
            return Ok(value);
        }
        match self.read_persisted_entry(key).await {
            Ok(entry) => {
                debug!(key = %key, version = entry.version, "Entry read back from backend");
                crate::metrics::record_operation("get", "success");
                Ok(entry.value)
            }
            Err(e) => {
                crate::metrics::record_operation("get", "error");
                Err(e)
            }
        }
    }

    /// Value, version and commit time held for `key`.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<MemoryEntry> {
        self.core.memory.entry(key)
    }

    /// Point-in-time copy of all operational memory.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Map<String, Value>> {
        self.core.memory.snapshot()
    }

    /// Same as [`snapshot()`](Self::snapshot).
    #[must_use]
    pub fn get_all(&self) -> BTreeMap<String, Map<String, Value>> {
        self.snapshot()
    }

    /// Read `key`'s entry back from its backend, bypassing memory.
    ///
    /// Fails with `Integrity` if the stored copy does not open.
    pub async fn read_persisted_entry(&self, key: &str) -> Result<MemoryEntry, AtlasError> {
        let bytes = self.core.placement.read_slot(NodeCategory::Operational, key).await?;
        let entry: MemoryEntry = serde_json::from_slice(&bytes)?;
        Ok(entry)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Assets
    // ═══════════════════════════════════════════════════════════════════════

    /// Add or replace an asset; pushed by the next asset sync. Returns its digest.
    pub fn register_asset(&self, name: &str, bytes: Vec<u8>) -> Result<String, AtlasError> {
        self.core.assets.register(name, bytes)
    }

    /// Whether `backend` holds the current version of asset `name`.
    #[must_use]
    pub fn asset_is_current_on(&self, name: &str, backend: &str) -> bool {
        self.core.assets.is_current_on(name, backend)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status API (read-only)
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn registry_status(&self) -> RegistryStatus {
        RegistryStatus {
            backends: self.core.registry.list(),
            capacity: self.core.registry.capacity_summary(),
            pending_migrations: self.core.placement.pending_migrations(),
            under_replicated_sets: self.core.replication.under_replicated_count(),
            dirty_nodes: self.core.placement.dirty_count(),
        }
    }

    #[must_use]
    pub fn memory_status(&self) -> MemoryStatus {
        let active_platforms: Vec<String> = self
            .core
            .registry
            .list()
            .into_iter()
            .filter(|b| b.is_active())
            .map(|b| b.platform_id)
            .collect();
        let redundancy = self
            .core
            .replication
            .set(layout::SNAPSHOT_KEY)
            .map_or(0, |s| s.stored_copies());

        MemoryStatus {
            total_storage: self.core.registry.capacity_summary().total,
            node_count: self.core.placement.node_count(),
            active_platforms,
            active_nodes: self.core.placement.active_node_count(),
            redundancy,
            entries: self.core.memory.len(),
            pending_migrations: self.core.placement.pending_migrations(),
            under_replicated_sets: self.core.replication.under_replicated_count(),
            dirty_nodes: self.core.placement.dirty_count(),
        }
    }

    /// Replication state for `logical_key`.
    #[must_use]
    pub fn replication_set(&self, logical_key: &str) -> Option<ReplicationSet> {
        self.core.replication.set(logical_key)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.core.registry
    }

    #[must_use]
    pub fn placement(&self) -> &Arc<PlacementEngine> {
        &self.core.placement
    }
}
