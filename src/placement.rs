// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Placement engine: which backend a node lives on, and moving it when that
//! backend saturates.
//!
//! # Placement
//!
//! Among Active backends with enough headroom, prefer those under the soft
//! threshold; pick the one with the most free bytes, ties going to the
//! smallest platform id. Only if nothing under the soft threshold fits do we
//! fall back to any Active backend with headroom.
//!
//! # Migration
//!
//! ```text
//!   write pushes A over full threshold
//!        │
//!        ▼
//!   A: Active → Full ──► target with available ≥ margin × size?
//!                             │ yes                      │ no
//!                             ▼                          ▼
//!                A → Migrating, copy to B,          node pinned to A,
//!                A −size, B +size, re-point         migration_pending,
//!                node, settle A (Active|Full)       retried on node sync
//! ```
//!
//! A write that grows a node pinned to a backend that is not Active, or that
//! lacks the headroom for the extra bytes, is never pushed there. The node is
//! relocated first (with the migration margin if possible, else anywhere it
//! fits) and the write fails with `NoCapacity` when nothing can take it.
//!
//! Every write and migration for a slot runs under that slot's lock; no
//! other lock is held across an adapter call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::EncryptionGate;
use crate::error::AtlasError;
use crate::metrics;
use crate::node::{derive_node_id, MemoryNode, NodeCategory};
use crate::operational::{EntrySink, MemoryEntry};
use crate::registry::{BackendRegistry, BackendStatus, StorageBackend, UsageUpdate};
use crate::storage::BackendGateway;

type SlotKey = (NodeCategory, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated { from: String, to: String, bytes: u64 },
    /// No target had room; the node stays pinned and is retried later
    Pending,
}

/// Result of [`PlacementEngine::write_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub node_id: String,
    /// Backend holding the node after the write (and any migration)
    pub backend_id: String,
    /// False when the backend was unreachable; the node stays dirty
    pub persisted: bool,
    pub migration: Option<MigrationOutcome>,
}

/// Counters from one node sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSyncReport {
    pub pushed: usize,
    pub failed: usize,
    pub migrated: usize,
    pub still_pending: usize,
}

pub struct PlacementEngine {
    registry: Arc<BackendRegistry>,
    gateway: Arc<BackendGateway>,
    gate: Arc<EncryptionGate>,
    nodes: DashMap<String, MemoryNode>,
    slots: DashMap<SlotKey, String>,
    slot_locks: DashMap<SlotKey, Arc<Mutex<()>>>,
    soft_threshold: f64,
    migration_margin: f64,
    seq: AtomicU64,
}

impl PlacementEngine {
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        gateway: Arc<BackendGateway>,
        gate: Arc<EncryptionGate>,
        soft_threshold: f64,
        migration_margin: f64,
    ) -> Self {
        Self {
            registry,
            gateway,
            gate,
            nodes: DashMap::new(),
            slots: DashMap::new(),
            slot_locks: DashMap::new(),
            soft_threshold,
            migration_margin,
            seq: AtomicU64::new(0),
        }
    }

    /// Choose a backend for a new write of `size` bytes.
    pub fn place(&self, size: u64, category: NodeCategory) -> Result<String, AtlasError> {
        self.place_excluding(size, category, &[])
    }

    /// Like [`place`](Self::place), never returning one of `exclude`.
    pub fn place_excluding(
        &self,
        size: u64,
        category: NodeCategory,
        exclude: &[String],
    ) -> Result<String, AtlasError> {
        let candidates: Vec<StorageBackend> = self
            .registry
            .list()
            .into_iter()
            .filter(|b| b.is_active() && b.fits(size) && !exclude.contains(&b.platform_id))
            .collect();

        let soft = self.soft_threshold;
        let chosen = most_headroom(candidates.iter().filter(|b| b.utilization() < soft))
            .or_else(|| most_headroom(candidates.iter()));

        match chosen {
            Some(backend) => {
                metrics::record_placement(&backend.platform_id, category.as_str());
                debug!(backend = %backend.platform_id, %category, size, "Placed write");
                Ok(backend.platform_id.clone())
            }
            None => {
                metrics::record_no_capacity(category.as_str());
                warn!(%category, size, "No Active backend has capacity");
                Err(AtlasError::NoCapacity { requested: size })
            }
        }
    }

    /// Create or update the node behind a logical slot and push it.
    ///
    /// An unreachable backend is not an error here: the payload is kept,
    /// the node stays dirty, and node sync pushes it later.
    #[tracing::instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn write_slot(
        &self,
        category: NodeCategory,
        slot: &str,
        payload: Vec<u8>,
    ) -> Result<WriteReceipt, AtlasError> {
        let key = (category, slot.to_string());
        let lock = self.slot_lock(&key);
        let _guard = lock.lock().await;

        let previous = self.node_for(&key);
        let mut node = match previous.clone() {
            Some(node) => node,
            None => {
                let estimate = payload.len() as u64 + EncryptionGate::overhead() as u64;
                let backend = self.place(estimate, category)?;
                self.new_node(category, slot, backend)
            }
        };
        node.payload = payload;
        node.last_update_at = crate::now_millis();
        node.dirty = true;
        self.store(&node);

        let result = self.push_and_rebalance(node).await;
        if let (Err(AtlasError::NoCapacity { .. }), Some(previous)) = (&result, previous) {
            // Nothing was written; the slot keeps its last accepted payload
            self.store(&previous);
        }
        result
    }

    /// Read a slot back through its backend and open it.
    pub async fn read_slot(&self, category: NodeCategory, slot: &str) -> Result<Vec<u8>, AtlasError> {
        let key = (category, slot.to_string());
        let node = self
            .node_for(&key)
            .ok_or_else(|| AtlasError::NotFound(format!("{}/{}", category, slot)))?;
        let stored = self.gateway.read(&node.backend_id, &node.path()).await?;
        self.gate.decode(&stored, node.encrypted).map_err(|err| {
            metrics::record_integrity_failure("node");
            warn!(node = %node.id, backend = %node.backend_id, error = %err, "Node failed to open");
            AtlasError::from(err)
        })
    }

    /// Latest payload held for a slot, whether or not it has been pushed.
    #[must_use]
    pub fn local_payload(&self, category: NodeCategory, slot: &str) -> Option<Vec<u8>> {
        self.node_for(&(category, slot.to_string())).map(|n| n.payload)
    }

    /// Make sure a slot has a node pinned to `backend_id`. No I/O.
    ///
    /// Returns the node id, existing or new.
    pub fn ensure_node(
        &self,
        category: NodeCategory,
        slot: &str,
        backend_id: &str,
    ) -> Result<String, AtlasError> {
        self.registry.get(backend_id)?;
        let key = (category, slot.to_string());
        if let Some(node) = self.node_for(&key) {
            return Ok(node.id);
        }
        let node = self.new_node(category, slot, backend_id.to_string());
        self.store(&node);
        Ok(node.id)
    }

    /// Re-push every dirty node, then retry pending migrations.
    #[tracing::instrument(skip(self))]
    pub async fn sync_dirty(&self) -> NodeSyncReport {
        let mut report = NodeSyncReport::default();
        let dirty: Vec<SlotKey> = self
            .nodes
            .iter()
            .filter(|n| n.dirty)
            .map(|n| (n.category, n.slot.clone()))
            .collect();

        for key in dirty {
            let lock = self.slot_lock(&key);
            let _guard = lock.lock().await;
            let Some(node) = self.node_for(&key).filter(|n| n.dirty) else {
                continue;
            };
            match self.push_and_rebalance(node).await {
                Ok(receipt) if receipt.persisted => {
                    report.pushed += 1;
                    if matches!(receipt.migration, Some(MigrationOutcome::Migrated { .. })) {
                        report.migrated += 1;
                    }
                }
                Ok(_) => report.failed += 1,
                Err(e) => {
                    warn!(slot = %key.1, category = %key.0, error = %e, "Dirty node push failed");
                    report.failed += 1;
                }
            }
        }

        let (migrated, still_pending) = self.retry_pending_migrations().await;
        report.migrated += migrated;
        report.still_pending = still_pending;

        metrics::set_dirty_nodes(self.dirty_count());
        report
    }

    /// Retry every migration-pending node. Returns (migrated, still pending).
    pub async fn retry_pending_migrations(&self) -> (usize, usize) {
        let pending: Vec<SlotKey> = self
            .nodes
            .iter()
            .filter(|n| n.migration_pending)
            .map(|n| (n.category, n.slot.clone()))
            .collect();

        let mut migrated = 0;
        for key in pending {
            let lock = self.slot_lock(&key);
            let _guard = lock.lock().await;
            let Some(node) = self.node_for(&key).filter(|n| n.migration_pending) else {
                continue;
            };
            match self.migrate_locked(node).await {
                Ok(MigrationOutcome::Migrated { .. }) => migrated += 1,
                Ok(MigrationOutcome::Pending) => {}
                Err(e) => warn!(slot = %key.1, error = %e, "Pending migration failed"),
            }
        }

        let still_pending = self.pending_migrations();
        metrics::set_pending_migrations(still_pending);
        (migrated, still_pending)
    }

    /// Adopt nodes from a restored manifest.
    ///
    /// Nodes pinned to unknown backends are dropped. A slot already held
    /// locally keeps the newer of the two nodes.
    pub fn adopt_nodes(&self, manifest: Vec<MemoryNode>) -> usize {
        let mut adopted = 0;
        for node in manifest {
            if !self.registry.contains(&node.backend_id) {
                warn!(node = %node.id, backend = %node.backend_id, "Skipping node on unknown backend");
                continue;
            }
            let key = (node.category, node.slot.clone());
            if let Some(current) = self.node_for(&key) {
                if current.last_update_at >= node.last_update_at {
                    continue;
                }
                self.nodes.remove(&current.id);
            }
            self.store(&node);
            adopted += 1;
        }
        info!(adopted, "Adopted node manifest");
        adopted
    }

    /// All nodes ordered by id.
    #[must_use]
    pub fn node_manifest(&self) -> Vec<MemoryNode> {
        let mut nodes: Vec<MemoryNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<MemoryNode> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    #[must_use]
    pub fn slot_node(&self, category: NodeCategory, slot: &str) -> Option<MemoryNode> {
        self.node_for(&(category, slot.to_string()))
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes on backends that are currently Active.
    #[must_use]
    pub fn active_node_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| {
                self.registry
                    .get(&n.backend_id)
                    .map(|b| b.is_active())
                    .unwrap_or(false)
            })
            .count()
    }

    #[must_use]
    pub fn pending_migrations(&self) -> usize {
        self.nodes.iter().filter(|n| n.migration_pending).count()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.dirty).count()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals (callers hold the slot lock)
    // ═══════════════════════════════════════════════════════════════════════

    async fn push_and_rebalance(&self, mut node: MemoryNode) -> Result<WriteReceipt, AtlasError> {
        if self.must_relocate(&node)? {
            return self.relocate(node).await;
        }

        let update = match self.push(&mut node).await {
            Ok(update) => update,
            Err(e) if e.is_transient() => {
                debug!(node = %node.id, error = %e, "Backend unreachable, node stays dirty");
                return Ok(WriteReceipt {
                    node_id: node.id,
                    backend_id: node.backend_id,
                    persisted: false,
                    migration: None,
                });
            }
            Err(e) => return Err(e),
        };

        let over_capacity = update
            .backend
            .capacity
            .bytes()
            .is_some_and(|total| update.backend.used_bytes > total);
        let migration = if update.became_full() || node.migration_pending || over_capacity {
            Some(self.migrate_locked(node.clone()).await?)
        } else {
            None
        };
        let backend_id = self
            .node(&node.id)
            .map(|n| n.backend_id)
            .unwrap_or(node.backend_id);

        Ok(WriteReceipt {
            node_id: node.id,
            backend_id,
            persisted: true,
            migration,
        })
    }

    /// Whether pushing the node in place would grow a backend that cannot
    /// take the extra bytes.
    fn must_relocate(&self, node: &MemoryNode) -> Result<bool, AtlasError> {
        let backend = self.registry.get(&node.backend_id)?;
        let delta = encoded_len(&backend, node.payload_len() as usize).saturating_sub(node.stored_bytes);
        if delta == 0 {
            return Ok(false);
        }
        let saturated = matches!(backend.status, BackendStatus::Full | BackendStatus::Migrating);
        Ok(saturated || !backend.fits(delta))
    }

    /// Move a node whose next write does not fit where it is pinned.
    ///
    /// Prefers a target with the migration margin, then any Active backend
    /// the payload fits on. `NoCapacity` when there is none.
    async fn relocate(&self, node: MemoryNode) -> Result<WriteReceipt, AtlasError> {
        let source = node.backend_id.clone();
        let size = node.stored_bytes.max(node.payload_len());
        let needed = (size as f64 * self.migration_margin).ceil() as u64;
        let target = self
            .migration_target(&source, needed, node.payload_len() as usize)
            .or_else(|| self.migration_target(&source, 0, node.payload_len() as usize));

        let Some(target) = target else {
            metrics::record_no_capacity(node.category.as_str());
            warn!(
                node = %node.id,
                backend = %source,
                size = node.payload_len(),
                "Write does not fit its backend and no other backend has room"
            );
            return Err(AtlasError::NoCapacity {
                requested: node.payload_len() as u64,
            });
        };

        debug!(node = %node.id, from = %source, to = %target.platform_id, "Relocating growing node");
        let node_id = node.id.clone();
        let migration = self.move_node(node, target).await?;
        let current = self.node(&node_id);
        Ok(WriteReceipt {
            node_id,
            backend_id: current.as_ref().map_or(source, |n| n.backend_id.clone()),
            persisted: matches!(migration, MigrationOutcome::Migrated { .. }),
            migration: Some(migration),
        })
    }

    /// Write the node's payload to its backend and charge the size delta.
    async fn push(&self, node: &mut MemoryNode) -> Result<UsageUpdate, AtlasError> {
        let backend = self.registry.get(&node.backend_id)?;
        let (bytes, sealed) = self.gate.encode_for(&backend, &node.payload)?;
        self.gateway.write(&node.backend_id, &node.path(), &bytes).await?;

        let stored = bytes.len() as u64;
        let delta = stored as i64 - node.stored_bytes as i64;
        node.stored_bytes = stored;
        node.encrypted = sealed;
        node.dirty = false;
        self.store(node);

        self.registry.touch_sync(&node.backend_id, crate::now_millis());
        self.registry.record_usage(&node.backend_id, delta)
    }

    async fn migrate_locked(&self, mut node: MemoryNode) -> Result<MigrationOutcome, AtlasError> {
        let source = node.backend_id.clone();
        let size = node.stored_bytes.max(node.payload_len());
        let needed = (size as f64 * self.migration_margin).ceil() as u64;

        let Some(target) = self.migration_target(&source, needed, node.payload_len() as usize) else {
            if !node.migration_pending {
                warn!(node = %node.id, backend = %source, needed, "No migration target, node stays pinned");
                metrics::record_migration(&source, "pending", size);
            }
            node.migration_pending = true;
            self.store(&node);
            return Ok(MigrationOutcome::Pending);
        };

        self.move_node(node, target).await
    }

    /// Active backend other than `source` with room for `needed` bytes and
    /// for the payload as it would be encoded there.
    fn migration_target(&self, source: &str, needed: u64, payload_len: usize) -> Option<StorageBackend> {
        let candidates: Vec<StorageBackend> = self
            .registry
            .list()
            .into_iter()
            .filter(|b| {
                b.platform_id != source
                    && b.is_active()
                    && b.fits(needed.max(encoded_len(b, payload_len)))
            })
            .collect();
        most_headroom(candidates.iter()).cloned()
    }

    /// Copy the node to `target`, move its usage, re-point it and drop the
    /// source copy.
    async fn move_node(
        &self,
        mut node: MemoryNode,
        target: StorageBackend,
    ) -> Result<MigrationOutcome, AtlasError> {
        let source = node.backend_id.clone();
        let size = node.stored_bytes.max(node.payload_len());
        // An Error source keeps its status until a call to it succeeds
        let reachable = self.registry.get(&source)?.status != BackendStatus::Error;

        if reachable {
            self.registry.mark_status(&source, BackendStatus::Migrating)?;
        }
        let path = node.path();
        let (bytes, sealed) = self.gate.encode_for(&target, &node.payload)?;

        if let Err(e) = self.gateway.write(&target.platform_id, &path, &bytes).await {
            node.migration_pending = true;
            self.store(&node);
            if reachable {
                self.registry.settle(&source)?;
            }
            metrics::record_migration(&source, "failed", size);
            warn!(node = %node.id, from = %source, to = %target.platform_id, error = %e, "Migration copy failed");
            return if e.is_transient() {
                Ok(MigrationOutcome::Pending)
            } else {
                Err(e)
            };
        }

        let freed = node.stored_bytes;
        let stored = bytes.len() as u64;
        self.registry.record_usage(&source, -(freed as i64))?;
        let arrival = self.registry.record_usage(&target.platform_id, stored as i64)?;
        if arrival.became_full() {
            warn!(backend = %target.platform_id, "Migration target crossed full threshold");
        }

        node.backend_id = target.platform_id.clone();
        node.stored_bytes = stored;
        node.encrypted = sealed;
        node.dirty = false;
        node.migration_pending = false;
        self.store(&node);

        if let Err(e) = self.gateway.delete(&source, &path).await {
            debug!(node = %node.id, backend = %source, error = %e, "Stale source copy left behind");
        }
        let settled = if reachable {
            self.registry.settle(&source)?
        } else {
            BackendStatus::Error
        };

        metrics::record_migration(&source, "migrated", stored);
        info!(
            node = %node.id,
            from = %source,
            to = %target.platform_id,
            bytes = stored,
            source_status = %settled,
            "Node migrated"
        );
        Ok(MigrationOutcome::Migrated {
            from: source,
            to: target.platform_id,
            bytes: stored,
        })
    }

    fn new_node(&self, category: NodeCategory, slot: &str, backend_id: String) -> MemoryNode {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = derive_node_id(&backend_id, category, crate::now_millis(), seq);
        MemoryNode::new(id, category, slot.to_string(), backend_id)
    }

    fn store(&self, node: &MemoryNode) {
        self.slots
            .insert((node.category, node.slot.clone()), node.id.clone());
        self.nodes.insert(node.id.clone(), node.clone());
    }

    fn node_for(&self, key: &SlotKey) -> Option<MemoryNode> {
        let id = self.slots.get(key).map(|r| r.value().clone())?;
        self.node(&id)
    }

    fn slot_lock(&self, key: &SlotKey) -> Arc<Mutex<()>> {
        self.slot_locks.entry(key.clone()).or_default().clone()
    }
}

/// Bytes a payload occupies once encoded for `backend`.
fn encoded_len(backend: &StorageBackend, payload_len: usize) -> u64 {
    if backend.trusted {
        payload_len as u64
    } else {
        (payload_len + EncryptionGate::overhead()) as u64
    }
}

/// Backend with the most free bytes; ties go to the smallest id.
fn most_headroom<'a>(backends: impl Iterator<Item = &'a StorageBackend>) -> Option<&'a StorageBackend> {
    backends.fold(None, |best: Option<&StorageBackend>, b| match best {
        Some(current)
            if current.available_bytes() > b.available_bytes()
                || (current.available_bytes() == b.available_bytes()
                    && current.platform_id <= b.platform_id) =>
        {
            Some(current)
        }
        _ => Some(b),
    })
}

#[async_trait]
impl EntrySink for PlacementEngine {
    async fn persist(&self, entry: &MemoryEntry) -> Result<(), AtlasError> {
        let payload = serde_json::to_vec(entry)?;
        let receipt = self
            .write_slot(NodeCategory::Operational, &entry.key, payload)
            .await?;
        if !receipt.persisted {
            debug!(key = %entry.key, backend = %receipt.backend_id, "Entry held locally until next node sync");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSpec;
    use crate::storage::{BackendAdapter, InMemoryAdapter};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        engine: PlacementEngine,
        registry: Arc<BackendRegistry>,
        adapters: HashMap<String, Arc<InMemoryAdapter>>,
    }

    fn fixture(specs: &[BackendSpec]) -> Fixture {
        let registry = Arc::new(BackendRegistry::new(specs, 0.9));
        let mut adapters = HashMap::new();
        let mut dyn_adapters: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
        for spec in specs {
            let adapter = Arc::new(InMemoryAdapter::new());
            adapters.insert(spec.id.clone(), adapter.clone());
            dyn_adapters.insert(spec.id.clone(), adapter);
        }
        let gateway = Arc::new(
            BackendGateway::new(registry.clone(), dyn_adapters, Duration::from_secs(1)).unwrap(),
        );
        let gate = Arc::new(EncryptionGate::new([1u8; 32]));
        Fixture {
            engine: PlacementEngine::new(registry.clone(), gateway, gate, 0.8, 2.0),
            registry,
            adapters,
        }
    }

    #[test]
    fn test_place_prefers_most_headroom_under_soft_threshold() {
        let f = fixture(&[
            BackendSpec::bounded("a", 1000).with_used(100),
            BackendSpec::bounded("b", 1000).with_used(850),
            BackendSpec::bounded("c", 500),
        ]);
        // a has 900 free, c has 500, b is over the soft threshold
        assert_eq!(f.engine.place(10, NodeCategory::Storage).unwrap(), "a");
    }

    #[test]
    fn test_place_tie_breaks_on_smallest_id() {
        let f = fixture(&[BackendSpec::bounded("zeta", 100), BackendSpec::bounded("alpha", 100)]);
        assert_eq!(f.engine.place(10, NodeCategory::Operational).unwrap(), "alpha");
    }

    #[test]
    fn test_place_falls_back_over_soft_threshold() {
        let f = fixture(&[
            BackendSpec::bounded("a", 100).with_used(85),
            BackendSpec::bounded("b", 100).with_used(95),
        ]);
        assert_eq!(f.engine.place(10, NodeCategory::Storage).unwrap(), "a");
    }

    #[test]
    fn test_place_no_capacity() {
        let f = fixture(&[BackendSpec::bounded("a", 100).with_used(95)]);
        assert_eq!(
            f.engine.place(10, NodeCategory::Storage).unwrap_err(),
            AtlasError::NoCapacity { requested: 10 }
        );
    }

    #[test]
    fn test_place_skips_non_active_and_excluded() {
        let f = fixture(&[
            BackendSpec::bounded("a", 1000),
            BackendSpec::bounded("b", 900),
            BackendSpec::unbounded("gh"),
        ]);
        f.registry.mark_status("gh", BackendStatus::Error).unwrap();
        let chosen = f
            .engine
            .place_excluding(10, NodeCategory::Backup, &["a".to_string()])
            .unwrap();
        assert_eq!(chosen, "b");
    }

    #[tokio::test]
    async fn test_write_slot_seals_for_untrusted_backend() {
        let f = fixture(&[BackendSpec::bounded("a", 10_000)]);
        let receipt = f
            .engine
            .write_slot(NodeCategory::Operational, "cfg", b"plain".to_vec())
            .await
            .unwrap();
        assert!(receipt.persisted);

        let node = f.engine.node(&receipt.node_id).unwrap();
        assert!(node.encrypted);
        let raw = f.adapters["a"].object(&node.path()).unwrap();
        assert_ne!(raw, b"plain");
        assert_eq!(f.registry.get("a").unwrap().used_bytes, raw.len() as u64);

        let back = f.engine.read_slot(NodeCategory::Operational, "cfg").await.unwrap();
        assert_eq!(back, b"plain");
    }

    #[tokio::test]
    async fn test_rewrite_charges_only_the_delta() {
        let f = fixture(&[BackendSpec::bounded("a", 10_000).trusted()]);
        let first = f
            .engine
            .write_slot(NodeCategory::Storage, "s", vec![0u8; 100])
            .await
            .unwrap();
        let second = f
            .engine
            .write_slot(NodeCategory::Storage, "s", vec![0u8; 40])
            .await
            .unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(f.registry.get("a").unwrap().used_bytes, 40);
    }

    #[tokio::test]
    async fn test_saturating_write_migrates_node() {
        let f = fixture(&[
            BackendSpec::bounded("A", 100).with_used(92).trusted(),
            BackendSpec::bounded("B", 1000).trusted(),
        ]);
        let id = f.engine.ensure_node(NodeCategory::Storage, "grid", "A").unwrap();

        let receipt = f
            .engine
            .write_slot(NodeCategory::Storage, "grid", vec![7u8; 10])
            .await
            .unwrap();

        assert_eq!(
            receipt.migration,
            Some(MigrationOutcome::Migrated { from: "A".into(), to: "B".into(), bytes: 10 })
        );
        assert_eq!(receipt.backend_id, "B");

        let node = f.engine.node(&id).unwrap();
        assert_eq!(node.backend_id, "B");
        let a = f.registry.get("A").unwrap();
        assert_eq!(a.used_bytes, 92);
        assert_eq!(a.status, BackendStatus::Full);
        assert_eq!(f.registry.get("B").unwrap().used_bytes, 10);
        assert!(f.adapters["A"].object(&node.path()).is_none());
        assert_eq!(f.adapters["B"].object(&node.path()).unwrap(), vec![7u8; 10]);
    }

    #[tokio::test]
    async fn test_no_target_leaves_node_pending_then_retries() {
        let f = fixture(&[
            BackendSpec::bounded("A", 100).with_used(85).trusted(),
            BackendSpec::bounded("B", 100).with_used(85).trusted(),
        ]);
        f.engine.ensure_node(NodeCategory::Storage, "grid", "A").unwrap();

        let receipt = f
            .engine
            .write_slot(NodeCategory::Storage, "grid", vec![1u8; 10])
            .await
            .unwrap();
        assert_eq!(receipt.migration, Some(MigrationOutcome::Pending));
        assert_eq!(receipt.backend_id, "A");
        assert_eq!(f.engine.pending_migrations(), 1);
        assert_eq!(f.registry.get("A").unwrap().status, BackendStatus::Full);

        // B frees space; the next sync pass moves the node
        f.registry.record_usage("B", -85).unwrap();
        let report = f.engine.sync_dirty().await;
        assert_eq!(report.migrated, 1);
        assert_eq!(report.still_pending, 0);
        assert_eq!(
            f.engine.slot_node(NodeCategory::Storage, "grid").unwrap().backend_id,
            "B"
        );
    }

    #[tokio::test]
    async fn test_growing_write_on_full_backend_without_room_is_no_capacity() {
        let f = fixture(&[
            BackendSpec::bounded("A", 100).with_used(85).trusted(),
            BackendSpec::bounded("B", 100).with_used(85).trusted(),
        ]);
        f.engine.ensure_node(NodeCategory::Storage, "x", "A").unwrap();
        f.engine
            .write_slot(NodeCategory::Storage, "x", vec![1u8; 10])
            .await
            .unwrap();
        assert_eq!(f.registry.get("A").unwrap().status, BackendStatus::Full);

        let id = f.engine.ensure_node(NodeCategory::Storage, "y", "A").unwrap();
        let err = f
            .engine
            .write_slot(NodeCategory::Storage, "y", vec![2u8; 500])
            .await
            .unwrap_err();
        assert!(matches!(err, AtlasError::NoCapacity { .. }));

        let path = f.engine.node(&id).unwrap().path();
        assert!(f.adapters["A"].object(&path).is_none());
        assert_eq!(f.engine.local_payload(NodeCategory::Storage, "y").unwrap(), Vec::<u8>::new());
        assert_eq!(f.registry.get("A").unwrap().used_bytes, 95);

        f.engine.sync_dirty().await;
        assert!(f.registry.get("A").unwrap().used_bytes <= 100);
        assert!(f.registry.get("B").unwrap().used_bytes <= 100);
    }

    #[tokio::test]
    async fn test_growing_write_on_full_backend_relocates() {
        let f = fixture(&[
            BackendSpec::bounded("A", 100).with_used(50).trusted(),
            BackendSpec::bounded("C", 1000).trusted(),
        ]);
        f.registry.mark_status("A", BackendStatus::Full).unwrap();
        let id = f.engine.ensure_node(NodeCategory::Storage, "y", "A").unwrap();

        let receipt = f
            .engine
            .write_slot(NodeCategory::Storage, "y", vec![3u8; 30])
            .await
            .unwrap();
        assert!(receipt.persisted);
        assert_eq!(receipt.backend_id, "C");
        assert_eq!(
            receipt.migration,
            Some(MigrationOutcome::Migrated { from: "A".into(), to: "C".into(), bytes: 30 })
        );

        let a = f.registry.get("A").unwrap();
        assert_eq!(a.used_bytes, 50);
        assert_eq!(a.status, BackendStatus::Active);
        assert_eq!(f.registry.get("C").unwrap().used_bytes, 30);
        let path = f.engine.node(&id).unwrap().path();
        assert_eq!(f.adapters["C"].object(&path).unwrap(), vec![3u8; 30]);
    }

    #[tokio::test]
    async fn test_unreachable_backend_keeps_node_dirty() {
        let f = fixture(&[BackendSpec::bounded("a", 10_000)]);
        f.adapters["a"].set_offline(true);

        let receipt = f
            .engine
            .write_slot(NodeCategory::Execution, "run", b"x".to_vec())
            .await
            .unwrap();
        assert!(!receipt.persisted);
        assert_eq!(f.engine.dirty_count(), 1);
        assert_eq!(f.registry.get("a").unwrap().status, BackendStatus::Error);
        assert_eq!(f.engine.local_payload(NodeCategory::Execution, "run").unwrap(), b"x");

        f.adapters["a"].set_offline(false);
        let report = f.engine.sync_dirty().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(f.engine.dirty_count(), 0);
        assert_eq!(f.registry.get("a").unwrap().status, BackendStatus::Active);
    }

    #[tokio::test]
    async fn test_corrupted_node_fails_integrity() {
        let f = fixture(&[BackendSpec::bounded("a", 10_000)]);
        let receipt = f
            .engine
            .write_slot(NodeCategory::Backup, "b", b"secret".to_vec())
            .await
            .unwrap();
        let path = f.engine.node(&receipt.node_id).unwrap().path();
        assert!(f.adapters["a"].corrupt(&path, 200));

        let err = f.engine.read_slot(NodeCategory::Backup, "b").await.unwrap_err();
        assert!(matches!(err, AtlasError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_adopt_nodes_keeps_newer() {
        let f = fixture(&[BackendSpec::bounded("a", 10_000)]);
        let mut old = MemoryNode::new("n-old".into(), NodeCategory::Storage, "s".into(), "a".into());
        old.last_update_at = 10;
        let mut newer = old.clone();
        newer.id = "n-new".into();
        newer.last_update_at = 20;
        let stray = MemoryNode::new("n-x".into(), NodeCategory::Storage, "t".into(), "gone".into());

        assert_eq!(f.engine.adopt_nodes(vec![newer.clone(), old, stray]), 1);
        assert_eq!(f.engine.slot_node(NodeCategory::Storage, "s").unwrap().id, "n-new");
        assert_eq!(f.engine.node_manifest().len(), 1);
    }
}
