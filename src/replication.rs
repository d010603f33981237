// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication manager: fans critical payloads out to distinct backends.
//!
//! Each logical key maps to a [`ReplicationSet`]. A round reuses the
//! previous round's copies where their backend is still Active and has room
//! for the new payload, and asks placement for the rest, never picking a
//! backend twice. Every copy is sealed with its own data key. A failed copy
//! does not roll back the others; it stays Pending and the set is retried on
//! node sync.
//!
//! A copy dropped from its set is deleted and its bytes released. When the
//! delete cannot reach the backend the copy is parked as stale: it is
//! overwritten in place if the backend is chosen again, and deleted on a
//! later node sync otherwise. Backend usage always matches the objects held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::EncryptionGate;
use crate::error::AtlasError;
use crate::metrics;
use crate::node::{derive_node_id, NodeCategory};
use crate::placement::PlacementEngine;
use crate::registry::BackendRegistry;
use crate::storage::layout;
use crate::storage::BackendGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyState {
    Stored,
    /// Last write failed; retried on the next node sync
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCopy {
    pub backend_id: String,
    pub node_id: String,
    pub path: String,
    /// Bytes charged to the backend for this copy
    pub stored_bytes: u64,
    pub state: CopyState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSet {
    pub logical_key: String,
    pub copies: Vec<ReplicaCopy>,
    /// Copies asked for in the last round: min(factor, active backends)
    pub target: usize,
    /// Fewer stored copies than the replication factor
    pub under_replicated: bool,
    pub updated_at: i64,
}

impl ReplicationSet {
    #[must_use]
    pub fn stored_copies(&self) -> usize {
        self.copies.iter().filter(|c| c.state == CopyState::Stored).count()
    }

    #[must_use]
    pub fn pending_copies(&self) -> usize {
        self.copies.len() - self.stored_copies()
    }

    /// No two copies share a backend.
    #[must_use]
    pub fn is_diverse(&self) -> bool {
        let mut ids: Vec<&str> = self.copies.iter().map(|c| c.backend_id.as_str()).collect();
        ids.sort_unstable();
        ids.windows(2).all(|w| w[0] != w[1])
    }

    /// Soft warning for an under-replicated set.
    #[must_use]
    pub fn warning(&self, required: usize) -> Option<AtlasError> {
        self.under_replicated.then(|| AtlasError::UnderReplicated {
            key: self.logical_key.clone(),
            copies: self.stored_copies(),
            required,
        })
    }
}

pub struct ReplicationManager {
    registry: Arc<BackendRegistry>,
    gateway: Arc<BackendGateway>,
    gate: Arc<EncryptionGate>,
    placement: Arc<PlacementEngine>,
    min_factor: usize,
    sets: DashMap<String, ReplicationSet>,
    /// Latest payload per key, kept for retries
    payloads: DashMap<String, Arc<Vec<u8>>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Dropped copies still charged to their backend, by (key, backend)
    stale: DashMap<(String, String), ReplicaCopy>,
    seq: AtomicU64,
}

impl ReplicationManager {
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        gateway: Arc<BackendGateway>,
        gate: Arc<EncryptionGate>,
        placement: Arc<PlacementEngine>,
        min_factor: usize,
    ) -> Self {
        Self {
            registry,
            gateway,
            gate,
            placement,
            min_factor,
            sets: DashMap::new(),
            payloads: DashMap::new(),
            locks: DashMap::new(),
            stale: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn min_factor(&self) -> usize {
        self.min_factor
    }

    /// Write `payload` to `min(factor, active)` distinct backends.
    ///
    /// Under-replication is reported on the returned set, not as an error.
    /// Fails with `NoCapacity` only when not a single backend could be chosen.
    #[tracing::instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn replicate(&self, logical_key: &str, payload: Vec<u8>) -> Result<ReplicationSet, AtlasError> {
        let lock = self.key_lock(logical_key);
        let _guard = lock.lock().await;

        let payload = Arc::new(payload);
        self.payloads.insert(logical_key.to_string(), payload.clone());
        self.round(logical_key, &payload).await
    }

    /// Re-run every set with pending copies or too few copies.
    ///
    /// Returns (sets retried, sets still under-replicated).
    pub async fn retry_pending(&self) -> (usize, usize) {
        let degraded: Vec<String> = self
            .sets
            .iter()
            .filter(|s| s.under_replicated || s.pending_copies() > 0)
            .map(|s| s.logical_key.clone())
            .collect();

        let mut retried = 0;
        for key in degraded {
            let lock = self.key_lock(&key);
            let _guard = lock.lock().await;
            let Some(payload) = self.payloads.get(&key).map(|p| p.value().clone()) else {
                continue;
            };
            match self.round(&key, &payload).await {
                Ok(_) => retried += 1,
                Err(e) => warn!(key = %key, error = %e, "Replication retry failed"),
            }
        }

        self.release_stale().await;

        let still_under = self.under_replicated_count();
        metrics::set_under_replicated_sets(still_under);
        (retried, still_under)
    }

    /// Delete parked copies whose backend is Active again.
    ///
    /// Returns how many were released.
    pub async fn release_stale(&self) -> usize {
        let parked: Vec<(String, String)> = self.stale.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for (key, backend_id) in parked {
            let reachable = self
                .registry
                .get(&backend_id)
                .map(|b| b.is_active())
                .unwrap_or(false);
            if !reachable {
                continue;
            }
            let lock = self.key_lock(&key);
            let _guard = lock.lock().await;
            let Some((_, copy)) = self.stale.remove(&(key.clone(), backend_id)) else {
                continue;
            };
            if self.retire(&key, copy).await {
                released += 1;
            }
        }
        released
    }

    /// Copies parked after a failed delete.
    #[must_use]
    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    /// Register copies found on backends at restore time. No I/O.
    pub fn adopt_copies(&self, logical_key: &str, payload: Vec<u8>, found: Vec<(String, u64)>) {
        let copies: Vec<ReplicaCopy> = found
            .into_iter()
            .map(|(backend_id, stored_bytes)| {
                let node_id = self.copy_id(&backend_id);
                ReplicaCopy {
                    path: layout::replica_path(logical_key, &node_id),
                    backend_id,
                    node_id,
                    stored_bytes,
                    state: CopyState::Stored,
                }
            })
            .collect();
        let set = ReplicationSet {
            logical_key: logical_key.to_string(),
            under_replicated: copies.len() < self.min_factor,
            target: copies.len(),
            copies,
            updated_at: crate::now_millis(),
        };
        self.payloads.insert(logical_key.to_string(), Arc::new(payload));
        self.sets.insert(logical_key.to_string(), set);
    }

    #[must_use]
    pub fn set(&self, logical_key: &str) -> Option<ReplicationSet> {
        self.sets.get(logical_key).map(|s| s.value().clone())
    }

    /// Every set, ordered by key.
    #[must_use]
    pub fn sets(&self) -> Vec<ReplicationSet> {
        let mut sets: Vec<ReplicationSet> = self.sets.iter().map(|s| s.value().clone()).collect();
        sets.sort_by(|a, b| a.logical_key.cmp(&b.logical_key));
        sets
    }

    #[must_use]
    pub fn under_replicated_count(&self) -> usize {
        self.sets.iter().filter(|s| s.under_replicated).count()
    }

    async fn round(&self, logical_key: &str, payload: &[u8]) -> Result<ReplicationSet, AtlasError> {
        let target = self.min_factor.min(self.registry.active_count());
        let estimate = payload.len() as u64 + EncryptionGate::overhead() as u64;

        // Reuse copies whose backend is Active and can take the growth
        let mut chosen: Vec<ReplicaCopy> = Vec::new();
        let mut dropped: Vec<ReplicaCopy> = Vec::new();
        for copy in self.set(logical_key).map(|s| s.copies).unwrap_or_default() {
            let keep = chosen.len() < target
                && self
                    .registry
                    .get(&copy.backend_id)
                    .map(|b| b.is_active() && b.fits(estimate.saturating_sub(copy.stored_bytes)))
                    .unwrap_or(false);
            if keep {
                chosen.push(copy);
            } else {
                dropped.push(copy);
            }
        }
        for copy in dropped {
            self.retire(logical_key, copy).await;
        }

        while chosen.len() < target {
            let exclude: Vec<String> = chosen.iter().map(|c| c.backend_id.clone()).collect();
            match self.placement.place_excluding(estimate, NodeCategory::Backup, &exclude) {
                Ok(backend_id) => {
                    let parked = self
                        .stale
                        .remove(&(logical_key.to_string(), backend_id.clone()))
                        .map(|(_, copy)| copy);
                    let copy = parked.unwrap_or_else(|| {
                        let node_id = self.copy_id(&backend_id);
                        ReplicaCopy {
                            path: layout::replica_path(logical_key, &node_id),
                            backend_id,
                            node_id,
                            stored_bytes: 0,
                            state: CopyState::Pending,
                        }
                    });
                    chosen.push(copy);
                }
                Err(_) => break,
            }
        }

        if chosen.is_empty() {
            metrics::record_replication(logical_key, "failed", 0);
            return Err(AtlasError::NoCapacity { requested: estimate });
        }

        for copy in &mut chosen {
            self.write_copy(copy, payload).await;
        }

        let mut set = ReplicationSet {
            logical_key: logical_key.to_string(),
            copies: chosen,
            target,
            under_replicated: false,
            updated_at: crate::now_millis(),
        };
        set.under_replicated = set.stored_copies() < self.min_factor;

        let stored = set.stored_copies();
        if set.under_replicated {
            metrics::record_replication(logical_key, "degraded", stored);
            warn!(
                key = %logical_key,
                copies = stored,
                required = self.min_factor,
                active = self.registry.active_count(),
                "Replication set is under-replicated"
            );
        } else {
            metrics::record_replication(logical_key, "full", stored);
            debug!(key = %logical_key, copies = stored, "Replicated");
        }

        self.sets.insert(logical_key.to_string(), set.clone());
        metrics::set_under_replicated_sets(self.under_replicated_count());
        Ok(set)
    }

    async fn write_copy(&self, copy: &mut ReplicaCopy, payload: &[u8]) {
        let sealed = match self.gate.seal(payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(backend = %copy.backend_id, error = %e, "Sealing replica failed");
                copy.state = CopyState::Pending;
                return;
            }
        };

        match self.gateway.write(&copy.backend_id, &copy.path, &sealed).await {
            Ok(()) => {
                let stored = sealed.len() as u64;
                let delta = stored as i64 - copy.stored_bytes as i64;
                copy.stored_bytes = stored;
                copy.state = CopyState::Stored;
                self.registry.touch_sync(&copy.backend_id, crate::now_millis());
                match self.registry.record_usage(&copy.backend_id, delta) {
                    Ok(update) if update.became_full() => {
                        info!(backend = %copy.backend_id, "Replica write filled backend");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(backend = %copy.backend_id, error = %e, "Usage not recorded"),
                }
            }
            Err(e) => {
                warn!(backend = %copy.backend_id, path = %copy.path, error = %e, "Replica copy failed");
                copy.state = CopyState::Pending;
            }
        }
    }

    /// Delete a copy that left its set and release its bytes. Parks it as
    /// stale when the backend cannot be reached. Returns whether it was
    /// released.
    async fn retire(&self, logical_key: &str, copy: ReplicaCopy) -> bool {
        if copy.stored_bytes == 0 {
            return true;
        }
        match self.gateway.delete(&copy.backend_id, &copy.path).await {
            Ok(()) | Err(AtlasError::NotFound(_)) => {
                if let Err(e) = self
                    .registry
                    .record_usage(&copy.backend_id, -(copy.stored_bytes as i64))
                {
                    warn!(backend = %copy.backend_id, error = %e, "Usage not released");
                }
                debug!(key = %logical_key, backend = %copy.backend_id, bytes = copy.stored_bytes, "Released dropped replica");
                true
            }
            Err(e) => {
                debug!(key = %logical_key, backend = %copy.backend_id, error = %e, "Dropped replica parked as stale");
                self.stale
                    .insert((logical_key.to_string(), copy.backend_id.clone()), copy);
                false
            }
        }
    }

    fn copy_id(&self, backend_id: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        derive_node_id(backend_id, NodeCategory::Backup, crate::now_millis(), seq)
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSpec;
    use crate::registry::BackendStatus;
    use crate::storage::{BackendAdapter, InMemoryAdapter};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        manager: ReplicationManager,
        registry: Arc<BackendRegistry>,
        gate: Arc<EncryptionGate>,
        adapters: HashMap<String, Arc<InMemoryAdapter>>,
    }

    fn fixture(ids: &[&str], factor: usize) -> Fixture {
        let specs: Vec<BackendSpec> = ids.iter().map(|id| BackendSpec::bounded(id, 1 << 20)).collect();
        fixture_with(&specs, factor)
    }

    fn fixture_with(specs: &[BackendSpec], factor: usize) -> Fixture {
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
        let gate = Arc::new(EncryptionGate::new([3u8; 32]));
        let placement = Arc::new(PlacementEngine::new(
            registry.clone(),
            gateway.clone(),
            gate.clone(),
            0.8,
            2.0,
        ));
        Fixture {
            manager: ReplicationManager::new(registry.clone(), gateway, gate.clone(), placement, factor),
            registry,
            gate,
            adapters,
        }
    }

    #[tokio::test]
    async fn test_replicates_to_distinct_backends() {
        let f = fixture(&["a", "b", "c", "d"], 3);
        let set = f.manager.replicate("memory-state", b"state".to_vec()).await.unwrap();

        assert_eq!(set.copies.len(), 3);
        assert_eq!(set.stored_copies(), 3);
        assert!(set.is_diverse());
        assert!(!set.under_replicated);
        assert!(set.warning(3).is_none());

        for copy in &set.copies {
            let raw = f.adapters[&copy.backend_id].object(&copy.path).unwrap();
            assert_eq!(f.gate.open(&raw).unwrap(), b"state");
            assert_eq!(f.registry.get(&copy.backend_id).unwrap().used_bytes, raw.len() as u64);
        }
    }

    #[tokio::test]
    async fn test_two_backends_factor_three_is_under_replicated() {
        let f = fixture(&["a", "b"], 3);
        let set = f.manager.replicate("snapshot", b"s".to_vec()).await.unwrap();

        assert_eq!(set.copies.len(), 2);
        assert!(set.under_replicated);
        assert!(set.is_diverse());
        assert_eq!(
            set.warning(3),
            Some(AtlasError::UnderReplicated { key: "snapshot".into(), copies: 2, required: 3 })
        );
        for copy in &set.copies {
            assert_eq!(copy.path, layout::SNAPSHOT_PATH);
        }
        assert_eq!(f.manager.under_replicated_count(), 1);
    }

    #[tokio::test]
    async fn test_rewrites_in_place_and_charges_delta() {
        let f = fixture(&["a", "b", "c"], 3);
        let first = f.manager.replicate("k", vec![0u8; 100]).await.unwrap();
        let second = f.manager.replicate("k", vec![0u8; 50]).await.unwrap();

        let ids = |s: &ReplicationSet| s.copies.iter().map(|c| c.node_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        let expected = 50 + EncryptionGate::overhead() as u64;
        for id in ["a", "b", "c"] {
            assert_eq!(f.registry.get(id).unwrap().used_bytes, expected);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_good_copies_and_retries() {
        let f = fixture(&["a", "b", "c"], 3);
        f.adapters["b"].set_offline(true);

        let set = f.manager.replicate("k", b"v".to_vec()).await.unwrap();
        assert_eq!(set.stored_copies(), 2);
        assert_eq!(set.pending_copies(), 1);
        assert!(set.under_replicated);
        assert_eq!(f.registry.get("b").unwrap().status, BackendStatus::Error);

        f.adapters["b"].set_offline(false);
        f.registry.record_success("b");
        let (retried, still_under) = f.manager.retry_pending().await;
        assert_eq!((retried, still_under), (1, 0));
        let set = f.manager.set("k").unwrap();
        assert_eq!(set.stored_copies(), 3);
        assert!(set.is_diverse());
    }

    fn held_bytes(adapter: &InMemoryAdapter) -> u64 {
        adapter
            .paths()
            .iter()
            .filter_map(|p| adapter.object(p))
            .map(|o| o.len() as u64)
            .sum()
    }

    #[tokio::test]
    async fn test_backend_rejoining_set_is_charged_once() {
        let f = fixture(&["a", "b", "c"], 3);
        f.manager.replicate(layout::SNAPSHOT_KEY, vec![0u8; 100]).await.unwrap();
        let copy_len = 100 + EncryptionGate::overhead() as u64;
        assert_eq!(f.registry.get("a").unwrap().used_bytes, copy_len);

        f.registry.mark_status("a", BackendStatus::Error).unwrap();
        let set = f.manager.replicate(layout::SNAPSHOT_KEY, vec![0u8; 100]).await.unwrap();
        assert_eq!(set.copies.len(), 2);
        assert!(set.copies.iter().all(|c| c.backend_id != "a"));

        f.registry.record_success("a");
        f.manager.retry_pending().await;

        let set = f.manager.set(layout::SNAPSHOT_KEY).unwrap();
        assert_eq!(set.stored_copies(), 3);
        for id in ["a", "b", "c"] {
            let used = f.registry.get(id).unwrap().used_bytes;
            assert_eq!(used, copy_len, "backend {}", id);
            assert_eq!(used, held_bytes(&f.adapters[id]), "backend {}", id);
        }
    }

    #[tokio::test]
    async fn test_unreachable_dropped_copy_is_parked_then_reused() {
        let f = fixture(&["a", "b", "c"], 3);
        f.manager.replicate("k", vec![1u8; 40]).await.unwrap();
        let copy_len = 40 + EncryptionGate::overhead() as u64;

        f.adapters["a"].set_offline(true);
        f.registry.mark_status("a", BackendStatus::Error).unwrap();
        f.manager.replicate("k", vec![1u8; 40]).await.unwrap();
        assert_eq!(f.manager.stale_count(), 1);
        assert_eq!(f.registry.get("a").unwrap().used_bytes, copy_len);

        f.adapters["a"].set_offline(false);
        f.registry.record_success("a");
        let (retried, still_under) = f.manager.retry_pending().await;
        assert_eq!((retried, still_under), (1, 0));
        assert_eq!(f.manager.stale_count(), 0);

        assert_eq!(f.adapters["a"].len(), 1);
        assert_eq!(f.registry.get("a").unwrap().used_bytes, copy_len);
        assert_eq!(held_bytes(&f.adapters["a"]), copy_len);
    }

    #[tokio::test]
    async fn test_stale_copy_released_when_backend_not_chosen_again() {
        let f = fixture(&["a", "b", "c", "d"], 3);
        let first = f.manager.replicate("k", vec![1u8; 40]).await.unwrap();
        let lost = first.copies[0].backend_id.clone();

        f.adapters[&lost].set_offline(true);
        f.registry.mark_status(&lost, BackendStatus::Error).unwrap();
        let second = f.manager.replicate("k", vec![1u8; 40]).await.unwrap();
        assert_eq!(second.stored_copies(), 3);
        assert_eq!(f.manager.stale_count(), 1);

        f.adapters[&lost].set_offline(false);
        f.registry.record_success(&lost);
        f.manager.retry_pending().await;

        assert_eq!(f.manager.stale_count(), 0);
        assert!(f.adapters[&lost].is_empty());
        assert_eq!(f.registry.get(&lost).unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_reused_copy_without_room_moves_elsewhere() {
        let f = fixture_with(&[BackendSpec::bounded("a", 400), BackendSpec::bounded("b", 1000)], 1);
        f.registry.mark_status("b", BackendStatus::Error).unwrap();
        let first = f.manager.replicate("k", vec![0u8; 10]).await.unwrap();
        assert_eq!(first.copies[0].backend_id, "a");

        f.registry.record_success("b");
        let second = f.manager.replicate("k", vec![0u8; 300]).await.unwrap();
        assert_eq!(second.copies.len(), 1);
        assert_eq!(second.copies[0].backend_id, "b");

        let a = f.registry.get("a").unwrap();
        assert_eq!(a.used_bytes, 0);
        assert!(f.adapters["a"].is_empty());
        let b = f.registry.get("b").unwrap();
        assert_eq!(b.used_bytes, 300 + EncryptionGate::overhead() as u64);
        assert_eq!(b.used_bytes, held_bytes(&f.adapters["b"]));
    }

    #[tokio::test]
    async fn test_no_active_backend_is_no_capacity() {
        let f = fixture(&["a"], 3);
        f.registry.mark_status("a", BackendStatus::Error).unwrap();
        let err = f.manager.replicate("k", b"v".to_vec()).await.unwrap_err();
        assert!(matches!(err, AtlasError::NoCapacity { .. }));
    }

    #[test]
    fn test_adopt_copies() {
        let f = fixture(&["a", "b"], 3);
        f.manager.adopt_copies(
            layout::SNAPSHOT_KEY,
            b"restored".to_vec(),
            vec![("a".into(), 10), ("b".into(), 10)],
        );
        let set = f.manager.set(layout::SNAPSHOT_KEY).unwrap();
        assert_eq!(set.stored_copies(), 2);
        assert!(set.under_replicated);
    }
}
