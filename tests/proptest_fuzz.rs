//! Property-based tests (fuzzing) for the storage orchestrator.
//!
//! Uses proptest to generate random payloads, usage deltas and backend
//! catalogs, and checks that the sealing, accounting and placement rules
//! hold for all of them without panicking.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Map, Value};
use tokio::sync::watch;

use atlas_storage::placement::PlacementEngine;
use atlas_storage::registry::BackendRegistry;
use atlas_storage::replication::ReplicationManager;
use atlas_storage::snapshot::StateSnapshot;
use atlas_storage::storage::{layout, BackendGateway};
use atlas_storage::{
    AtlasConfig, BackendAdapter, BackendSpec, BackendStatus, EncryptionGate, GateError,
    InMemoryAdapter, NodeCategory, Orchestrator,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn master_key_strategy() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

/// Scalar JSON leaves for partial updates
fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[a-z0-9 ]{0,16}".prop_map(Value::String),
    ]
}

/// A partial update: small object over a narrow key space so keys collide
fn partial_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-e]", leaf_strategy(), 0..4)
        .prop_map(|m| m.into_iter().collect())
}

/// A bounded backend with some usage already recorded
fn backend_strategy() -> impl Strategy<Value = (u64, u64, bool)> {
    (1u64..10_000, 0u64..10_000, any::<bool>())
        .prop_map(|(capacity, used, unbounded)| (capacity, used.min(capacity), unbounded))
}

/// One step of a storage workload
#[derive(Debug, Clone)]
enum StorageOp {
    Write { slot: u8, size: usize },
    Replicate { key: u8, size: usize },
    Fail(u8),
    Heal(u8),
}

fn storage_op_strategy() -> impl Strategy<Value = StorageOp> {
    prop_oneof![
        4 => (0u8..4, 0usize..600).prop_map(|(slot, size)| StorageOp::Write { slot, size }),
        3 => (0u8..3, 0usize..600).prop_map(|(key, size)| StorageOp::Replicate { key, size }),
        1 => any::<u8>().prop_map(StorageOp::Fail),
        1 => any::<u8>().prop_map(StorageOp::Heal),
    ]
}

const REPLICATED_KEYS: [&str; 3] = [layout::SNAPSHOT_KEY, "memory-state", "manifest"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Encryption gate
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_seal_open_roundtrip(
        key in master_key_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let gate = EncryptionGate::new(key);
        let sealed = gate.seal(&payload).unwrap();
        prop_assert_eq!(sealed.len(), payload.len() + EncryptionGate::overhead());
        prop_assert_eq!(gate.open(&sealed).unwrap(), payload);
    }

    #[test]
    fn prop_any_bit_flip_fails_closed(
        payload in prop::collection::vec(any::<u8>(), 0..256),
        bit in any::<prop::sample::Index>(),
    ) {
        let gate = EncryptionGate::new([9u8; 32]);
        let mut sealed = gate.seal(&payload).unwrap();
        let bit = bit.index(sealed.len() * 8);
        sealed[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(matches!(gate.open(&sealed), Err(GateError::Integrity(_))));
    }

    #[test]
    fn prop_open_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let gate = EncryptionGate::new([3u8; 32]);
        prop_assert!(gate.open(&bytes).is_err());
    }

    #[test]
    fn prop_seal_is_randomized(payload in prop::collection::vec(any::<u8>(), 1..128)) {
        let gate = EncryptionGate::new([5u8; 32]);
        let a = gate.seal(&payload).unwrap();
        let b = gate.seal(&payload).unwrap();
        prop_assert_ne!(a, b, "fresh data key and nonce per seal");
    }
}

// =============================================================================
// Registry accounting
// =============================================================================

proptest! {
    #[test]
    fn prop_usage_follows_saturating_model(
        capacity in 1u64..100_000,
        deltas in prop::collection::vec(-50_000i64..50_000, 0..40),
    ) {
        let registry = BackendRegistry::new(&[BackendSpec::bounded("x", capacity)], 0.9);
        let mut used: u64 = 0;
        let mut status = BackendStatus::Active;

        for delta in deltas {
            let update = registry.record_usage("x", delta).unwrap();
            used = if delta >= 0 {
                used.saturating_add(delta as u64)
            } else {
                used.saturating_sub(delta.unsigned_abs())
            };
            let crossed = delta > 0
                && status == BackendStatus::Active
                && used as f64 / capacity as f64 > 0.9;
            if crossed {
                status = BackendStatus::Full;
            }
            prop_assert_eq!(update.became_full(), crossed);
            prop_assert_eq!(update.backend.used_bytes, used);
            prop_assert_eq!(update.backend.status, status);
        }
    }

    #[test]
    fn prop_unbounded_never_fills(deltas in prop::collection::vec(0i64..i64::MAX / 64, 0..20)) {
        let registry = BackendRegistry::new(&[BackendSpec::unbounded("gh")], 0.9);
        for delta in deltas {
            let update = registry.record_usage("gh", delta).unwrap();
            prop_assert!(!update.became_full());
            prop_assert_eq!(update.backend.status, BackendStatus::Active);
        }
    }
}

// =============================================================================
// Placement
// =============================================================================

proptest! {
    #[test]
    fn prop_placement_respects_capacity_and_preference(
        backends in prop::collection::vec(backend_strategy(), 1..8),
        size in 0u64..5_000,
    ) {
        let specs: Vec<BackendSpec> = backends
            .iter()
            .enumerate()
            .map(|(i, (capacity, used, unbounded))| {
                let id = format!("b{}", i);
                if *unbounded {
                    BackendSpec::unbounded(&id).with_used(*used)
                } else {
                    BackendSpec::bounded(&id, *capacity).with_used(*used)
                }
            })
            .collect();
        let registry = Arc::new(BackendRegistry::new(&specs, 0.9));
        let adapters: HashMap<String, Arc<dyn BackendAdapter>> = specs
            .iter()
            .map(|s| (s.id.clone(), Arc::new(InMemoryAdapter::new()) as Arc<dyn BackendAdapter>))
            .collect();
        let gateway = Arc::new(
            BackendGateway::new(registry.clone(), adapters, Duration::from_secs(1)).unwrap(),
        );
        let engine = PlacementEngine::new(
            registry.clone(),
            gateway,
            Arc::new(EncryptionGate::new([0u8; 32])),
            0.8,
            2.0,
        );

        let all = registry.list();
        let fitting: Vec<_> = all.iter().filter(|b| b.fits(size)).collect();
        match engine.place(size, NodeCategory::Storage) {
            Ok(id) => {
                let chosen = registry.get(&id).unwrap();
                prop_assert!(chosen.fits(size));
                let preferred: Vec<_> = fitting.iter().filter(|b| b.utilization() < 0.8).collect();
                let pool: Vec<_> = if preferred.is_empty() {
                    fitting.iter().collect()
                } else {
                    preferred
                };
                for other in pool {
                    prop_assert!(other.available_bytes() <= chosen.available_bytes());
                }
            }
            Err(_) => prop_assert!(fitting.is_empty()),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_usage_matches_held_objects_and_never_exceeds_capacity(
        backends in prop::collection::vec((300u64..4_000, any::<bool>()), 2..5),
        ops in prop::collection::vec(storage_op_strategy(), 1..40),
    ) {
        let specs: Vec<BackendSpec> = backends
            .iter()
            .enumerate()
            .map(|(i, (capacity, trusted))| {
                let spec = BackendSpec::bounded(&format!("b{}", i), *capacity);
                if *trusted { spec.trusted() } else { spec }
            })
            .collect();
        let registry = Arc::new(BackendRegistry::new(&specs, 0.9));
        let adapters: HashMap<String, Arc<InMemoryAdapter>> = specs
            .iter()
            .map(|s| (s.id.clone(), Arc::new(InMemoryAdapter::new())))
            .collect();
        let dyn_adapters: HashMap<String, Arc<dyn BackendAdapter>> = adapters
            .iter()
            .map(|(id, a)| (id.clone(), a.clone() as Arc<dyn BackendAdapter>))
            .collect();
        let gateway = Arc::new(
            BackendGateway::new(registry.clone(), dyn_adapters, Duration::from_secs(1)).unwrap(),
        );
        let gate = Arc::new(EncryptionGate::new([7u8; 32]));
        let placement = Arc::new(PlacementEngine::new(
            registry.clone(),
            gateway.clone(),
            gate.clone(),
            0.8,
            2.0,
        ));
        let replication = ReplicationManager::new(registry.clone(), gateway, gate, placement.clone(), 2);

        let rt = runtime();
        for op in ops {
            rt.block_on(async {
                match op {
                    StorageOp::Write { slot, size } => {
                        let _ = placement
                            .write_slot(NodeCategory::Storage, &format!("s{}", slot), vec![slot; size])
                            .await;
                    }
                    StorageOp::Replicate { key, size } => {
                        let _ = replication
                            .replicate(REPLICATED_KEYS[key as usize], vec![key; size])
                            .await;
                    }
                    StorageOp::Fail(i) => {
                        let id = &specs[i as usize % specs.len()].id;
                        registry.mark_status(id, BackendStatus::Error).unwrap();
                    }
                    StorageOp::Heal(i) => {
                        let id = &specs[i as usize % specs.len()].id;
                        registry.record_success(id);
                        placement.sync_dirty().await;
                        replication.retry_pending().await;
                    }
                }
            });

            for spec in &specs {
                let backend = registry.get(&spec.id).unwrap();
                let adapter = &adapters[&spec.id];
                let held: u64 = adapter
                    .paths()
                    .iter()
                    .filter_map(|p| adapter.object(p))
                    .map(|o| o.len() as u64)
                    .sum();
                prop_assert!(
                    backend.used_bytes <= backend.capacity.bytes().unwrap(),
                    "{} used {} of {}", spec.id, backend.used_bytes, backend.capacity.bytes().unwrap()
                );
                prop_assert_eq!(backend.used_bytes, held, "{} usage drifted from held objects", spec.id);
            }
        }
    }
}

// =============================================================================
// Operational memory merge
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_merge_matches_last_writer_per_field(
        partials in prop::collection::vec(partial_strategy(), 1..12),
    ) {
        let rt = runtime();
        let mut config = AtlasConfig::with_backends(vec![BackendSpec::unbounded("gh").trusted()]);
        config.master_key_hex = Some("44".repeat(32));
        let adapters: HashMap<String, Arc<dyn BackendAdapter>> =
            HashMap::from([("gh".to_string(), Arc::new(InMemoryAdapter::new()) as Arc<dyn BackendAdapter>)]);
        let (_tx, rx) = watch::channel(config.clone());
        let orchestrator = Orchestrator::new(config, rx, adapters).unwrap();

        let mut model: BTreeMap<String, Value> = BTreeMap::new();
        for partial in &partials {
            for (k, v) in partial {
                model.insert(k.clone(), v.clone());
            }
        }

        let entry = rt.block_on(async {
            let mut last = None;
            for partial in &partials {
                last = Some(orchestrator.put("k", Value::Object(partial.clone())).await.unwrap());
            }
            last.unwrap()
        });

        prop_assert_eq!(entry.version, partials.len() as u64);
        let merged: BTreeMap<String, Value> = entry.value.clone().into_iter().collect();
        prop_assert_eq!(merged, model);

        // re-applying the last partial changes nothing but the version
        let again = rt
            .block_on(orchestrator.put("k", Value::Object(partials[partials.len() - 1].clone())))
            .unwrap();
        prop_assert_eq!(again.value, entry.value);
        prop_assert_eq!(again.version, entry.version + 1);
    }

    #[test]
    fn prop_non_object_values_rejected(value in leaf_strategy()) {
        let rt = runtime();
        let config = AtlasConfig::with_backends(vec![BackendSpec::unbounded("gh")]);
        let adapters: HashMap<String, Arc<dyn BackendAdapter>> =
            HashMap::from([("gh".to_string(), Arc::new(InMemoryAdapter::new()) as Arc<dyn BackendAdapter>)]);
        let (_tx, rx) = watch::channel(config.clone());
        let orchestrator = Orchestrator::new(config, rx, adapters).unwrap();

        let result = rt.block_on(orchestrator.put("k", value));
        prop_assert!(result.is_err());
        prop_assert!(orchestrator.entry("k").is_none());
    }
}

// =============================================================================
// Decoders never panic
// =============================================================================

proptest! {
    #[test]
    fn fuzz_snapshot_decode_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = StateSnapshot::decode(&bytes);
    }

    #[test]
    fn fuzz_validate_name(name in ".*") {
        let result = layout::validate_name(&name);
        if name.contains("..") || name.is_empty() {
            prop_assert!(result.is_err());
        }
    }
}
