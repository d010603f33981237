// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage orchestrator.
//!
//! The [`Orchestrator`] ties the components together:
//! - backend registry and timeout-bounded adapter gateway
//! - placement engine (nodes, migration)
//! - replication manager (critical state fan-out)
//! - encryption gate
//! - operational memory store
//! - sync scheduler (node sync, asset sync, state snapshot)
//!
//! # Lifecycle
//!
//! ```text
//! Created → Restoring → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use atlas_storage::{AtlasConfig, BackendAdapter, EngineState, InMemoryAdapter, Orchestrator};
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = AtlasConfig::default();
//! let adapters: HashMap<String, Arc<dyn BackendAdapter>> = config
//!     .backends
//!     .iter()
//!     .map(|b| (b.id.clone(), Arc::new(InMemoryAdapter::new()) as Arc<dyn BackendAdapter>))
//!     .collect();
//!
//! let (_tx, rx) = watch::channel(config.clone());
//! let orchestrator = Orchestrator::new(config, rx, adapters).expect("valid config");
//! assert_eq!(orchestrator.state(), EngineState::Created);
//!
//! orchestrator.restore().await;
//! orchestrator.initialize().await.expect("init failed");
//! orchestrator.put("agent", json!({"status": "online"})).await.expect("put failed");
//! orchestrator.start();
//! // ...
//! orchestrator.shutdown().await;
//! # }
//! ```

mod api;
mod jobs;
mod lifecycle;
mod types;

pub use types::{EngineState, InitReport, MemoryStatus, RegistryStatus, RestoreReport};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::assets::AssetCatalog;
use crate::config::AtlasConfig;
use crate::crypto::EncryptionGate;
use crate::error::AtlasError;
use crate::operational::{EntrySink, OperationalMemory};
use crate::placement::PlacementEngine;
use crate::registry::BackendRegistry;
use crate::replication::ReplicationManager;
use crate::scheduler::SyncScheduler;
use crate::storage::{BackendAdapter, BackendGateway};

/// Everything the jobs and the public API share.
pub(crate) struct Core {
    pub(crate) registry: Arc<BackendRegistry>,
    pub(crate) gateway: Arc<BackendGateway>,
    pub(crate) gate: Arc<EncryptionGate>,
    pub(crate) placement: Arc<PlacementEngine>,
    pub(crate) replication: ReplicationManager,
    pub(crate) memory: OperationalMemory,
    pub(crate) assets: AssetCatalog,
    pub(crate) snapshot_seq: AtomicU64,
}

/// Capacity-aware storage orchestrator.
///
/// # Thread Safety
///
/// `Send + Sync`; every method takes `&self`. Same-key writes are
/// linearized by per-key locks, everything else runs in parallel.
pub struct Orchestrator {
    pub(super) config: AtlasConfig,
    pub(super) config_rx: watch::Receiver<AtlasConfig>,
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,
    pub(super) core: Arc<Core>,
    pub(super) scheduler: SyncScheduler,
}

impl Orchestrator {
    /// Build the orchestrator. No adapter is called until
    /// [`restore()`](Self::restore) or the first write.
    ///
    /// Every configured backend needs an adapter. Policy (thresholds,
    /// factor, margin, timeout) is fixed here; job intervals follow
    /// `config_rx`.
    pub fn new(
        config: AtlasConfig,
        config_rx: watch::Receiver<AtlasConfig>,
        adapters: HashMap<String, Arc<dyn BackendAdapter>>,
    ) -> Result<Self, AtlasError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let registry = Arc::new(BackendRegistry::new(&config.backends, config.full_threshold));
        let gateway = Arc::new(BackendGateway::new(
            registry.clone(),
            adapters,
            config.adapter_timeout(),
        )?);
        let gate = Arc::new(match config.master_key_hex {
            Some(ref key) => EncryptionGate::from_hex(key)?,
            None => EncryptionGate::ephemeral(),
        });
        let placement = Arc::new(PlacementEngine::new(
            registry.clone(),
            gateway.clone(),
            gate.clone(),
            config.soft_threshold,
            config.migration_margin,
        ));
        let replication = ReplicationManager::new(
            registry.clone(),
            gateway.clone(),
            gate.clone(),
            placement.clone(),
            config.min_replication_factor,
        );
        let sink: Arc<dyn EntrySink> = placement.clone();
        let assets = AssetCatalog::new(
            registry.clone(),
            gateway.clone(),
            gate.clone(),
            config.asset_targets(),
        );

        let core = Arc::new(Core {
            registry,
            gateway,
            gate,
            placement,
            replication,
            memory: OperationalMemory::new(sink),
            assets,
            snapshot_seq: AtomicU64::new(0),
        });
        let scheduler = SyncScheduler::new(core.clone());

        info!(
            backends = config.backends.len(),
            replication_factor = config.min_replication_factor,
            full_threshold = config.full_threshold,
            "Orchestrator created"
        );
        crate::metrics::set_engine_state("Created");

        Ok(Self {
            config,
            config_rx,
            state: state_tx,
            state_rx,
            core,
            scheduler,
        })
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Accepting reads and writes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Policy this orchestrator was built with.
    #[must_use]
    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(&state.to_string());
    }
}
