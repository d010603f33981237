// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Atlas Storage
//!
//! Capacity-aware storage orchestration across heterogeneous backends.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Operational Memory Store                   │
//! │  • put(key, partial) / get(key) / snapshot()               │
//! │  • Read-merge-write under a per-key lock                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │       Placement Engine       │  │   Replication Manager    │
//! │  • Most headroom wins        │  │  • N distinct backends   │
//! │  • Migrates off Full         │  │  • Degrades, never fails │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │      Encryption Gate (AES-256-GCM, per-payload data key)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   Backend Gateway → Backend Adapters (timeout per call)     │
//! │   Backend Registry (capacity, status, error counters)       │
//! └─────────────────────────────────────────────────────────────┘
//!
//!      Sync Scheduler: node sync │ asset sync │ state snapshot
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use atlas_storage::{AtlasConfig, BackendAdapter, InMemoryAdapter, Orchestrator};
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AtlasConfig::default();
//!     let adapters: HashMap<String, Arc<dyn BackendAdapter>> = config
//!         .backends
//!         .iter()
//!         .map(|b| (b.id.clone(), Arc::new(InMemoryAdapter::new()) as Arc<dyn BackendAdapter>))
//!         .collect();
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let orchestrator = Orchestrator::new(config, rx, adapters).expect("valid config");
//!
//!     orchestrator.restore().await;
//!     orchestrator.start();
//!
//!     orchestrator.put("agent", json!({"status": "online"})).await.expect("put failed");
//!     orchestrator.put("agent", json!({"tasks": 3})).await.expect("put failed");
//!     let value = orchestrator.get("agent").await.expect("get failed");
//!     assert_eq!(value["status"], "online");
//!
//!     println!("{:?}", orchestrator.registry_status());
//!     orchestrator.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`Orchestrator`] and its lifecycle
//! - [`registry`]: backends and their live capacity state
//! - [`placement`]: node placement and migration
//! - [`replication`]: multi-backend copies of critical state
//! - [`crypto`]: the encryption gate
//! - [`operational`]: the versioned operational memory map
//! - [`scheduler`]: periodic jobs
//! - [`storage`]: adapter trait, gateway, in-memory adapter, object layout

pub mod assets;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod node;
pub mod operational;
pub mod placement;
pub mod registry;
pub mod replication;
pub mod scheduler;
pub mod snapshot;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::{AtlasConfig, BackendSpec};
pub use coordinator::{EngineState, InitReport, MemoryStatus, Orchestrator, RegistryStatus, RestoreReport};
pub use crypto::{EncryptionGate, GateError};
pub use error::AtlasError;
pub use node::{MemoryNode, NodeCategory};
pub use operational::MemoryEntry;
pub use placement::{MigrationOutcome, WriteReceipt};
pub use registry::{BackendStatus, Capacity, StorageBackend};
pub use replication::{CopyState, ReplicaCopy, ReplicationSet};
pub use scheduler::{Job, JobReport, TickOutcome};
pub use storage::{AdapterError, BackendAdapter, InMemoryAdapter};

/// Wall-clock epoch millis.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
