// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the orchestrator.

use crate::registry::{CapacitySummary, StorageBackend};

/// Orchestrator lifecycle state.
///
/// Use [`super::Orchestrator::state()`] to check the current state or
/// [`super::Orchestrator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, nothing read or written yet
    Created,
    /// Reading the latest snapshot back from the backends
    Restoring,
    /// Accepting reads and writes; timers not running
    Ready,
    /// Timers running
    Running,
    /// Stopping timers, taking the final snapshot
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Restoring => write!(f, "Restoring"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Read-only view of the registry and degraded state.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStatus {
    pub backends: Vec<StorageBackend>,
    pub capacity: CapacitySummary,
    pub pending_migrations: usize,
    pub under_replicated_sets: usize,
    pub dirty_nodes: usize,
}

impl RegistryStatus {
    /// Nothing pending, nothing under-replicated, no backend in Error.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.pending_migrations == 0
            && self.under_replicated_sets == 0
            && self.dirty_nodes == 0
            && self
                .backends
                .iter()
                .all(|b| b.status != crate::registry::BackendStatus::Error)
    }
}

/// Memory layer report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStatus {
    /// "Unlimited", "<n>TB+" or "<n>GB"
    pub total_storage: String,
    pub node_count: usize,
    pub active_platforms: Vec<String>,
    pub active_nodes: usize,
    /// Distinct backends holding the latest snapshot
    pub redundancy: usize,
    pub entries: usize,
    pub pending_migrations: usize,
    pub under_replicated_sets: usize,
    pub dirty_nodes: usize,
}

/// Outcome of [`super::Orchestrator::initialize()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub nodes_created: usize,
    pub nodes_total: usize,
    pub summary_copies: usize,
}

/// Outcome of [`super::Orchestrator::restore()`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Epoch millis of the adopted snapshot, if any was found
    pub taken_at: Option<i64>,
    /// Backends holding a readable copy of the adopted snapshot
    pub copies: usize,
    pub integrity_failures: usize,
    pub unreachable: usize,
    pub entries_adopted: usize,
    pub nodes_adopted: usize,
}
