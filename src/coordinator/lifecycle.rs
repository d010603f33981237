// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Orchestrator lifecycle: restore, initialize, start, manual ticks,
//! shutdown.

use tracing::{info, warn};

use crate::error::AtlasError;
use crate::node::NodeCategory;
use crate::scheduler::{Job, TickOutcome};
use crate::snapshot::{MemoryStateSummary, MEMORY_STATE_KEY};

use super::{EngineState, InitReport, Orchestrator, RestoreReport};

impl Orchestrator {
    /// Adopt the newest snapshot readable from any backend.
    ///
    /// Copies that fail to open are skipped and counted. Finding nothing is
    /// not an error: the orchestrator simply starts empty.
    #[tracing::instrument(skip(self))]
    pub async fn restore(&self) -> RestoreReport {
        self.set_state(EngineState::Restoring);
        let report = self.core.restore_latest().await;
        self.set_state(EngineState::Ready);
        report
    }

    /// Lay out one node per category on every Active backend, push them,
    /// then replicate a summary of the grid. Safe to call repeatedly.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<InitReport, AtlasError> {
        if self.state() == EngineState::Created {
            self.set_state(EngineState::Ready);
        }
        let placement = &self.core.placement;
        let before = placement.node_count();

        let active: Vec<String> = self
            .core
            .registry
            .list()
            .into_iter()
            .filter(|b| b.is_active())
            .map(|b| b.platform_id)
            .collect();
        for backend in &active {
            for category in NodeCategory::ALL {
                placement.ensure_node(category, &grid_slot(backend), backend)?;
            }
        }
        let pushed = placement.sync_dirty().await;
        let nodes_total = placement.node_count();

        let summary = MemoryStateSummary {
            initialized_at: crate::now_millis(),
            total_storage: self.core.registry.capacity_summary().total,
            node_count: nodes_total,
            platforms: active,
        };
        let set = self
            .core
            .replication
            .replicate(MEMORY_STATE_KEY, serde_json::to_vec(&summary)?)
            .await?;

        let report = InitReport {
            nodes_created: nodes_total - before,
            nodes_total,
            summary_copies: set.stored_copies(),
        };
        info!(
            nodes_created = report.nodes_created,
            nodes_total,
            pushed = pushed.pushed,
            total_storage = %summary.total_storage,
            "Memory grid initialized"
        );
        Ok(report)
    }

    /// Start the job timers. The first run of each job is one interval out.
    pub fn start(&self) {
        if self.state() == EngineState::Running {
            return;
        }
        self.scheduler.start(self.config_rx.clone());
        self.set_state(EngineState::Running);
        info!("Orchestrator running");
    }

    pub async fn tick_node_sync(&self) -> TickOutcome {
        self.scheduler.tick(Job::NodeSync).await
    }

    pub async fn tick_asset_sync(&self) -> TickOutcome {
        self.scheduler.tick(Job::AssetSync).await
    }

    pub async fn tick_snapshot(&self) -> TickOutcome {
        self.scheduler.tick(Job::Snapshot).await
    }

    /// Stop the timers, push what is pending and take a final snapshot.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = std::time::Instant::now();
        info!("Initiating orchestrator shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.scheduler.stop().await;

        if let TickOutcome::Failed(e) = self.tick_node_sync().await {
            warn!(error = %e, "Final node sync failed");
        }
        match self.tick_snapshot().await {
            TickOutcome::Failed(e) => warn!(error = %e, "Final snapshot failed"),
            TickOutcome::Skipped => warn!("Final snapshot skipped, a snapshot was still running"),
            TickOutcome::Ran(_) => {}
        }

        self.set_state(EngineState::Stopped);
        info!(elapsed_ms = shutdown_start.elapsed().as_millis() as u64, "Orchestrator shutdown complete");
    }
}

fn grid_slot(backend: &str) -> String {
    format!("grid/{}", backend)
}
