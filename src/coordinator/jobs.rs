// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The work behind each scheduled job, and snapshot restore.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::AtlasError;
use crate::metrics;
use crate::registry::BackendStatus;
use crate::scheduler::{Job, JobReport, SyncJobs};
use crate::snapshot::{StateSnapshot, SNAPSHOT_FORMAT};
use crate::storage::layout;

use super::{Core, RestoreReport};

#[async_trait]
impl SyncJobs for Core {
    async fn run_job(&self, job: Job) -> Result<JobReport, AtlasError> {
        match job {
            Job::NodeSync => Ok(self.node_sync().await),
            Job::AssetSync => Ok(JobReport::AssetSync(self.assets.sync().await)),
            Job::Snapshot => self.snapshot_state().await,
        }
    }
}

impl Core {
    /// Probe Error backends, push dirty nodes, retry migrations and
    /// degraded replica sets.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn node_sync(&self) -> JobReport {
        self.probe_errored_backends().await;
        let recovered_backends = self.registry.rebalance_statuses();
        let nodes = self.placement.sync_dirty().await;
        let (replica_sets_retried, under_replicated) = self.replication.retry_pending().await;

        info!(
            pushed = nodes.pushed,
            failed = nodes.failed,
            migrated = nodes.migrated,
            pending_migrations = nodes.still_pending,
            replica_sets_retried,
            under_replicated,
            "Node sync finished"
        );
        JobReport::NodeSync {
            nodes,
            replica_sets_retried,
            under_replicated,
            recovered_backends,
        }
    }

    /// Seal and replicate the rolled-up state under the snapshot key.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn snapshot_state(&self) -> Result<JobReport, AtlasError> {
        let sequence = self.snapshot_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = StateSnapshot {
            format: SNAPSHOT_FORMAT,
            taken_at: crate::now_millis(),
            sequence,
            entries: self.memory.entries(),
            nodes: self.placement.node_manifest(),
            backends: self.registry.list(),
        };
        let encoded = snapshot.encode()?;
        let set = self.replication.replicate(layout::SNAPSHOT_KEY, encoded).await?;

        if let Some(warning) = set.warning(self.replication.min_factor()) {
            warn!(error = %warning, "Snapshot stored with reduced redundancy");
        }
        debug!(
            sequence,
            entries = snapshot.entries.len(),
            nodes = snapshot.nodes.len(),
            copies = set.stored_copies(),
            "Snapshot replicated"
        );
        Ok(JobReport::Snapshot {
            sequence,
            copies: set.stored_copies(),
            under_replicated: set.under_replicated,
        })
    }

    /// Read the snapshot from every backend and adopt the newest good copy.
    pub(crate) async fn restore_latest(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut newest: Option<(StateSnapshot, Vec<u8>)> = None;
        let mut found: Vec<(String, u64, i64, u64)> = Vec::new();

        for backend in self.registry.list() {
            let id = backend.platform_id;
            let sealed = match self.gateway.read(&id, layout::SNAPSHOT_PATH).await {
                Ok(bytes) => bytes,
                Err(AtlasError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(backend = %id, error = %e, "Snapshot copy unreadable");
                    report.unreachable += 1;
                    continue;
                }
            };
            let decoded = self
                .gate
                .open(&sealed)
                .map_err(AtlasError::from)
                .and_then(|plain| StateSnapshot::decode(&plain).map(|s| (s, plain)));
            let (snapshot, plain) = match decoded {
                Ok(decoded) => decoded,
                Err(e) => {
                    metrics::record_integrity_failure("snapshot");
                    warn!(backend = %id, error = %e, "Snapshot copy failed integrity check, skipping");
                    report.integrity_failures += 1;
                    continue;
                }
            };

            found.push((id, sealed.len() as u64, snapshot.taken_at, snapshot.sequence));
            if newest.as_ref().map_or(true, |(held, _)| snapshot.is_newer_than(held)) {
                newest = Some((snapshot, plain));
            }
        }

        let Some((snapshot, plain)) = newest else {
            info!(
                integrity_failures = report.integrity_failures,
                unreachable = report.unreachable,
                "No snapshot to restore"
            );
            return report;
        };

        let copies: Vec<(String, u64)> = found
            .into_iter()
            .filter(|(_, _, taken_at, sequence)| *taken_at == snapshot.taken_at && *sequence == snapshot.sequence)
            .map(|(id, bytes, ..)| (id, bytes))
            .collect();

        report.taken_at = Some(snapshot.taken_at);
        report.copies = copies.len();
        self.registry.restore_usage(&snapshot.backends);
        report.entries_adopted = self.memory.restore(snapshot.entries);
        report.nodes_adopted = self.placement.adopt_nodes(snapshot.nodes);
        self.snapshot_seq.fetch_max(snapshot.sequence, Ordering::AcqRel);
        self.replication.adopt_copies(layout::SNAPSHOT_KEY, plain, copies);

        info!(
            taken_at = snapshot.taken_at,
            copies = report.copies,
            entries = report.entries_adopted,
            nodes = report.nodes_adopted,
            integrity_failures = report.integrity_failures,
            "Restored snapshot"
        );
        report
    }

    /// A cheap read against each Error backend. Any answer, including
    /// not-found, clears the Error state in the gateway.
    async fn probe_errored_backends(&self) {
        let errored: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|b| b.status == BackendStatus::Error)
            .map(|b| b.platform_id)
            .collect();
        for id in errored {
            match self.gateway.read(&id, layout::PROBE_PATH).await {
                Ok(_) | Err(AtlasError::NotFound(_)) => {
                    info!(backend = %id, "Backend answered probe");
                }
                Err(e) => debug!(backend = %id, error = %e, "Backend still unreachable"),
            }
        }
    }
}
