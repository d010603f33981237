// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the orchestrator.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `atlas_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `backend`: platform id
//! - `operation`: write, read, delete, put, get, replicate
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::registry::BackendStatus;

/// Record a public operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "atlas_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record adapter call latency
pub fn record_adapter_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "atlas_adapter_call_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Bytes pushed to a backend
pub fn record_bytes_written(backend: &str, bytes: usize) {
    counter!(
        "atlas_bytes_written_total",
        "backend" => backend.to_string()
    )
    .increment(bytes as u64);
}

pub fn set_backend_used_bytes(backend: &str, bytes: u64) {
    gauge!(
        "atlas_backend_used_bytes",
        "backend" => backend.to_string()
    )
    .set(bytes as f64);
}

/// Backend status (0 = Active, 1 = Migrating, 2 = Full, 3 = Error)
pub fn set_backend_status(backend: &str, status: BackendStatus) {
    gauge!(
        "atlas_backend_status",
        "backend" => backend.to_string()
    )
    .set(f64::from(status.code()));
}

/// Record a backend error (`kind` is "unavailable" or "timeout")
pub fn record_backend_error(backend: &str, kind: &str) {
    counter!(
        "atlas_backend_errors_total",
        "backend" => backend.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// PLACEMENT & MIGRATION
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_placement(backend: &str, category: &str) {
    counter!(
        "atlas_placements_total",
        "backend" => backend.to_string(),
        "category" => category.to_string()
    )
    .increment(1);
}

pub fn record_no_capacity(category: &str) {
    counter!(
        "atlas_no_capacity_total",
        "category" => category.to_string()
    )
    .increment(1);
}

/// Record a node migration (`outcome` is "migrated", "pending" or "failed")
pub fn record_migration(from: &str, outcome: &str, bytes: u64) {
    counter!(
        "atlas_migrations_total",
        "from" => from.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    if outcome == "migrated" {
        counter!("atlas_migrated_bytes_total").increment(bytes);
    }
}

pub fn set_pending_migrations(count: usize) {
    gauge!("atlas_pending_migrations").set(count as f64);
}

pub fn set_dirty_nodes(count: usize) {
    gauge!("atlas_dirty_nodes").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// REPLICATION & INTEGRITY
// ═══════════════════════════════════════════════════════════════════════════

/// Record a replication round (`outcome` is "full", "degraded" or "failed")
pub fn record_replication(key: &str, outcome: &str, copies: usize) {
    counter!(
        "atlas_replications_total",
        "key" => key.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    gauge!(
        "atlas_replica_copies",
        "key" => key.to_string()
    )
    .set(copies as f64);
}

pub fn set_under_replicated_sets(count: usize) {
    gauge!("atlas_under_replicated_sets").set(count as f64);
}

/// A sealed payload failed to open
pub fn record_integrity_failure(source: &str) {
    counter!(
        "atlas_integrity_failures_total",
        "source" => source.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULER & LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a job run (`status` is "success" or "error")
pub fn record_job_run(job: &str, status: &str, duration: Duration) {
    counter!(
        "atlas_job_runs_total",
        "job" => job.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "atlas_job_seconds",
        "job" => job.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A tick fired while the previous run of the same job was still going
pub fn record_job_skipped(job: &str) {
    counter!(
        "atlas_job_skipped_total",
        "job" => job.to_string()
    )
    .increment(1);
}

/// Set orchestrator state (as a label gauge)
pub fn set_engine_state(state: &str) {
    for s in ["Created", "Restoring", "Ready", "Running", "ShuttingDown", "Stopped"] {
        gauge!("atlas_engine_state", "state" => s).set(if s == state { 1.0 } else { 0.0 });
    }
}

pub fn set_memory_entries(count: usize) {
    gauge!("atlas_memory_entries").set(count as f64);
}

/// A timing guard that records adapter latency on drop
pub struct LatencyTimer {
    backend: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &str, operation: &'static str) -> Self {
        Self {
            backend: backend.to_string(),
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_adapter_latency(&self.backend, self.operation, self.start.elapsed());
    }
}
