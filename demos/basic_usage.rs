// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic atlas-storage usage example.
//!
//! Demonstrates:
//! 1. Building an orchestrator over in-memory adapters
//! 2. Laying out the node grid
//! 3. Writing and merging operational memory
//! 4. Filling a small backend until a node migrates off it
//! 5. Taking a replicated snapshot and restoring it into a fresh orchestrator
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! Everything runs in-process; no external services are needed.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use atlas_storage::{
    AtlasConfig, BackendAdapter, BackendSpec, EngineState, InMemoryAdapter, JobReport, NodeCategory,
    Orchestrator, TickOutcome,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the orchestrator emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           atlas-storage: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure the backends
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring backends...");

    let mut config = AtlasConfig::with_backends(vec![
        BackendSpec::bounded("scratch", 2_048).trusted(),
        BackendSpec::bounded("Mega", 50 * 1024 * 1024),
        BackendSpec::bounded("pCloud", 10 * 1024 * 1024),
        BackendSpec::unbounded("GitHub"),
    ]);
    config.master_key_hex = Some("5a".repeat(32));

    let adapters: HashMap<String, Arc<InMemoryAdapter>> = config
        .backends
        .iter()
        .map(|b| (b.id.clone(), Arc::new(InMemoryAdapter::new())))
        .collect();
    let orchestrator = build(&config, &adapters)?;
    println!("   State: {:?}", orchestrator.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Restore (nothing yet) and lay out the grid
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚀 Restoring and initializing...");
    let restored = orchestrator.restore().await;
    println!("   └─ Restored snapshot: {:?}", restored.taken_at);

    let init = orchestrator.initialize().await?;
    println!(
        "   └─ Grid: {} nodes created, summary on {} backends",
        init.nodes_created, init.summary_copies
    );
    orchestrator.start();
    assert_eq!(orchestrator.state(), EngineState::Running);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Operational memory: partial updates merge
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing operational memory...");
    let updates = vec![
        ("agent.alpha", json!({"status": "online"})),
        ("agent.alpha", json!({"tasks": 3})),
        ("queue.ingest", json!({"depth": 12, "paused": false})),
        ("agent.alpha", json!({"status": "busy"})),
    ];
    for (key, partial) in updates {
        let start = std::time::Instant::now();
        let entry = orchestrator.put(key, partial).await?;
        println!(
            "   └─ {} (v{}) → {} ({:?})",
            key,
            entry.version,
            serde_json::Value::Object(entry.value),
            start.elapsed()
        );
    }

    let alpha = orchestrator.get("agent.alpha").await?;
    println!("   ⚡ agent.alpha = {}", serde_json::Value::Object(alpha));

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Saturate the scratch backend
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📦 Filling 'scratch' until it crosses the full threshold...");
    let placement = orchestrator.placement();
    placement.ensure_node(NodeCategory::Storage, "bulk", "scratch")?;
    let receipt = placement
        .write_slot(NodeCategory::Storage, "bulk", vec![0xAB; 1_900])
        .await?;
    println!("   └─ Node {} now on '{}'", receipt.node_id, receipt.backend_id);
    println!("   └─ Migration: {:?}", receipt.migration);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Snapshot, then restore into a fresh orchestrator
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔐 Taking a replicated snapshot...");
    if let TickOutcome::Ran(JobReport::Snapshot { sequence, copies, under_replicated }) =
        orchestrator.tick_snapshot().await
    {
        println!(
            "   └─ Snapshot #{} on {} backends (under-replicated: {})",
            sequence, copies, under_replicated
        );
    }

    let status = orchestrator.registry_status();
    println!("\n📍 Backends:");
    for backend in &status.backends {
        println!(
            "   └─ {:<8} {:>9} bytes used  {:<9} errors={}",
            backend.platform_id,
            backend.used_bytes,
            backend.status.to_string(),
            backend.error_count
        );
    }
    println!("   Total storage: {}", status.capacity.total);

    println!("\n♻️  Restoring into a second orchestrator...");
    let second = build(&config, &adapters)?;
    let report = second.restore().await;
    println!(
        "   └─ {} entries, {} nodes from {} copies",
        report.entries_adopted, report.nodes_adopted, report.copies
    );
    let alpha = second.get("agent.alpha").await?;
    println!("   └─ agent.alpha = {}", serde_json::Value::Object(alpha));

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Dump raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    orchestrator.shutdown().await;
    println!("   ✅ Shutdown complete! State: {:?}", orchestrator.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn build(
    config: &AtlasConfig,
    adapters: &HashMap<String, Arc<InMemoryAdapter>>,
) -> Result<Orchestrator, atlas_storage::AtlasError> {
    let adapters: HashMap<String, Arc<dyn BackendAdapter>> = adapters
        .iter()
        .map(|(id, a)| (id.clone(), a.clone() as Arc<dyn BackendAdapter>))
        .collect();
    let (_config_tx, config_rx) = watch::channel(config.clone());
    Orchestrator::new(config.clone(), config_rx, adapters)
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name.to_string(), label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name.to_string(), label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(f64::NEG_INFINITY, f64::max);
                histograms.push((name.to_string(), label_str, count, sum, max));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum, max) in &histograms {
            println!("      └─ {}{} count={} sum={:.4} max={:.4}", name, labels, count, sum, max);
        }
    }
}
