// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync scheduler: three independent periodic jobs.
//!
//! | Job        | Default | Work                                              |
//! |------------|---------|---------------------------------------------------|
//! | Node sync  | 15 min  | push dirty nodes, retry migrations and replicas   |
//! | Asset sync | 6 h     | push changed assets to the asset backends         |
//! | Snapshot   | 5 min   | seal and replicate the rolled-up state            |
//!
//! Each job has its own timer task. A tick spawns one run; if the previous
//! run of the same job is still going the tick is skipped, never queued.
//! Different jobs overlap freely. Intervals follow config updates from the
//! watch channel without a restart.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::assets::AssetSyncReport;
use crate::config::AtlasConfig;
use crate::error::AtlasError;
use crate::metrics;
use crate::placement::NodeSyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    NodeSync,
    AssetSync,
    Snapshot,
}

impl Job {
    pub const ALL: [Job; 3] = [Job::NodeSync, Job::AssetSync, Job::Snapshot];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeSync => "node_sync",
            Self::AssetSync => "asset_sync",
            Self::Snapshot => "snapshot",
        }
    }

    #[must_use]
    pub fn interval(&self, config: &AtlasConfig) -> Duration {
        let secs = match self {
            Self::NodeSync => config.node_sync_interval_secs,
            Self::AssetSync => config.asset_sync_interval_secs,
            Self::Snapshot => config.snapshot_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    fn index(&self) -> usize {
        match self {
            Self::NodeSync => 0,
            Self::AssetSync => 1,
            Self::Snapshot => 2,
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a job run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    NodeSync {
        nodes: NodeSyncReport,
        replica_sets_retried: usize,
        under_replicated: usize,
        recovered_backends: Vec<String>,
    },
    AssetSync(AssetSyncReport),
    Snapshot {
        sequence: u64,
        copies: usize,
        under_replicated: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran(JobReport),
    Failed(AtlasError),
    /// The previous run of the same job was still in progress
    Skipped,
}

/// The work behind each job.
#[async_trait]
pub trait SyncJobs: Send + Sync + 'static {
    async fn run_job(&self, job: Job) -> Result<JobReport, AtlasError>;
}

#[derive(Default)]
struct JobSlot {
    running: AtomicBool,
    runs: AtomicU64,
    skips: AtomicU64,
}

/// Clears the running flag when a run ends, including by panic.
struct RunPermit<'a>(&'a AtomicBool);

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SchedulerInner {
    jobs: Arc<dyn SyncJobs>,
    slots: [JobSlot; 3],
}

impl SchedulerInner {
    async fn run_once(&self, job: Job) -> TickOutcome {
        let slot = &self.slots[job.index()];
        if slot
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            slot.skips.fetch_add(1, Ordering::Relaxed);
            metrics::record_job_skipped(job.name());
            debug!(%job, "Previous run still in progress, skipping tick");
            return TickOutcome::Skipped;
        }
        let _permit = RunPermit(&slot.running);

        let start = Instant::now();
        let result = self.jobs.run_job(job).await;
        slot.runs.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(report) => {
                metrics::record_job_run(job.name(), "success", start.elapsed());
                debug!(%job, elapsed_ms = start.elapsed().as_millis() as u64, "Job finished");
                TickOutcome::Ran(report)
            }
            Err(e) => {
                metrics::record_job_run(job.name(), "error", start.elapsed());
                warn!(%job, error = %e, "Job failed");
                TickOutcome::Failed(e)
            }
        }
    }
}

pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
    shutdown: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncScheduler {
    #[must_use]
    pub fn new(jobs: Arc<dyn SyncJobs>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                jobs,
                slots: Default::default(),
            }),
            shutdown,
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one timer task per job. No-op if already started.
    ///
    /// The first run of each job happens one interval after start.
    pub fn start(&self, config_rx: watch::Receiver<AtlasConfig>) {
        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);
        for job in Job::ALL {
            let inner = self.inner.clone();
            let config_rx = config_rx.clone();
            let shutdown_rx = self.shutdown.subscribe();
            timers.push(tokio::spawn(timer_loop(inner, job, config_rx, shutdown_rx)));
        }
        info!("Sync scheduler started");
    }

    /// Stop the timers and wait for in-flight runs to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let timers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.timers.lock());
        if timers.is_empty() {
            return;
        }
        for timer in timers {
            if let Err(e) = timer.await {
                warn!(error = %e, "Timer task ended abnormally");
            }
        }
        info!("Sync scheduler stopped");
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.timers.lock().is_empty()
    }

    /// Run one job now, with the same skip rule as the timers.
    pub async fn tick(&self, job: Job) -> TickOutcome {
        self.inner.run_once(job).await
    }

    #[must_use]
    pub fn is_running(&self, job: Job) -> bool {
        self.inner.slots[job.index()].running.load(Ordering::Acquire)
    }

    /// Completed runs of `job`, successful or not.
    #[must_use]
    pub fn runs(&self, job: Job) -> u64 {
        self.inner.slots[job.index()].runs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn skips(&self, job: Job) -> u64 {
        self.inner.slots[job.index()].skips.load(Ordering::Relaxed)
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn timer_loop(
    inner: Arc<SchedulerInner>,
    job: Job,
    mut config_rx: watch::Receiver<AtlasConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut period = job.interval(&config_rx.borrow_and_update());
    let mut timer = ticker(period);
    let mut in_flight = JoinSet::new();
    debug!(%job, period_secs = period.as_secs(), "Job timer running");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            Ok(()) = config_rx.changed() => {
                let next = job.interval(&config_rx.borrow_and_update());
                if next != period {
                    info!(%job, old_secs = period.as_secs(), new_secs = next.as_secs(), "Job interval updated");
                    period = next;
                    timer = ticker(period);
                }
            }

            _ = timer.tick() => {
                let inner = inner.clone();
                in_flight.spawn(async move {
                    inner.run_once(job).await;
                });
            }

            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
    debug!(%job, "Job timer stopped");
}
