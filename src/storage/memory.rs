// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{AdapterError, BackendAdapter};

/// In-process object store implementing [`BackendAdapter`].
///
/// Used by tests and demos in place of a provider. Supports outage and
/// latency injection so degraded paths can be driven deterministically.
pub struct InMemoryAdapter {
    objects: DashMap<String, Vec<u8>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
    writes: AtomicU64,
}

impl InMemoryAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            offline: AtomicBool::new(false),
            latency: Mutex::new(None),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call by `latency` (None to clear).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Raw stored bytes at `path`, bypassing outage injection.
    #[must_use]
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.get(path).map(|r| r.value().clone())
    }

    /// Flip one bit of the object at `path`. Returns false if absent.
    pub fn corrupt(&self, path: &str, bit: usize) -> bool {
        match self.objects.get_mut(path) {
            Some(mut bytes) if !bytes.is_empty() => {
                let idx = (bit / 8) % bytes.len();
                bytes[idx] ^= 1 << (bit % 8);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of successful writes since creation.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    async fn gate(&self) -> Result<(), AdapterError> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable("in-memory adapter offline".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for InMemoryAdapter {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), AdapterError> {
        self.gate().await?;
        self.objects.insert(path.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, AdapterError> {
        self.gate().await?;
        self.object(path)
            .ok_or_else(|| AdapterError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), AdapterError> {
        self.gate().await?;
        self.objects.remove(path);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
