// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operational memory: a versioned key → JSON object map of live process
//! state.
//!
//! `put` is read-merge-write under a per-key lock. The merged value is only
//! committed once the sink has accepted it, so a rejected write leaves the
//! previous version in place. Different keys never wait on each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AtlasError;
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Map<String, Value>,
    /// Incremented on every committed put, starting at 1
    pub version: u64,
    /// Epoch millis of the last commit
    pub updated_at: i64,
}

/// Where committed entries are persisted.
#[async_trait]
pub trait EntrySink: Send + Sync {
    /// Persist `entry`. An error aborts the put.
    async fn persist(&self, entry: &MemoryEntry) -> Result<(), AtlasError>;
}

pub struct OperationalMemory {
    entries: DashMap<String, MemoryEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    sink: Arc<dyn EntrySink>,
}

impl OperationalMemory {
    #[must_use]
    pub fn new(sink: Arc<dyn EntrySink>) -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            sink,
        }
    }

    /// Shallow-merge `partial` into the value at `key`.
    ///
    /// Returns the committed entry. `partial` must be a JSON object.
    pub async fn put(&self, key: &str, partial: Value) -> Result<MemoryEntry, AtlasError> {
        let Value::Object(partial) = partial else {
            return Err(AtlasError::InvalidValue(format!(
                "value for '{}' must be a JSON object",
                key
            )));
        };
        if key.is_empty() {
            return Err(AtlasError::InvalidValue("key must not be empty".into()));
        }

        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let _guard = lock.lock().await;

        let mut next = self.entry(key).unwrap_or_else(|| MemoryEntry {
            key: key.to_string(),
            value: Map::new(),
            version: 0,
            updated_at: 0,
        });
        for (field, value) in partial {
            next.value.insert(field, value);
        }
        next.version += 1;
        next.updated_at = crate::now_millis();

        self.sink.persist(&next).await?;
        self.entries.insert(key.to_string(), next.clone());

        metrics::set_memory_entries(self.entries.len());
        debug!(key = %key, version = next.version, "Committed memory entry");
        Ok(next)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Map<String, Value>> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Value, version and timestamp for `key`.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<MemoryEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Point-in-time copy of every value, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Map<String, Value>> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect()
    }

    /// Every entry, ordered by key.
    #[must_use]
    pub fn entries(&self) -> Vec<MemoryEntry> {
        let mut entries: Vec<MemoryEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Adopt restored entries whose version is newer than what is held.
    ///
    /// Returns how many were adopted. Nothing is persisted.
    pub fn restore(&self, restored: Vec<MemoryEntry>) -> usize {
        let mut adopted = 0;
        for entry in restored {
            let newer = self
                .entries
                .get(&entry.key)
                .map_or(true, |held| held.version < entry.version);
            if newer {
                self.entries.insert(entry.key.clone(), entry);
                adopted += 1;
            }
        }
        metrics::set_memory_entries(self.entries.len());
        adopted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
