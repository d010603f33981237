// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rolled-up critical state, sealed and replicated to
//! `atlas/snapshot/latest` by the snapshot job.

use serde::{Deserialize, Serialize};

use crate::error::AtlasError;
use crate::node::MemoryNode;
use crate::operational::MemoryEntry;
use crate::registry::StorageBackend;

pub const SNAPSHOT_FORMAT: u32 = 1;

/// Logical replication key of the summary written by `initialize`.
pub const MEMORY_STATE_KEY: &str = "memory-state";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format: u32,
    /// Epoch millis
    pub taken_at: i64,
    /// Increments per snapshot taken by this process
    pub sequence: u64,
    pub entries: Vec<MemoryEntry>,
    /// Node manifest
    pub nodes: Vec<MemoryNode>,
    /// Backend storage map (usage and last sync per backend)
    pub backends: Vec<StorageBackend>,
}

impl StateSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, AtlasError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AtlasError> {
        let snapshot: Self = serde_json::from_slice(bytes)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(AtlasError::Serialization(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }
        Ok(snapshot)
    }

    /// Ordering used to pick among restored copies: newest first.
    #[must_use]
    pub fn is_newer_than(&self, other: &StateSnapshot) -> bool {
        (self.taken_at, self.sequence) > (other.taken_at, other.sequence)
    }
}

/// Summary of the node grid, replicated once at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStateSummary {
    pub initialized_at: i64,
    pub total_storage: String,
    pub node_count: usize,
    pub platforms: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn snapshot(taken_at: i64, sequence: u64) -> StateSnapshot {
        StateSnapshot {
            format: SNAPSHOT_FORMAT,
            taken_at,
            sequence,
            entries: vec![MemoryEntry {
                key: "k".into(),
                value: Map::new(),
                version: 1,
                updated_at: taken_at,
            }],
            nodes: vec![],
            backends: vec![],
        }
    }

    #[test]
    fn test_encode_decode() {
        let original = snapshot(100, 2);
        let decoded = StateSnapshot::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut future = snapshot(1, 1);
        future.format = 99;
        let err = StateSnapshot::decode(&future.encode().unwrap()).unwrap_err();
        assert!(matches!(err, AtlasError::Serialization(_)));
        assert!(StateSnapshot::decode(b"garbage").is_err());
    }

    #[test]
    fn test_newest_wins() {
        assert!(snapshot(200, 0).is_newer_than(&snapshot(100, 9)));
        assert!(snapshot(100, 3).is_newer_than(&snapshot(100, 2)));
        assert!(!snapshot(100, 2).is_newer_than(&snapshot(100, 2)));
    }
}
