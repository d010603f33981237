// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory node data structure.
//!
//! A [`MemoryNode`] is one logical slot of stored data pinned to a single
//! backend. Its id is stable for life; migration only changes `backend_id`.

use serde::{Deserialize, Serialize};

use crate::storage::layout;

/// What kind of state a node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Operational,
    Storage,
    Backup,
    Execution,
}

impl NodeCategory {
    pub const ALL: [NodeCategory; 4] = [
        NodeCategory::Operational,
        NodeCategory::Storage,
        NodeCategory::Backup,
        NodeCategory::Execution,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Storage => "storage",
            Self::Backup => "backup",
            Self::Execution => "execution",
        }
    }
}

impl std::fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a node id from platform, category and creation time.
///
/// `seq` disambiguates nodes created within the same millisecond.
#[must_use]
pub fn derive_node_id(platform: &str, category: NodeCategory, created_at: i64, seq: u64) -> String {
    let platform: String = platform
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}_{}_{}_{}", platform, category, created_at, seq)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: String,
    pub category: NodeCategory,
    /// Logical slot within the category (e.g. an operational memory key)
    pub slot: String,
    pub backend_id: String,
    /// Plaintext payload; sealed on the way out when the backend is untrusted
    #[serde(with = "hex_payload")]
    pub payload: Vec<u8>,
    /// Epoch millis of the last payload change
    pub last_update_at: i64,
    /// Whether the copy on the backend is sealed
    pub encrypted: bool,
    /// Bytes currently charged to `backend_id` for this node
    pub stored_bytes: u64,
    /// Changed since the last successful push
    #[serde(default)]
    pub dirty: bool,
    /// Saturated backend with no migration target yet
    #[serde(default)]
    pub migration_pending: bool,
}

impl MemoryNode {
    /// New, never-pushed node pinned to `backend_id`.
    #[must_use]
    pub fn new(id: String, category: NodeCategory, slot: String, backend_id: String) -> Self {
        Self {
            id,
            category,
            slot,
            backend_id,
            payload: Vec::new(),
            last_update_at: crate::now_millis(),
            encrypted: false,
            stored_bytes: 0,
            dirty: true,
            migration_pending: false,
        }
    }

    /// Object path on the backend.
    #[must_use]
    pub fn path(&self) -> String {
        layout::node_path(self.category, &self.id)
    }

    #[must_use]
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_node_id_is_path_safe() {
        let id = derive_node_id("Google Drive", NodeCategory::Backup, 1_700_000_000_000, 3);
        assert_eq!(id, "google-drive_backup_1700000000000_3");
    }

    #[test]
    fn test_new_node_is_dirty_and_empty() {
        let node = MemoryNode::new("n1".into(), NodeCategory::Storage, "grid".into(), "mega".into());
        assert!(node.dirty);
        assert_eq!(node.stored_bytes, 0);
        assert_eq!(node.path(), "atlas/storage/n1");
    }

    #[test]
    fn test_serde_payload_as_hex() {
        let mut node = MemoryNode::new("n1".into(), NodeCategory::Operational, "cfg".into(), "a".into());
        node.payload = vec![0xde, 0xad];

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["payload"], "dead");
        assert_eq!(json["category"], "operational");

        let back: MemoryNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
