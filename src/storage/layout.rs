// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object path layout shared by every backend.
//!
//! ```text
//! atlas/<category>/<nodeId>     memory nodes and replica copies
//! atlas/snapshot/latest         sealed rolled-up state snapshot
//! atlas/assets/<name>           large, rarely-changing artifacts
//! ```

use crate::error::AtlasError;
use crate::node::NodeCategory;

pub const ROOT: &str = "atlas";

/// Logical replication key of the periodic state snapshot.
pub const SNAPSHOT_KEY: &str = "snapshot";

pub const SNAPSHOT_PATH: &str = "atlas/snapshot/latest";

/// Read by node sync to check whether an Error backend answers again.
pub const PROBE_PATH: &str = "atlas/probe";

#[must_use]
pub fn node_path(category: NodeCategory, node_id: &str) -> String {
    format!("{}/{}/{}", ROOT, category, node_id)
}

#[must_use]
pub fn asset_path(name: &str) -> String {
    format!("{}/assets/{}", ROOT, name)
}

/// Where a replica copy of `logical_key` lives on its backend.
#[must_use]
pub fn replica_path(logical_key: &str, node_id: &str) -> String {
    if logical_key == SNAPSHOT_KEY {
        SNAPSHOT_PATH.to_string()
    } else {
        node_path(NodeCategory::Backup, node_id)
    }
}

/// Reject names that would escape their namespace.
pub fn validate_name(name: &str) -> Result<(), AtlasError> {
    if name.is_empty() || name.contains("..") || name.starts_with('/') || name.contains('\\') {
        return Err(AtlasError::InvalidValue(format!("illegal object name '{}'", name)));
    }
    Ok(())
}
