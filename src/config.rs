// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the storage orchestrator.
//!
//! # Example
//!
//! ```
//! use atlas_storage::AtlasConfig;
//!
//! // Default catalog: eight platforms, one of them unbounded
//! let config = AtlasConfig::default();
//! assert_eq!(config.backends.len(), 8);
//! assert_eq!(config.min_replication_factor, 3);
//!
//! // From TOML, everything not given falls back to defaults
//! let config = AtlasConfig::from_toml_str(r#"
//!     full_threshold = 0.85
//!
//!     [[backends]]
//!     id = "primary"
//!     capacity_bytes = 1073741824
//!     trusted = true
//!
//!     [[backends]]
//!     id = "archive"
//! "#).unwrap();
//! assert_eq!(config.backends.len(), 2);
//! assert_eq!(config.backends[1].capacity_bytes, None); // unbounded
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AtlasError;

/// Static description of one storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Unique platform id (e.g. "Mega")
    pub id: String,

    /// Total capacity in bytes; absent means unbounded
    #[serde(default)]
    pub capacity_bytes: Option<u64>,

    /// Bytes already in use when the process starts
    #[serde(default)]
    pub used_bytes: u64,

    /// Trusted backends receive plaintext node payloads
    #[serde(default)]
    pub trusted: bool,
}

impl BackendSpec {
    #[must_use]
    pub fn bounded(id: &str, capacity_bytes: u64) -> Self {
        Self {
            id: id.to_string(),
            capacity_bytes: Some(capacity_bytes),
            used_bytes: 0,
            trusted: false,
        }
    }

    #[must_use]
    pub fn unbounded(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capacity_bytes: None,
            used_bytes: 0,
            trusted: false,
        }
    }

    #[must_use]
    pub fn with_used(mut self, used_bytes: u64) -> Self {
        self.used_bytes = used_bytes;
        self
    }

    #[must_use]
    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}

/// Configuration for the orchestrator.
///
/// Thresholds and replication factor are policy, not constants: every one
/// of them can be overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasConfig {
    /// Backend catalog
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendSpec>,

    /// Utilization above which a backend flips to Full
    #[serde(default = "default_full_threshold")]
    pub full_threshold: f64,

    /// Placement prefers backends under this utilization
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f64,

    /// Minimum distinct copies of critical state
    #[serde(default = "default_min_replication_factor")]
    pub min_replication_factor: usize,

    /// Migration target must have `margin × payload` bytes free
    #[serde(default = "default_migration_margin")]
    pub migration_margin: f64,

    /// Hard deadline for every adapter call
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,

    /// Job intervals
    #[serde(default = "default_node_sync_interval_secs")]
    pub node_sync_interval_secs: u64,
    #[serde(default = "default_asset_sync_interval_secs")]
    pub asset_sync_interval_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Fixed subset of backends receiving assets (empty: first three)
    #[serde(default)]
    pub asset_backends: Vec<String>,

    /// 32-byte sealing master key, hex encoded. Ephemeral if absent.
    #[serde(default)]
    pub master_key_hex: Option<String>,
}

const GIB: u64 = 1024 * 1024 * 1024;

fn default_backends() -> Vec<BackendSpec> {
    vec![
        BackendSpec::bounded("TeraBox", 1024 * GIB),
        BackendSpec::bounded("Icedrive", 10 * GIB),
        BackendSpec::bounded("Google Drive", 15 * GIB),
        BackendSpec::bounded("Internxt", 10 * GIB),
        BackendSpec::bounded("Mega", 50 * GIB),
        BackendSpec::bounded("pCloud", 10 * GIB),
        BackendSpec::bounded("Mediafire", 10 * GIB),
        BackendSpec::unbounded("GitHub"),
    ]
}
fn default_full_threshold() -> f64 { 0.9 }
fn default_soft_threshold() -> f64 { 0.8 }
fn default_min_replication_factor() -> usize { 3 }
fn default_migration_margin() -> f64 { 2.0 }
fn default_adapter_timeout_ms() -> u64 { 5_000 }
fn default_node_sync_interval_secs() -> u64 { 15 * 60 }
fn default_asset_sync_interval_secs() -> u64 { 6 * 60 * 60 }
fn default_snapshot_interval_secs() -> u64 { 5 * 60 }

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            full_threshold: default_full_threshold(),
            soft_threshold: default_soft_threshold(),
            min_replication_factor: default_min_replication_factor(),
            migration_margin: default_migration_margin(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            node_sync_interval_secs: default_node_sync_interval_secs(),
            asset_sync_interval_secs: default_asset_sync_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            asset_backends: Vec::new(),
            master_key_hex: None,
        }
    }
}

impl AtlasConfig {
    /// Config with the given backends and default policy.
    #[must_use]
    pub fn with_backends(backends: Vec<BackendSpec>) -> Self {
        Self {
            backends,
            ..Default::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, AtlasError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Backends that receive assets.
    #[must_use]
    pub fn asset_targets(&self) -> Vec<String> {
        if self.asset_backends.is_empty() {
            self.backends.iter().take(3).map(|b| b.id.clone()).collect()
        } else {
            self.asset_backends.clone()
        }
    }

    #[must_use]
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    /// Reject inconsistent policy before anything is built from it.
    pub fn validate(&self) -> Result<(), AtlasError> {
        if self.backends.is_empty() {
            return Err(AtlasError::Config("at least one backend is required".into()));
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(AtlasError::Config("backend id must not be empty".into()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(AtlasError::Config(format!("duplicate backend id '{}'", backend.id)));
            }
        }
        if !(self.full_threshold > 0.0 && self.full_threshold <= 1.0) {
            return Err(AtlasError::Config(format!(
                "full_threshold must be in (0, 1], got {}",
                self.full_threshold
            )));
        }
        if !(self.soft_threshold > 0.0 && self.soft_threshold <= self.full_threshold) {
            return Err(AtlasError::Config(format!(
                "soft_threshold must be in (0, full_threshold], got {}",
                self.soft_threshold
            )));
        }
        if self.min_replication_factor == 0 {
            return Err(AtlasError::Config("min_replication_factor must be at least 1".into()));
        }
        if self.migration_margin < 1.0 {
            return Err(AtlasError::Config("migration_margin must be at least 1.0".into()));
        }
        if self.adapter_timeout_ms == 0 {
            return Err(AtlasError::Config("adapter_timeout_ms must be positive".into()));
        }
        if self.node_sync_interval_secs == 0
            || self.asset_sync_interval_secs == 0
            || self.snapshot_interval_secs == 0
        {
            return Err(AtlasError::Config("job intervals must be positive".into()));
        }
        for id in &self.asset_backends {
            if !seen.contains(id.as_str()) {
                return Err(AtlasError::Config(format!("asset backend '{}' is not configured", id)));
            }
        }
        if let Some(ref key) = self.master_key_hex {
            match hex::decode(key.trim()) {
                Ok(bytes) if bytes.len() == 32 => {}
                _ => return Err(AtlasError::Config("master_key_hex must be 32 hex-encoded bytes".into())),
            }
        }
        Ok(())
    }
}
