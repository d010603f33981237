// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Asset catalog: large, rarely-changing artifacts pushed to a fixed subset
//! of backends by the asset sync job.
//!
//! Assets are content-addressed by SHA-256. A backend only receives an
//! asset again when its digest changed since the last successful push there.

use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::crypto::EncryptionGate;
use crate::error::AtlasError;
use crate::registry::{BackendRegistry, BackendStatus};
use crate::storage::layout;
use crate::storage::BackendGateway;

#[derive(Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub bytes: Arc<Vec<u8>>,
    /// Hex SHA-256 of `bytes`
    pub digest: String,
    pub registered_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetSyncReport {
    pub pushed: usize,
    pub unchanged: usize,
    /// Backend Full, Migrating, or out of room; tried again next run
    pub deferred: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct PushedCopy {
    digest: String,
    stored_bytes: u64,
}

pub struct AssetCatalog {
    registry: Arc<BackendRegistry>,
    gateway: Arc<BackendGateway>,
    gate: Arc<EncryptionGate>,
    targets: Vec<String>,
    assets: DashMap<String, Asset>,
    /// (asset, backend) → what that backend holds
    pushed: DashMap<(String, String), PushedCopy>,
}

impl AssetCatalog {
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        gateway: Arc<BackendGateway>,
        gate: Arc<EncryptionGate>,
        targets: Vec<String>,
    ) -> Self {
        Self {
            registry,
            gateway,
            gate,
            targets,
            assets: DashMap::new(),
            pushed: DashMap::new(),
        }
    }

    /// Add or replace an asset. Returns its digest. No I/O.
    pub fn register(&self, name: &str, bytes: Vec<u8>) -> Result<String, AtlasError> {
        layout::validate_name(name)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        debug!(asset = %name, bytes = bytes.len(), digest = %digest, "Registered asset");
        self.assets.insert(
            name.to_string(),
            Asset {
                name: name.to_string(),
                bytes: Arc::new(bytes),
                digest: digest.clone(),
                registered_at: crate::now_millis(),
            },
        );
        Ok(digest)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Asset> {
        self.assets.get(name).map(|a| a.value().clone())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.assets.iter().map(|a| a.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Whether `backend` holds the current version of `name`.
    #[must_use]
    pub fn is_current_on(&self, name: &str, backend: &str) -> bool {
        let Some(asset) = self.assets.get(name) else {
            return false;
        };
        self.pushed
            .get(&(name.to_string(), backend.to_string()))
            .map_or(false, |p| p.digest == asset.digest)
    }

    /// Push every changed asset to every target backend.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> AssetSyncReport {
        let mut report = AssetSyncReport::default();
        let assets: Vec<Asset> = self.assets.iter().map(|a| a.value().clone()).collect();

        for asset in &assets {
            for backend_id in &self.targets {
                let key = (asset.name.clone(), backend_id.clone());
                let previous = self.pushed.get(&key).map(|p| p.value().clone());
                if previous.as_ref().map_or(false, |p| p.digest == asset.digest) {
                    report.unchanged += 1;
                    continue;
                }

                let backend = match self.registry.get(backend_id) {
                    Ok(backend) => backend,
                    Err(e) => {
                        warn!(backend = %backend_id, error = %e, "Asset target missing from registry");
                        report.failed += 1;
                        continue;
                    }
                };
                let charged = previous.as_ref().map_or(0, |p| p.stored_bytes);
                let needed = (asset.bytes.len() + EncryptionGate::overhead()) as u64;
                if matches!(backend.status, BackendStatus::Full | BackendStatus::Migrating)
                    || !backend.fits(needed.saturating_sub(charged))
                {
                    debug!(asset = %asset.name, backend = %backend_id, status = %backend.status, "Asset push deferred");
                    report.deferred += 1;
                    continue;
                }

                let (bytes, _sealed) = match self.gate.encode_for(&backend, &asset.bytes) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(asset = %asset.name, error = %e, "Asset sealing failed");
                        report.failed += 1;
                        continue;
                    }
                };
                match self
                    .gateway
                    .write(backend_id, &layout::asset_path(&asset.name), &bytes)
                    .await
                {
                    Ok(()) => {
                        let stored = bytes.len() as u64;
                        if let Err(e) = self.registry.record_usage(backend_id, stored as i64 - charged as i64) {
                            warn!(backend = %backend_id, error = %e, "Usage not recorded");
                        }
                        self.registry.touch_sync(backend_id, crate::now_millis());
                        self.pushed.insert(
                            key,
                            PushedCopy {
                                digest: asset.digest.clone(),
                                stored_bytes: stored,
                            },
                        );
                        report.pushed += 1;
                    }
                    Err(e) => {
                        warn!(asset = %asset.name, backend = %backend_id, error = %e, "Asset push failed");
                        report.failed += 1;
                    }
                }
            }
        }

        if report.pushed > 0 || report.failed > 0 {
            info!(
                pushed = report.pushed,
                unchanged = report.unchanged,
                deferred = report.deferred,
                failed = report.failed,
                "Asset sync finished"
            );
        }
        report
    }
}
