// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timeout-bounded access to backend adapters.
//!
//! The gateway is the only place that talks to a [`BackendAdapter`]. Each
//! call runs under the configured deadline and its outcome is fed back into
//! the registry: success clears error state, an outage marks the backend
//! Error, a timeout is counted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::traits::{with_timeout, AdapterError, BackendAdapter};
use crate::error::AtlasError;
use crate::metrics::{self, LatencyTimer};
use crate::registry::BackendRegistry;

pub struct BackendGateway {
    registry: Arc<BackendRegistry>,
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
    timeout: Duration,
}

impl BackendGateway {
    /// Every registered backend must have an adapter.
    pub fn new(
        registry: Arc<BackendRegistry>,
        adapters: HashMap<String, Arc<dyn BackendAdapter>>,
        timeout: Duration,
    ) -> Result<Self, AtlasError> {
        for backend in registry.list() {
            if !adapters.contains_key(&backend.platform_id) {
                return Err(AtlasError::Config(format!(
                    "no adapter for backend '{}'",
                    backend.platform_id
                )));
            }
        }
        Ok(Self {
            registry,
            adapters,
            timeout,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn write(&self, backend: &str, path: &str, bytes: &[u8]) -> Result<(), AtlasError> {
        let adapter = self.adapter(backend)?;
        let result = {
            let _timer = LatencyTimer::new(backend, "write");
            with_timeout(self.timeout, adapter.write(path, bytes)).await
        };
        self.settle(backend, path, "write", result)?;
        metrics::record_bytes_written(backend, bytes.len());
        debug!(backend = %backend, path = %path, bytes = bytes.len(), "Wrote object");
        Ok(())
    }

    pub async fn read(&self, backend: &str, path: &str) -> Result<Vec<u8>, AtlasError> {
        let adapter = self.adapter(backend)?;
        let result = {
            let _timer = LatencyTimer::new(backend, "read");
            with_timeout(self.timeout, adapter.read(path)).await
        };
        self.settle(backend, path, "read", result)
    }

    pub async fn delete(&self, backend: &str, path: &str) -> Result<(), AtlasError> {
        let adapter = self.adapter(backend)?;
        let result = {
            let _timer = LatencyTimer::new(backend, "delete");
            with_timeout(self.timeout, adapter.delete(path)).await
        };
        self.settle(backend, path, "delete", result)
    }

    fn adapter(&self, backend: &str) -> Result<Arc<dyn BackendAdapter>, AtlasError> {
        self.adapters
            .get(backend)
            .cloned()
            .ok_or_else(|| AtlasError::UnknownBackend(backend.to_string()))
    }

    fn settle<T>(
        &self,
        backend: &str,
        path: &str,
        operation: &str,
        result: Result<T, AdapterError>,
    ) -> Result<T, AtlasError> {
        match result {
            Ok(value) => {
                self.registry.record_success(backend);
                Ok(value)
            }
            // The backend answered; a missing object says nothing about its health.
            Err(AdapterError::NotFound(_)) => {
                self.registry.record_success(backend);
                Err(AtlasError::NotFound(path.to_string()))
            }
            Err(err @ AdapterError::Timeout(_)) => {
                let reason = err.to_string();
                warn!(backend = %backend, path = %path, operation, "Adapter call timed out");
                self.registry.record_timeout(backend, &reason);
                Err(AtlasError::BackendUnreachable {
                    backend: backend.to_string(),
                    reason,
                })
            }
            Err(err @ AdapterError::Unavailable(_)) => {
                let reason = err.to_string();
                warn!(backend = %backend, path = %path, operation, error = %reason, "Backend unavailable");
                self.registry.record_failure(backend, &reason);
                Err(AtlasError::BackendUnreachable {
                    backend: backend.to_string(),
                    reason,
                })
            }
        }
    }
}
