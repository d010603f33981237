// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("adapter call timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-backend object primitive.
///
/// One implementation exists per real storage provider. Network I/O, auth
/// and provider-side retries belong to the implementation; the orchestrator
/// only bounds each call with its own timeout and never retries in-line.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), AdapterError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, AdapterError>;
    async fn delete(&self, path: &str) -> Result<(), AdapterError>;

    /// Short label for logs and metrics.
    fn kind(&self) -> &'static str {
        "remote"
    }
}

/// Run an adapter call under a hard deadline.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(timeout)),
    }
}
