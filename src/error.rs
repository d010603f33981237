// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-level error taxonomy.
//!
//! Capacity and integrity failures are surfaced to callers synchronously.
//! Unreachable backends are transient: the scheduler retries them on the
//! next tick. Under-replication is a soft warning carried alongside a
//! successful result.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtlasError {
    /// No Active backend can absorb the write. Not retried automatically.
    #[error("no backend has capacity for {requested} bytes")]
    NoCapacity { requested: u64 },

    /// Transient adapter failure (I/O error or timeout).
    #[error("backend '{backend}' unreachable: {reason}")]
    BackendUnreachable { backend: String, reason: String },

    /// A sealed payload failed to open. Never treated as plaintext.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Fewer distinct copies than the replication factor asks for.
    #[error("'{key}' is under-replicated: {copies} of {required} copies")]
    UnderReplicated {
        key: String,
        copies: usize,
        required: usize,
    },

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// Whether the scheduler is expected to retry the failed operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnreachable { .. })
    }
}

impl From<serde_json::Error> for AtlasError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for AtlasError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_is_transient() {
        let unreachable = AtlasError::BackendUnreachable {
            backend: "mega".into(),
            reason: "connection reset".into(),
        };
        assert!(unreachable.is_transient());
        assert!(!AtlasError::NoCapacity { requested: 10 }.is_transient());
        assert!(!AtlasError::Integrity("tag mismatch".into()).is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = AtlasError::UnderReplicated {
            key: "snapshot".into(),
            copies: 2,
            required: 3,
        };
        assert_eq!(err.to_string(), "'snapshot' is under-replicated: 2 of 3 copies");
        assert_eq!(
            AtlasError::NoCapacity { requested: 42 }.to_string(),
            "no backend has capacity for 42 bytes"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let err: AtlasError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, AtlasError::Serialization(_)));
    }
}
