// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Encryption gate: seal payloads before they leave the trust boundary.
//!
//! Every payload gets a fresh random data key and nonce. The data key is
//! wrapped under the gate's master key and travels inside the envelope, so
//! any sealed object can be opened on its own given the master key. Both
//! layers are AES-256-GCM; the header is bound as associated data, so a
//! flip of any bit in the envelope fails to open.
//!
//! Envelope layout (v1):
//!
//! ```text
//! magic "ATLS" | alg u8 | key id [8] | wrap nonce [12] | wrapped key [48] | data nonce [12] | ciphertext+tag
//! ```

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::error::AtlasError;
use crate::registry::StorageBackend;

const MAGIC: &[u8; 4] = b"ATLS";
/// AES-256-GCM payload, AES-256-GCM key wrap
pub const ALG_AES256GCM_WRAPPED: u8 = 1;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_ID_LEN: usize = 8;
const WRAPPED_KEY_LEN: usize = KEY_LEN + TAG_LEN;
const KEY_AAD_LEN: usize = MAGIC.len() + 1 + KEY_ID_LEN;
const HEADER_LEN: usize = KEY_AAD_LEN + NONCE_LEN + WRAPPED_KEY_LEN + NONCE_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("sealed payload rejected: {0}")]
    Integrity(&'static str),
    #[error("cipher failure while sealing")]
    Seal,
}

impl From<GateError> for AtlasError {
    fn from(err: GateError) -> Self {
        AtlasError::Integrity(err.to_string())
    }
}

pub struct EncryptionGate {
    master: Aes256Gcm,
    key_id: [u8; KEY_ID_LEN],
}

impl EncryptionGate {
    #[must_use]
    pub fn new(master_key: [u8; KEY_LEN]) -> Self {
        let digest = Sha256::digest(master_key);
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&digest[..KEY_ID_LEN]);
        Self {
            master: Aes256Gcm::new(&master_key.into()),
            key_id,
        }
    }

    /// Gate from a hex-encoded 32-byte master key.
    pub fn from_hex(encoded: &str) -> Result<Self, AtlasError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| AtlasError::Config(format!("master key is not hex: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| AtlasError::Config("master key must be 32 bytes".into()))?;
        Ok(Self::new(key))
    }

    /// Gate with a random master key. Sealed data does not survive a restart.
    #[must_use]
    pub fn ephemeral() -> Self {
        warn!("No master key configured, sealing with an ephemeral key");
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    /// Short fingerprint of the master key, carried in every envelope.
    #[must_use]
    pub fn key_id(&self) -> String {
        hex::encode(self.key_id)
    }

    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, GateError> {
        let mut data_key = [0u8; KEY_LEN];
        let mut wrap_nonce = [0u8; NONCE_LEN];
        let mut data_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut data_key);
        OsRng.fill_bytes(&mut wrap_nonce);
        OsRng.fill_bytes(&mut data_nonce);

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TAG_LEN);
        out.extend_from_slice(MAGIC);
        out.push(ALG_AES256GCM_WRAPPED);
        out.extend_from_slice(&self.key_id);

        let wrapped = self
            .master
            .encrypt(
                Nonce::from_slice(&wrap_nonce),
                Payload { msg: &data_key, aad: &out[..KEY_AAD_LEN] },
            )
            .map_err(|_| GateError::Seal)?;
        out.extend_from_slice(&wrap_nonce);
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&data_nonce);

        let cipher = Aes256Gcm::new(&data_key.into());
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&data_nonce),
                Payload { msg: payload, aad: &out[..HEADER_LEN] },
            )
            .map_err(|_| GateError::Seal)?;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload. Fails closed on any mismatch.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, GateError> {
        if sealed.len() < HEADER_LEN + TAG_LEN {
            return Err(GateError::Integrity("envelope truncated"));
        }
        if &sealed[..MAGIC.len()] != MAGIC {
            return Err(GateError::Integrity("bad magic"));
        }
        if sealed[MAGIC.len()] != ALG_AES256GCM_WRAPPED {
            return Err(GateError::Integrity("unsupported algorithm"));
        }
        if sealed[MAGIC.len() + 1..KEY_AAD_LEN] != self.key_id {
            return Err(GateError::Integrity("sealed under a different master key"));
        }

        let mut offset = KEY_AAD_LEN;
        let wrap_nonce = &sealed[offset..offset + NONCE_LEN];
        offset += NONCE_LEN;
        let wrapped = &sealed[offset..offset + WRAPPED_KEY_LEN];
        offset += WRAPPED_KEY_LEN;
        let data_nonce = &sealed[offset..offset + NONCE_LEN];

        let data_key = self
            .master
            .decrypt(
                Nonce::from_slice(wrap_nonce),
                Payload { msg: wrapped, aad: &sealed[..KEY_AAD_LEN] },
            )
            .map_err(|_| GateError::Integrity("data key failed to unwrap"))?;
        let cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|_| GateError::Integrity("data key has wrong length"))?;
        cipher
            .decrypt(
                Nonce::from_slice(data_nonce),
                Payload { msg: &sealed[HEADER_LEN..], aad: &sealed[..HEADER_LEN] },
            )
            .map_err(|_| GateError::Integrity("authentication tag mismatch"))
    }

    /// Encode a payload for `backend`: sealed unless the backend is trusted.
    ///
    /// Returns the bytes to write and whether they are sealed.
    pub fn encode_for(
        &self,
        backend: &StorageBackend,
        payload: &[u8],
    ) -> Result<(Vec<u8>, bool), GateError> {
        if backend.trusted {
            Ok((payload.to_vec(), false))
        } else {
            Ok((self.seal(payload)?, true))
        }
    }

    /// Inverse of [`encode_for`](Self::encode_for).
    pub fn decode(&self, stored: &[u8], sealed: bool) -> Result<Vec<u8>, GateError> {
        if sealed {
            self.open(stored)
        } else {
            Ok(stored.to_vec())
        }
    }

    /// Bytes added by sealing a payload.
    #[must_use]
    pub const fn overhead() -> usize {
        HEADER_LEN + TAG_LEN
    }
}
