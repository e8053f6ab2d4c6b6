//! Hashing, canonical encoding and pluggable signatures.
//!
//! Every hash in the engine is a SHA-256 hex digest (64 chars) over the
//! RFC 8785 canonical JSON encoding of the value. Signatures go through the
//! [`Signer`] trait so the primitive can change (HMAC today, asymmetric keys
//! later) without touching tokens or receipts. The id of the key that
//! produced a signature is stored next to it, which is what makes rotation
//! possible: retired keys stay available for verification only.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted key length in bytes.
pub const MIN_KEY_BYTES: usize = 32;

/// Hash of "nothing": the previous-hash value of the first receipt.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors from key handling and canonical encoding.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// Key material is missing, malformed or too short.
    #[error("invalid signing key {key_id}: {reason}")]
    InvalidKey {
        /// Key identifier.
        key_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Value could not be canonicalised.
    #[error("canonical encoding failed: {0}")]
    Canonical(String),
}

/// Raw key bytes that never appear in logs.
#[derive(Clone)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    /// Decode hex key material.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidKey`] if the value is not hex or is shorter
    /// than [`MIN_KEY_BYTES`].
    pub fn from_hex(key_id: &str, value: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(value.trim()).map_err(|e| SigningError::InvalidKey {
            key_id: key_id.to_owned(),
            reason: format!("not hex: {e}"),
        })?;
        Self::from_bytes(key_id, bytes)
    }

    /// Wrap raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidKey`] if fewer than [`MIN_KEY_BYTES`] bytes.
    pub fn from_bytes(key_id: &str, bytes: Vec<u8>) -> Result<Self, SigningError> {
        if bytes.len() < MIN_KEY_BYTES {
            return Err(SigningError::InvalidKey {
                key_id: key_id.to_owned(),
                reason: format!("{} bytes, need at least {MIN_KEY_BYTES}", bytes.len()),
            });
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Produces and checks signatures over byte strings.
pub trait Signer: Send + Sync {
    /// Identifier of the key new signatures are made with.
    fn key_id(&self) -> &str;

    /// Sign `message` with the active key, returning a hex digest.
    fn sign(&self, message: &[u8]) -> String;

    /// Check `signature` over `message` with the key named `key_id`.
    ///
    /// Unknown key ids and malformed signatures verify as `false`.
    fn verify(&self, key_id: &str, message: &[u8], signature: &str) -> bool;
}

/// HMAC-SHA-256 signer with an active key and retired verification keys.
#[derive(Debug, Clone)]
pub struct HmacSigner {
    active_id: String,
    keys: HashMap<String, KeyMaterial>,
}

impl HmacSigner {
    /// Create a signer whose active key is `key`.
    pub fn new(key_id: impl Into<String>, key: KeyMaterial) -> Self {
        let active_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(active_id.clone(), key);
        Self { active_id, keys }
    }

    /// Keep an older key around for verifying signatures it produced.
    #[must_use]
    pub fn with_retired_key(mut self, key_id: impl Into<String>, key: KeyMaterial) -> Self {
        let key_id = key_id.into();
        if key_id != self.active_id {
            self.keys.insert(key_id, key);
        }
        self
    }

    fn mac(key: &KeyMaterial, message: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, so construction cannot fail.
        match HmacSha256::new_from_slice(&key.0) {
            Ok(mut mac) => {
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        }
    }
}

impl Signer for HmacSigner {
    fn key_id(&self) -> &str {
        &self.active_id
    }

    fn sign(&self, message: &[u8]) -> String {
        match self.keys.get(&self.active_id) {
            Some(key) => hex::encode(Self::mac(key, message)),
            None => String::new(),
        }
    }

    fn verify(&self, key_id: &str, message: &[u8], signature: &str) -> bool {
        let Some(key) = self.keys.get(key_id) else {
            return false;
        };
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let expected = Self::mac(key, message);
        if expected.is_empty() || expected.len() != provided.len() {
            return false;
        }
        expected.ct_eq(provided.as_slice()).into()
    }
}

/// RFC 8785 canonical JSON encoding of `value`.
///
/// # Errors
///
/// Returns [`SigningError::Canonical`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SigningError> {
    serde_jcs::to_vec(value).map_err(|e| SigningError::Canonical(e.to_string()))
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of the canonical JSON encoding of `value`.
///
/// # Errors
///
/// Returns [`SigningError::Canonical`] if the value cannot be serialized.
pub fn hash_canonical<T: Serialize + ?Sized>(value: &T) -> Result<String, SigningError> {
    Ok(sha256_hex(&canonical_json(value)?))
}
