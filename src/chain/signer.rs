//! Signing Credentials
//!
//! The ledger account key is always supplied from outside: an environment
//! variable in deployments, a static key in tests. There is no built-in key.

use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};

use super::ChainError;

/// Environment variable holding the hex signing key.
pub const SIGNING_KEY_ENV: &str = "IOT_SIGNING_KEY";

/// A 32-byte account signing key.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    /// Parse a hex key, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, ChainError> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(trimmed)
            .map_err(|e| ChainError::InvalidCredential(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ChainError::InvalidCredential(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self(key))
    }

    /// A fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Account address derived from the key (`0x` + 20 bytes).
    pub fn account(&self) -> String {
        let digest = Sha256::digest(self.0);
        format!("0x{}", hex::encode(&digest[12..]))
    }

    /// Sign a payload: `SHA-256(key || payload)`.
    pub fn sign(&self, payload: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(payload);
        hasher.finalize().into()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey({})", self.account())
    }
}

/// Where the signing key comes from.
pub trait SigningKeySource: Send + Sync {
    /// Load the key.
    fn signing_key(&self) -> Result<SigningKey, ChainError>;
}

/// Reads the key from an environment variable.
#[derive(Clone, Debug)]
pub struct EnvKeySource {
    var: String,
}

impl Default for EnvKeySource {
    fn default() -> Self {
        Self { var: SIGNING_KEY_ENV.to_string() }
    }
}

impl EnvKeySource {
    /// Read from a custom variable.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl SigningKeySource for EnvKeySource {
    fn signing_key(&self) -> Result<SigningKey, ChainError> {
        let value = std::env::var(&self.var)
            .map_err(|_| ChainError::MissingCredential(self.var.clone()))?;
        SigningKey::from_hex(&value)
    }
}

/// A fixed, already loaded key.
#[derive(Clone, Debug)]
pub struct StaticKeySource(SigningKey);

impl StaticKeySource {
    /// Wrap a key.
    pub fn new(key: SigningKey) -> Self {
        Self(key)
    }
}

impl SigningKeySource for StaticKeySource {
    fn signing_key(&self) -> Result<SigningKey, ChainError> {
        Ok(self.0.clone())
    }
}
