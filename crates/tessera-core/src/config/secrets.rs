//! Encrypted Provider Key Store
//!
//! Provider API keys at rest are XChaCha20-Poly1305 ciphertext with a fresh
//! random nonce per write. The symmetric master key is held out-of-band and
//! supplied through `TESSERA_MASTER_KEY` (64 hex chars). Key material never
//! appears in logs or query results; callers see validation metadata only.

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::error::{EngineError, Result};
use crate::storage::{GraphStore, KeyRecord, KeyValidationStatus};

/// Maximum stored length of a validation error message
const VALIDATION_ERROR_MAX_LEN: usize = 240;

/// Encrypted provider key store
pub struct SecretStore {
    store: Arc<GraphStore>,
    cipher: XChaCha20Poly1305,
}

impl SecretStore {
    /// Create a store from a 32-byte master key
    pub fn new(store: Arc<GraphStore>, master_key: &[u8; 32]) -> Self {
        Self {
            store,
            cipher: XChaCha20Poly1305::new(Key::from_slice(master_key)),
        }
    }

    /// Create a store from the `TESSERA_MASTER_KEY` environment variable
    pub fn from_env(store: Arc<GraphStore>) -> Result<Self> {
        let hex_key = std::env::var("TESSERA_MASTER_KEY")
            .map_err(|_| EngineError::Internal("TESSERA_MASTER_KEY not set".to_string()))?;
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| EngineError::Internal(format!("TESSERA_MASTER_KEY not hex: {}", e)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            EngineError::Internal("TESSERA_MASTER_KEY must be 32 bytes (64 hex chars)".to_string())
        })?;
        Ok(Self::new(store, &key))
    }

    /// Encrypt and persist a provider key; resets validation to untested
    pub fn store_key(&self, provider: &str, secret: &str) -> Result<()> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, secret.as_bytes())
            .map_err(|_| EngineError::Internal("key encryption failed".to_string()))?;
        self.store
            .put_encrypted_key(provider, nonce.as_slice(), &ciphertext)?;
        tracing::info!(provider, "stored encrypted provider key");
        Ok(())
    }

    /// Decrypt a stored provider key
    pub fn load_key(&self, provider: &str) -> Result<Option<String>> {
        let Some((nonce, ciphertext)) = self.store.get_encrypted_key(provider)? else {
            return Ok(None);
        };
        if nonce.len() != 24 {
            return Err(EngineError::Integrity(format!(
                "stored nonce for {} has wrong length",
                provider
            )));
        }
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| {
                EngineError::Integrity(format!("stored key for {} failed decryption", provider))
            })?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| EngineError::Integrity(format!("stored key for {} is not UTF-8", provider)))
    }

    /// Record the outcome of a startup validation attempt
    ///
    /// Errors are truncated before persisting; raw provider messages can be
    /// arbitrarily long.
    pub fn record_validation(
        &self,
        provider: &str,
        outcome: std::result::Result<(), &EngineError>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => self
                .store
                .set_key_validation(provider, KeyValidationStatus::Valid, None),
            Err(err) => self.store.set_key_validation(
                provider,
                KeyValidationStatus::Invalid,
                Some(&err.truncated_message(VALIDATION_ERROR_MAX_LEN)),
            ),
        }
    }

    /// Validation metadata for every stored key
    pub fn list(&self) -> Result<Vec<KeyRecord>> {
        self.store.list_key_records()
    }
}
