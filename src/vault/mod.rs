//! # Context Key Vault
//!
//! Derives a master key from a secret and salt, then a separate subkey for
//! every encryption *context* (a chat, a profile blob, a settings store).
//!
//! ## Key Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        VAULT KEY HIERARCHY                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  secret + salt                                                         │
//! │       │                                                                 │
//! │       ▼  PBKDF2-HMAC-SHA256, 100 000 iterations                        │
//! │  ┌──────────────┐                                                      │
//! │  │  Master Key  │  (never encrypts data directly)                      │
//! │  └──────┬───────┘                                                      │
//! │         │  HKDF-SHA256                                                  │
//! │         │  salt = "snakkaz-{context}-salt-v{version}"                   │
//! │         │  info = "snakkaz-{context}-info-v{version}"                   │
//! │         ▼                                                               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                  │
//! │  │ chat-42 / v1 │  │ chat-43 / v1 │  │ chat-42 / v2 │  ...             │
//! │  └──────────────┘  └──────────────┘  └──────────────┘                  │
//! │         │                                                               │
//! │         ▼  AES-256-GCM, fresh 96-bit IV                                 │
//! │  EncryptedData { ciphertext, iv, keyVersion }                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rotating the key bumps the version. Payloads carry the version they were
//! written under, so older data stays readable until it is re-keyed.

mod cache;

pub use cache::ContextKeyCache;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::kdf::{self, BACKUP_KEY_ITERATIONS, MASTER_KEY_ITERATIONS, PASSWORD_HASH_ITERATIONS};
use crate::crypto::{constant_time_eq, CryptoProvider, EncryptionKey, RustCryptoProvider};
use crate::envelope::{decode_b64, encode_b64, EncryptedData, KeyBackup, KeyBackupPayload, KEY_BACKUP_FORMAT};
use crate::error::{Error, Result};
use crate::time::{Clock, SystemClock};

/// Context used when the caller does not name one
pub const DEFAULT_CONTEXT: &str = "default";

/// Key version of a freshly created vault
pub const INITIAL_KEY_VERSION: u32 = 1;

const BACKUP_SALT_LEN: usize = 16;
const INTEGRITY_PROBE: &str = "snakkaz-integrity-check";

/// Context key cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConfig {
    /// Maximum number of cached context keys
    pub max_cache_size: usize,
    /// Cache lifetime in milliseconds
    #[serde(rename = "cacheTTL")]
    pub cache_ttl_ms: i64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 10,
            cache_ttl_ms: 30 * 60 * 1000,
        }
    }
}

struct VaultState {
    master: Option<EncryptionKey>,
    key_version: u32,
    cache: ContextKeyCache,
}

/// Master key plus per-context derived keys
pub struct ContextKeyVault {
    provider: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
    state: RwLock<VaultState>,
}

impl ContextKeyVault {
    /// Create an uninitialized vault with the default crypto provider
    pub fn new(config: VaultConfig) -> Self {
        Self::with_provider(config, Arc::new(RustCryptoProvider), Arc::new(SystemClock))
    }

    /// Create an uninitialized vault on an explicit provider and clock
    pub fn with_provider(config: VaultConfig, provider: Arc<dyn CryptoProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            clock,
            state: RwLock::new(VaultState {
                master: None,
                key_version: INITIAL_KEY_VERSION,
                cache: ContextKeyCache::new(config.max_cache_size, config.cache_ttl_ms),
            }),
        }
    }

    /// Derive the master key from `secret` and `salt`
    ///
    /// Calling this again replaces the master key and drops cached
    /// context keys.
    pub fn initialize(&self, secret: &[u8], salt: &[u8]) -> Result<()> {
        let master = self.provider.derive_password_key(secret, salt, MASTER_KEY_ITERATIONS)?;

        let mut state = self.state.write();
        state.master = Some(master);
        state.cache.clear();

        tracing::info!("Vault initialized at key version {}", state.key_version);
        Ok(())
    }

    /// Whether a master key is loaded
    pub fn is_ready(&self) -> bool {
        self.state.read().master.is_some()
    }

    /// Current key version
    pub fn key_version(&self) -> u32 {
        self.state.read().key_version
    }

    /// Number of cached context keys
    pub fn cached_key_count(&self) -> usize {
        self.state.read().cache.len()
    }

    /// Encrypt `data` under the key for `context`
    pub fn encrypt(&self, data: &[u8], context: &str) -> Result<EncryptedData> {
        let version = self.key_version();
        let key = self.context_key(context, version)?;
        let (nonce, ciphertext) = self.provider.encrypt(&key, data, &context_aad(context, version))?;
        Ok(EncryptedData::new(&nonce, &ciphertext, version))
    }

    /// Encrypt a string under the key for `context`
    pub fn encrypt_text(&self, text: &str, context: &str) -> Result<EncryptedData> {
        self.encrypt(text.as_bytes(), context)
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt)
    ///
    /// A wrong context, tampered field or wrong key version all fail with
    /// `AuthenticationFailed`.
    pub fn decrypt(&self, encrypted: &EncryptedData, context: &str) -> Result<Vec<u8>> {
        let version = encrypted.key_version.unwrap_or_else(|| self.key_version());
        let key = self.context_key(context, version)?;
        let (nonce, ciphertext) = encrypted.decode()?;
        self.provider.decrypt(&key, &nonce, &ciphertext, &context_aad(context, version))
    }

    /// Decrypt a payload and interpret it as UTF-8
    pub fn decrypt_text(&self, encrypted: &EncryptedData, context: &str) -> Result<String> {
        let bytes = self.decrypt(encrypted, context)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidEnvelope("payload is not UTF-8".into()))
    }

    /// Hash a password for storage (PBKDF2-HMAC-SHA256, 210 000 iterations)
    ///
    /// Independent of the master key; usable before `initialize`.
    pub fn hash_password(&self, password: &str, salt: &str) -> Result<String> {
        let key = self
            .provider
            .derive_password_key(password.as_bytes(), salt.as_bytes(), PASSWORD_HASH_ITERATIONS)?;
        Ok(encode_b64(key.as_bytes()))
    }

    /// Check `password` against a stored hash in constant time
    pub fn verify_password(&self, password: &str, hash: &str, salt: &str) -> Result<bool> {
        let computed = self.hash_password(password, salt)?;
        Ok(constant_time_eq(computed.as_bytes(), hash.as_bytes()))
    }

    /// Derive and cache keys for several contexts ahead of use
    pub fn preload_context_keys(&self, contexts: &[&str]) -> Result<usize> {
        if !self.is_ready() {
            return Err(Error::NotInitialized);
        }

        let version = self.key_version();
        let mut unique: Vec<&str> = contexts.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let mut loaded = 0;
        for context in &unique {
            match self.context_key(context, version) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!("Failed to preload key for context '{}': {}", context, e),
            }
        }

        tracing::debug!("Preloaded keys for {} contexts", loaded);
        Ok(loaded)
    }

    /// Bump the key version and drop cached keys
    pub fn rotate_encryption_key(&self) -> Result<u32> {
        self.rotate_encryption_key_with(|_, _| Ok(()))
    }

    /// Bump the key version, then run `rekey(old_version, new_version)`
    ///
    /// `rekey` may call back into the vault to re-encrypt stored data. If it
    /// fails, the version is rolled back and its error is returned.
    pub fn rotate_encryption_key_with<F>(&self, rekey: F) -> Result<u32>
    where
        F: FnOnce(u32, u32) -> Result<()>,
    {
        let (old, new) = {
            let mut state = self.state.write();
            if state.master.is_none() {
                return Err(Error::NotInitialized);
            }
            let old = state.key_version;
            state.key_version = old
                .checked_add(1)
                .ok_or_else(|| Error::Internal("key version exhausted".into()))?;
            state.cache.clear();
            (old, state.key_version)
        };

        if let Err(e) = rekey(old, new) {
            let mut state = self.state.write();
            if state.key_version == new {
                state.key_version = old;
            }
            tracing::warn!("Key rotation to v{} failed, rolled back to v{}: {}", new, old, e);
            return Err(e);
        }

        tracing::info!("Vault key rotated from v{} to v{}", old, new);
        Ok(new)
    }

    /// Export the master key, encrypted under `password`
    ///
    /// Returns the JSON of a [`KeyBackup`].
    pub fn export_key_backup(&self, password: &str) -> Result<String> {
        let (raw_master, version) = {
            let state = self.state.read();
            let master = state.master.as_ref().ok_or(Error::NotInitialized)?;
            (Zeroizing::new(self.provider.export_key(master)), state.key_version)
        };

        let mut payload = KeyBackupPayload {
            version,
            timestamp: self.clock.now_millis(),
            master_key: encode_b64(&raw_master),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        payload.master_key.zeroize();

        let salt = self.provider.random_bytes(BACKUP_SALT_LEN)?;
        let wrapping = self
            .provider
            .derive_password_key(password.as_bytes(), &salt, BACKUP_KEY_ITERATIONS)?;
        let (nonce, ciphertext) = self.provider.encrypt(&wrapping, &plaintext, KEY_BACKUP_FORMAT.as_bytes())?;

        let backup = KeyBackup {
            salt: encode_b64(&salt),
            iv: encode_b64(nonce.as_bytes()),
            data: encode_b64(&ciphertext),
            format: KEY_BACKUP_FORMAT.to_string(),
        };

        tracing::info!("Exported vault key backup at version {}", version);
        Ok(serde_json::to_string(&backup)?)
    }

    /// Restore the master key and version from an exported backup
    ///
    /// A wrong password fails with `AuthenticationFailed`; an unknown format
    /// or malformed field with `InvalidEnvelope`.
    pub fn import_key_backup(&self, backup_json: &str, password: &str) -> Result<()> {
        let backup: KeyBackup =
            serde_json::from_str(backup_json).map_err(|e| Error::InvalidEnvelope(format!("Unreadable backup: {}", e)))?;
        if backup.format != KEY_BACKUP_FORMAT {
            return Err(Error::InvalidEnvelope(format!("Unsupported backup format '{}'", backup.format)));
        }

        let salt = decode_b64(&backup.salt)?;
        let iv = decode_b64(&backup.iv)?;
        let ciphertext = decode_b64(&backup.data)?;
        let nonce = crate::crypto::Nonce::from_slice(&iv)?;

        let wrapping = self
            .provider
            .derive_password_key(password.as_bytes(), &salt, BACKUP_KEY_ITERATIONS)?;
        let plaintext = Zeroizing::new(
            self.provider
                .decrypt(&wrapping, &nonce, &ciphertext, KEY_BACKUP_FORMAT.as_bytes())?,
        );

        let mut payload: KeyBackupPayload = serde_json::from_slice(&plaintext)?;
        let raw_master = Zeroizing::new(decode_b64(&payload.master_key)?);
        payload.master_key.zeroize();
        let master = self.provider.import_key(&raw_master)?;

        let mut state = self.state.write();
        state.master = Some(master);
        state.key_version = payload.version;
        state.cache.clear();

        tracing::info!("Imported vault key backup at version {}", payload.version);
        Ok(())
    }

    /// Round-trip a sample message through `context` to check the key is usable
    pub fn verify_key_integrity(&self, context: &str) -> bool {
        if !self.is_ready() {
            return false;
        }

        let result = self
            .encrypt_text(INTEGRITY_PROBE, context)
            .and_then(|encrypted| self.decrypt_text(&encrypted, context));

        match result {
            Ok(text) => text == INTEGRITY_PROBE,
            Err(e) => {
                tracing::warn!("Integrity check failed for context '{}': {}", context, e);
                false
            }
        }
    }

    /// Random key material of `len` bytes
    pub fn generate_random_key(&self, len: usize) -> Result<Vec<u8>> {
        self.provider.random_bytes(len)
    }

    /// Drop the master key and every cached key
    pub fn clear_all_data(&self) {
        let mut state = self.state.write();
        state.master = None;
        state.cache.clear();
        tracing::info!("Vault cleared");
    }

    /// Drop cached keys past their TTL
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.state.write().cache.evict_expired(now)
    }

    fn context_key(&self, context: &str, version: u32) -> Result<EncryptionKey> {
        let id = ContextKeyCache::cache_id(context, version);
        let now = self.clock.now_millis();

        let mut state = self.state.write();
        if let Some(key) = state.cache.get(&id, now) {
            return Ok(key);
        }

        let master = state.master.as_ref().ok_or(Error::NotInitialized)?;
        let (salt, info) = kdf::context_labels(context, version);
        let key = self
            .provider
            .derive_subkey(master.as_bytes(), salt.as_bytes(), info.as_bytes())?;
        state.cache.insert(id, key.clone(), now);
        Ok(key)
    }
}

fn context_aad(context: &str, version: u32) -> Vec<u8> {
    format!("{}:v{}", context, version).into_bytes()
}

// ============================================================================
// TESTS
// ============================================================================
