//! # Wire Records
//!
//! JSON shapes that leave the engine: encrypted messages, vault payloads,
//! ratchet key-state exports and vault key backups. Binary fields are
//! standard base64; optional fields are omitted when absent.
//!
//! ```text
//! EncryptedMessage  { ciphertext, iv, ephemeralKeyExport?, counter?, previousCounter? }
//! EncryptedData     { ciphertext, iv, keyVersion? }
//! KeyStateExport    { rootKey, chainKey, counter }
//! KeyBackup         { salt, iv, data, format: "snakkaz-key-backup-v1" }
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::crypto::Nonce;
use crate::error::{Error, Result};

/// Format tag of vault key backups
pub const KEY_BACKUP_FORMAT: &str = "snakkaz-key-backup-v1";

/// Base64-encode bytes for a wire field
pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 wire field
pub fn decode_b64(field: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(field)?)
}

/// A ratchet-encrypted message
///
/// The ratchet always fills every field. They are optional on the wire so
/// the same envelope can carry payloads from peers that omit them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    /// Ciphertext with GCM tag
    pub ciphertext: String,
    /// 96-bit nonce
    pub iv: String,
    /// Non-secret fingerprint of the message key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_key_export: Option<String>,
    /// Counter the message key was derived at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    /// Counter of the previous message in the same chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_counter: Option<u64>,
}

impl EncryptedMessage {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A vault-encrypted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedData {
    /// Ciphertext with GCM tag
    pub ciphertext: String,
    /// 96-bit nonce
    pub iv: String,
    /// Vault key version used; absent means the vault's current version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
}

impl EncryptedData {
    pub(crate) fn new(nonce: &Nonce, ciphertext: &[u8], key_version: u32) -> Self {
        Self {
            ciphertext: encode_b64(ciphertext),
            iv: encode_b64(nonce.as_bytes()),
            key_version: Some(key_version),
        }
    }

    /// Decode the nonce and ciphertext
    ///
    /// Malformed fields surface as `AuthenticationFailed`, the same as a bad
    /// tag, so decrypt errors never reveal which part was wrong.
    pub(crate) fn decode(&self) -> Result<(Nonce, Vec<u8>)> {
        let iv = decode_b64(&self.iv).map_err(|_| Error::AuthenticationFailed)?;
        let ciphertext = decode_b64(&self.ciphertext).map_err(|_| Error::AuthenticationFailed)?;
        Ok((Nonce::from_slice(&iv)?, ciphertext))
    }
}

/// Exported ratchet state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStateExport {
    /// Root key, base64
    pub root_key: String,
    /// Current chain key, base64
    pub chain_key: String,
    /// Next message counter
    pub counter: u64,
}

/// Password-protected vault key backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackup {
    /// PBKDF2 salt, base64
    pub salt: String,
    /// AES-GCM nonce, base64
    pub iv: String,
    /// Encrypted backup payload, base64
    pub data: String,
    /// Always [`KEY_BACKUP_FORMAT`]
    pub format: String,
}

/// Plaintext inside a [`KeyBackup`]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeyBackupPayload {
    pub version: u32,
    pub timestamp: i64,
    pub master_key: String,
}

// ============================================================================
// TESTS
// ============================================================================
