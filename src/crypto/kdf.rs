//! # Key Derivation
//!
//! Two KDFs cover every key in the engine:
//!
//! ```text
//! secret + salt ──PBKDF2-HMAC-SHA256 (100k)──► master key
//!                                                 │
//!                 ┌───────────────────────────────┤
//!                 │                               │
//!  HKDF(salt="snakkaz-chat-42-salt-v1",   HKDF(salt="snakkaz-chat-43-salt-v1",
//!       info="snakkaz-chat-42-info-v1")        info="snakkaz-chat-43-info-v1")
//!                 │                               │
//!                 ▼                               ▼
//!         context key "chat-42"           context key "chat-43"
//! ```
//!
//! Password hashes and backup wrapping keys use PBKDF2 alone with their own
//! iteration counts. Ratchet keys use HKDF with the labels in [`domain`].
//!
//! | Use | KDF | Iterations |
//! |-----|-----|------------|
//! | Master key | PBKDF2-HMAC-SHA256 | 100 000 |
//! | Password hash | PBKDF2-HMAC-SHA256 | 210 000 |
//! | Backup wrapping key | PBKDF2-HMAC-SHA256 | 250 000 |
//! | Context / ratchet keys | HKDF-SHA256 | n/a |

use hkdf::Hkdf;
use hmac::Hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::encryption::{EncryptionKey, KEY_SIZE};
use crate::error::{Error, Result};

/// PBKDF2 iterations for the vault master key
pub const MASTER_KEY_ITERATIONS: u32 = 100_000;

/// PBKDF2 iterations for password hashes
pub const PASSWORD_HASH_ITERATIONS: u32 = 210_000;

/// PBKDF2 iterations for key backup wrapping keys
pub const BACKUP_KEY_ITERATIONS: u32 = 250_000;

/// Domain separation labels for HKDF
pub mod domain {
    /// Prefix for vault context salts and infos
    pub const CONTEXT_PREFIX: &str = "snakkaz";

    /// Root key from identity key + conversation id
    pub const RATCHET_ROOT: &[u8] = b"snakkaz-ratchet-root-v1";

    /// Chain key from root key + counter
    pub const RATCHET_CHAIN: &[u8] = b"snakkaz-ratchet-chain-v1";

    /// Message key from chain key + counter
    pub const RATCHET_MESSAGE: &[u8] = b"snakkaz-ratchet-message-v1";

    /// New root when a ratchet imports exported state
    pub const RATCHET_IMPORT: &[u8] = b"snakkaz-ratchet-import-v1";
}

/// Derive a key from a secret with PBKDF2-HMAC-SHA256
pub fn derive_password_key(secret: &[u8], salt: &[u8], iterations: u32) -> Result<EncryptionKey> {
    if iterations == 0 {
        return Err(Error::KeyDerivationFailed("PBKDF2 iteration count must be positive".into()));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt, iterations, key.as_mut())
        .map_err(|e| Error::KeyDerivationFailed(format!("PBKDF2 failed: {}", e)))?;

    Ok(EncryptionKey::from_bytes(*key))
}

/// Derive a 256-bit subkey with HKDF-SHA256
pub fn derive_subkey(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<EncryptionKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(info, key.as_mut())
        .map_err(|_| Error::KeyDerivationFailed("HKDF expansion failed".into()))?;

    Ok(EncryptionKey::from_bytes(*key))
}

/// HKDF `(salt, info)` for one vault context at one key version
///
/// Both embed the context and version, so no two `(context, version)`
/// pairs share a key.
pub fn context_labels(context: &str, version: u32) -> (String, String) {
    (
        format!("{}-{}-salt-v{}", domain::CONTEXT_PREFIX, context, version),
        format!("{}-{}-info-v{}", domain::CONTEXT_PREFIX, context, version),
    )
}

/// Derive the key for one vault context at one key version
pub fn derive_context_key(master: &EncryptionKey, context: &str, version: u32) -> Result<EncryptionKey> {
    let (salt, info) = context_labels(context, version);
    derive_subkey(master.as_bytes(), salt.as_bytes(), info.as_bytes())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_key_deterministic() {
        let a = derive_password_key(b"s1", b"salt1", 1_000).unwrap();
        let b = derive_password_key(b"s1", b"salt1", 1_000).unwrap();
        let c = derive_password_key(b"s1", b"salt2", 1_000).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let result = derive_password_key(b"s1", b"salt1", 0);
        assert!(matches!(result, Err(Error::KeyDerivationFailed(_))));
    }

    #[test]
    fn test_context_keys_are_isolated() {
        let master = EncryptionKey::from_bytes([3u8; 32]);
        let k42 = derive_context_key(&master, "chat-42", 1).unwrap();
        let k43 = derive_context_key(&master, "chat-43", 1).unwrap();
        let k42v2 = derive_context_key(&master, "chat-42", 2).unwrap();
        assert_ne!(k42, k43);
        assert_ne!(k42, k42v2);
        assert_eq!(k42, derive_context_key(&master, "chat-42", 1).unwrap());
    }

    #[test]
    fn test_context_labels() {
        let (salt, info) = context_labels("chat-42", 1);
        assert_eq!(salt, "snakkaz-chat-42-salt-v1");
        assert_eq!(info, "snakkaz-chat-42-info-v1");
    }

    #[test]
    fn test_subkey_labels_separate_keys() {
        let root = derive_subkey(b"ikm", b"salt", domain::RATCHET_ROOT).unwrap();
        let chain = derive_subkey(b"ikm", b"salt", domain::RATCHET_CHAIN).unwrap();
        assert_ne!(root, chain);
    }
}
