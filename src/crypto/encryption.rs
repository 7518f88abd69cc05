//! # Encryption Module
//!
//! AES-256-GCM for payload confidentiality and integrity.
//!
//! ## Encryption Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PAYLOAD ENCRYPTION FLOW                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Step 1: Obtain a 256-bit key                                          │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  vault:   HKDF(master, "snakkaz-{context}-salt-v{n}")        │       │
//! │  │  ratchet: HKDF(chain key, counter)                           │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Step 2: Generate a fresh 96-bit nonce (OsRng)                         │
//! │                                                                         │
//! │  Step 3: AES-256-GCM                                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  ciphertext || tag = AES-GCM(key, nonce, plaintext, aad)     │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Decryption fails with AuthenticationFailed on any mismatch:           │
//! │  wrong key, wrong nonce, tampered ciphertext or tag, wrong AAD.        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! | Property | Guarantee |
//! |----------|-----------|
//! | Confidentiality | Only holders of the key can read the payload |
//! | Integrity | Any modification is detected |
//! | Binding | AAD ties the payload to its counter / context |

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce as AesNonce,
};
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::crypto::random::fill_random;
use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of a key fingerprint in bytes
pub const FINGERPRINT_SIZE: usize = 16;

const FINGERPRINT_DOMAIN: &[u8] = b"snakkaz-key-fingerprint-v1";

/// A nonce (number used once) for AES-GCM encryption
///
/// **NEVER reuse a nonce with the same key.** Nonces are random, which is
/// safe for up to 2^32 messages per key (birthday bound for 96 bits).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Result<Self> {
        let mut bytes = [0u8; NONCE_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, rejecting anything that is not 12 bytes
    ///
    /// A wrong-length IV is reported as an authentication failure so callers
    /// cannot tell it apart from a bad tag.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| Error::AuthenticationFailed)?;
        Ok(Self(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// An AES-256-GCM encryption key
///
/// Zeroized when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len())))?;
        Ok(Self(arr))
    }

    /// Borrow the raw key bytes (for key derivation chains)
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Non-secret identifier of this key
    ///
    /// Truncated SHA-256 over a domain tag and the key. Safe to put on the
    /// wire; two parties holding the same key compute the same value.
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(self.0);
        let digest = hasher.finalize();
        let mut out = [0u8; FINGERPRINT_SIZE];
        out.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        out
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey({})", hex::encode(self.fingerprint()))
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        crate::crypto::random::constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for EncryptionKey {}

/// A prepared AES-256-GCM cipher
///
/// Holds the expanded key schedule so repeated operations under the same
/// key skip key setup. The schedule is zeroized on drop.
#[derive(Clone)]
pub struct CipherHandle(Aes256Gcm);

impl CipherHandle {
    /// Prepare a cipher for `key`
    pub fn new(key: &EncryptionKey) -> Self {
        Self(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)))
    }

    /// Encrypt with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
        let nonce = Nonce::random()?;
        let payload = Payload { msg: plaintext, aad };

        let ciphertext = self
            .0
            .encrypt(AesNonce::from_slice(&nonce.0), payload)
            .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?;

        Ok((nonce, ciphertext))
    }

    /// Decrypt and authenticate
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };

        self.0
            .decrypt(AesNonce::from_slice(&nonce.0), payload)
            .map_err(|_| Error::AuthenticationFailed)
    }
}

impl fmt::Debug for CipherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherHandle(..)")
    }
}

/// Encrypt a payload using AES-256-GCM
///
/// ## Returns
///
/// Tuple of (nonce, ciphertext_with_tag)
///
/// ## Example
///
/// ```ignore
/// let key = EncryptionKey::from_bytes([0u8; 32]);
/// let (nonce, ciphertext) = encrypt(&key, b"hei", b"chat-42")?;
/// ```
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
    CipherHandle::new(key).encrypt(plaintext, aad)
}

/// Decrypt a payload using AES-256-GCM
///
/// ## Errors
///
/// Returns `AuthenticationFailed` if the key, nonce, ciphertext, tag or AAD
/// differ from what was used to encrypt.
pub fn decrypt(key: &EncryptionKey, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    CipherHandle::new(key).decrypt(nonce, ciphertext, aad)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_basic() {
        let key = EncryptionKey::from_bytes([42u8; 32]);
        let plaintext = b"Hello, World!";
        let aad = b"context";

        let (nonce, ciphertext) = encrypt(&key, plaintext, aad).unwrap();
        let decrypted = decrypt(&key, &nonce, &ciphertext, aad).unwrap();

        assert_eq!(decrypted, plaintext);
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let key = EncryptionKey::from_bytes([42u8; 32]);

        let (nonce, ciphertext) = encrypt(&key, b"", b"").unwrap();
        let decrypted = decrypt(&key, &nonce, &ciphertext, b"").unwrap();

        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::from_bytes([42u8; 32]);
        let (nonce, mut ciphertext) = encrypt(&key, b"Hello, World!", b"context").unwrap();

        ciphertext[0] ^= 0xFF;

        let result = decrypt(&key, &nonce, &ciphertext, b"context");
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = EncryptionKey::from_bytes([42u8; 32]);
        let (nonce, ciphertext) = encrypt(&key, b"Hello, World!", b"context").unwrap();

        let result = decrypt(&key, &nonce, &ciphertext, b"other");
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_different_nonces_produce_different_ciphertext() {
        let key = EncryptionKey::from_bytes([7u8; 32]);
        let (n1, c1) = encrypt(&key, b"same", b"").unwrap();
        let (n2, c2) = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_nonce_from_slice_rejects_wrong_length() {
        assert!(Nonce::from_slice(&[0u8; 12]).is_ok());
        assert!(matches!(Nonce::from_slice(&[0u8; 11]), Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_key_from_slice_and_fingerprint() {
        assert!(EncryptionKey::from_slice(&[1u8; 31]).is_err());
        let a = EncryptionKey::from_slice(&[1u8; 32]).unwrap();
        let b = EncryptionKey::from_bytes([1u8; 32]);
        let c = EncryptionKey::from_bytes([2u8; 32]);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(!format!("{:?}", a).contains(&hex::encode([1u8; 32])));
    }

    #[test]
    fn test_cipher_handle_reuse() {
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let handle = CipherHandle::new(&key);
        for i in 0..4u8 {
            let (nonce, ct) = handle.encrypt(&[i; 10], b"aad").unwrap();
            assert_eq!(decrypt(&key, &nonce, &ct, b"aad").unwrap(), vec![i; 10]);
        }
    }
}
