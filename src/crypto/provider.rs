//! Crypto capability used by the vault and ratchet.
//!
//! Components never call primitives directly. They hold an
//! `Arc<dyn CryptoProvider>`, which lets a platform keystore or hardware
//! backend stand in for the default pure-Rust implementation.

use super::encryption::{self, EncryptionKey, Nonce};
use super::{kdf, random};
use crate::error::Result;

/// Key derivation, AEAD and randomness behind one interface
pub trait CryptoProvider: Send + Sync {
    /// PBKDF2-HMAC-SHA256 over `secret` and `salt`
    fn derive_password_key(&self, secret: &[u8], salt: &[u8], iterations: u32) -> Result<EncryptionKey>;

    /// HKDF-SHA256 subkey
    fn derive_subkey(&self, ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<EncryptionKey>;

    /// AES-256-GCM with a fresh random nonce
    fn encrypt(&self, key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)>;

    /// AES-256-GCM decryption; any mismatch is `AuthenticationFailed`
    fn decrypt(&self, key: &EncryptionKey, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Cryptographically random bytes
    fn random_bytes(&self, len: usize) -> Result<Vec<u8>>;

    /// Import raw key bytes
    fn import_key(&self, raw: &[u8]) -> Result<EncryptionKey> {
        EncryptionKey::from_slice(raw)
    }

    /// Export raw key bytes
    fn export_key(&self, key: &EncryptionKey) -> Vec<u8> {
        key.as_bytes().to_vec()
    }
}

/// Default provider built on the RustCrypto crates
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoProvider;

impl CryptoProvider for RustCryptoProvider {
    fn derive_password_key(&self, secret: &[u8], salt: &[u8], iterations: u32) -> Result<EncryptionKey> {
        kdf::derive_password_key(secret, salt, iterations)
    }

    fn derive_subkey(&self, ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<EncryptionKey> {
        kdf::derive_subkey(ikm, salt, info)
    }

    fn encrypt(&self, key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
        encryption::encrypt(key, plaintext, aad)
    }

    fn decrypt(&self, key: &EncryptionKey, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        encryption::decrypt(key, nonce, ciphertext, aad)
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        random::random_bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_export_round_trip() {
        let provider = RustCryptoProvider;
        let raw = provider.random_bytes(32).unwrap();
        let key = provider.import_key(&raw).unwrap();
        assert_eq!(provider.export_key(&key), raw);
        assert!(provider.import_key(&raw[..16]).is_err());
    }

    #[test]
    fn test_provider_aead() {
        let provider = RustCryptoProvider;
        let key = provider.derive_subkey(b"ikm", b"salt", b"info").unwrap();
        let (nonce, ct) = provider.encrypt(&key, b"payload", b"aad").unwrap();
        assert_eq!(provider.decrypt(&key, &nonce, &ct, b"aad").unwrap(), b"payload");
    }
}
