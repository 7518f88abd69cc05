//! Root, chain and message key derivation.
//!
//! ```text
//! identity_key || conversation_id
//!         │  HKDF(salt = conversation_id, info = RATCHET_ROOT)
//!         ▼
//!     Root Key ──HKDF(salt = counter, info = RATCHET_CHAIN)──► Chain Key(n)
//!                                                                │
//!                         HKDF(salt = counter, info = RATCHET_MESSAGE)
//!                                                                ▼
//!                                                         Message Key(n)
//! ```
//!
//! Every step is a one-way HKDF expansion. Holding Message Key(n) gives no
//! path back to the chain key, the root, or any other message key.

use crate::crypto::kdf::domain;
use crate::crypto::{CryptoProvider, EncryptionKey};
use crate::error::Result;

/// Root key for a conversation
pub(crate) fn derive_root_key(
    provider: &dyn CryptoProvider,
    identity_key: &[u8],
    conversation_id: &str,
) -> Result<EncryptionKey> {
    let mut ikm = zeroize::Zeroizing::new(Vec::with_capacity(identity_key.len() + conversation_id.len()));
    ikm.extend_from_slice(identity_key);
    ikm.extend_from_slice(conversation_id.as_bytes());
    provider.derive_subkey(&ikm, conversation_id.as_bytes(), domain::RATCHET_ROOT)
}

/// Chain key seeded from the root at `counter`
pub(crate) fn derive_chain_key(
    provider: &dyn CryptoProvider,
    root: &EncryptionKey,
    counter: u64,
) -> Result<EncryptionKey> {
    provider.derive_subkey(root.as_bytes(), &counter.to_be_bytes(), domain::RATCHET_CHAIN)
}

/// Message key for `counter` from its chain key
pub(crate) fn derive_message_key(
    provider: &dyn CryptoProvider,
    chain: &EncryptionKey,
    counter: u64,
) -> Result<EncryptionKey> {
    provider.derive_subkey(chain.as_bytes(), &counter.to_be_bytes(), domain::RATCHET_MESSAGE)
}

/// Message key for `counter` straight from the root
pub(crate) fn message_key_at(
    provider: &dyn CryptoProvider,
    root: &EncryptionKey,
    counter: u64,
) -> Result<EncryptionKey> {
    let chain = derive_chain_key(provider, root, counter)?;
    derive_message_key(provider, &chain, counter)
}

/// Root of the lineage that starts when exported state is imported
///
/// Every device importing the same `(root, chain, counter)` lands on the
/// same new root. The exporting device's own lineage is left behind.
pub(crate) fn derive_import_root(
    provider: &dyn CryptoProvider,
    root: &EncryptionKey,
    chain: &EncryptionKey,
    counter: u64,
) -> Result<EncryptionKey> {
    let mut ikm = zeroize::Zeroizing::new([0u8; 64]);
    ikm[..32].copy_from_slice(root.as_bytes());
    ikm[32..].copy_from_slice(chain.as_bytes());
    provider.derive_subkey(ikm.as_ref(), &counter.to_be_bytes(), domain::RATCHET_IMPORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;

    #[test]
    fn test_root_key_binds_identity_and_conversation() {
        let p = RustCryptoProvider;
        let a = derive_root_key(&p, b"id-1", "conv-A").unwrap();
        assert_eq!(a, derive_root_key(&p, b"id-1", "conv-A").unwrap());
        assert_ne!(a, derive_root_key(&p, b"id-2", "conv-A").unwrap());
        assert_ne!(a, derive_root_key(&p, b"id-1", "conv-B").unwrap());
    }

    #[test]
    fn test_message_keys_are_distinct_per_counter() {
        let p = RustCryptoProvider;
        let root = derive_root_key(&p, b"id-1", "conv-A").unwrap();
        let keys: Vec<_> = (0..8).map(|n| message_key_at(&p, &root, n).unwrap()).collect();
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j]);
            }
        }
        let chain = derive_chain_key(&p, &root, 3).unwrap();
        assert_ne!(chain, keys[3]);
        assert_ne!(root, keys[0]);
    }

    #[test]
    fn test_import_root_differs_from_source_root() {
        let p = RustCryptoProvider;
        let root = derive_root_key(&p, b"id-1", "conv-A").unwrap();
        let chain = derive_chain_key(&p, &root, 3).unwrap();
        let forked = derive_import_root(&p, &root, &chain, 3).unwrap();
        assert_ne!(forked, root);
        assert_eq!(forked, derive_import_root(&p, &root, &chain, 3).unwrap());
    }
}
