//! # Ratchet Engine
//!
//! Forward-secret message encryption for one conversation.
//!
//! ## State Machine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RATCHET LIFECYCLE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Uninitialized ──initialize(identity, conversation)──► Ready           │
//! │                                                          │  ▲           │
//! │                                  encrypt / decrypt ──────┘  │           │
//! │                                  import_key_state ──────────┘           │
//! │                                                          │              │
//! │                                               dispose ───▼              │
//! │                                                       Disposed          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Encrypt
//!
//! ```text
//!  counter n ──► MessageKey(n) = HKDF(ChainKey(n), n)
//!            ──► AES-256-GCM(plaintext, aad = n || previousCounter)
//!            ──► cache MessageKey(n); previousCounter = n; counter = n + 1
//!            ──► ChainKey(n + 1) = HKDF(RootKey, n + 1)
//! ```
//!
//! ## Decrypt
//!
//! 1. Cached key for the envelope's counter? Use it.
//! 2. Otherwise reject counters more than [`RATCHET_ITERATION_LIMIT`] away
//!    from the live counter with `CounterOutOfRange`.
//! 3. Replay from the root to regenerate the key, caching the skipped keys
//!    between the live counter and the requested one. At most half a cache
//!    of skipped keys is kept, and keys older than the oldest cached one are
//!    not regenerated. The live chain key and counter are never touched by
//!    a replay.
//! 4. If the regenerated key's fingerprint differs from the envelope's
//!    `ephemeralKeyExport`, fail with `MissingKeyMaterial`.
//!
//! ## Import
//!
//! Importing exported state starts a new lineage: the root becomes
//! `HKDF(root || chain, counter)`. Devices that import the same snapshot
//! share that lineage; the exporter does not. Messages in flight under the
//! old lineage cannot be read by the importer, and vice versa.
//!
//! Encrypt and decrypt take the engine's lock for their whole duration, so
//! concurrent callers on one conversation are serialized.

mod chain;
mod state;

pub use state::MessageKeyCache;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::{CryptoProvider, EncryptionKey, RustCryptoProvider};
use crate::envelope::{decode_b64, encode_b64, EncryptedMessage, KeyStateExport};
use crate::error::{Error, Result};
use state::RatchetState;

/// Largest distance between the live counter and a requested counter
pub const RATCHET_ITERATION_LIMIT: u64 = 1000;

/// Maximum number of cached message keys per conversation
pub const MESSAGE_KEY_CACHE_MAX: usize = 500;

enum Phase {
    Uninitialized,
    Ready(RatchetState),
    Disposed,
}

/// Ratchet for one conversation
pub struct RatchetEngine {
    provider: Arc<dyn CryptoProvider>,
    phase: Mutex<Phase>,
}

impl Default for RatchetEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RatchetEngine {
    /// Create an uninitialized engine on the default crypto provider
    pub fn new() -> Self {
        Self::with_provider(Arc::new(RustCryptoProvider))
    }

    /// Create an uninitialized engine on `provider`
    pub fn with_provider(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            phase: Mutex::new(Phase::Uninitialized),
        }
    }

    /// Seed the ratchet from an identity key and conversation id
    ///
    /// Resets the counter to zero and drops cached keys.
    pub fn initialize(&self, identity_key: &[u8], conversation_id: &str) -> Result<()> {
        let p = self.provider.as_ref();
        let root = chain::derive_root_key(p, identity_key, conversation_id)?;
        let chain_key = chain::derive_chain_key(p, &root, 0)?;

        let mut phase = self.phase.lock();
        if matches!(*phase, Phase::Disposed) {
            return Err(Error::Disposed);
        }
        *phase = Phase::Ready(RatchetState {
            root,
            chain: chain_key,
            counter: 0,
            previous_counter: 0,
            cache: MessageKeyCache::new(MESSAGE_KEY_CACHE_MAX),
        });

        tracing::debug!("Ratchet initialized for conversation {}", conversation_id);
        Ok(())
    }

    /// Whether the engine holds key material
    pub fn is_ready(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Ready(_))
    }

    /// Counter the next encrypted message will use
    pub fn counter(&self) -> Result<u64> {
        let mut phase = self.phase.lock();
        Ok(ready(&mut phase)?.counter)
    }

    /// Number of cached message keys
    pub fn cached_key_count(&self) -> Result<usize> {
        let mut phase = self.phase.lock();
        Ok(ready(&mut phase)?.cache.len())
    }

    /// Encrypt one message and advance the ratchet
    pub fn encrypt_message(&self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let mut phase = self.phase.lock();
        let state = ready(&mut phase)?;
        let p = self.provider.as_ref();

        let counter = state.counter;
        let previous = state.previous_counter;
        let next = counter
            .checked_add(1)
            .ok_or_else(|| Error::Internal("ratchet counter exhausted".into()))?;
        let message_key = chain::derive_message_key(p, &state.chain, counter)?;
        let next_chain = chain::derive_chain_key(p, &state.root, next)?;

        let (nonce, ciphertext) = p.encrypt(&message_key, plaintext, &message_aad(counter, previous))?;
        let fingerprint = message_key.fingerprint();

        state.cache.insert(counter, message_key);
        state.previous_counter = counter;
        state.counter = next;
        state.chain = next_chain;

        Ok(EncryptedMessage {
            ciphertext: encode_b64(&ciphertext),
            iv: encode_b64(nonce.as_bytes()),
            ephemeral_key_export: Some(encode_b64(&fingerprint)),
            counter: Some(counter),
            previous_counter: Some(previous),
        })
    }

    /// Encrypt a UTF-8 message
    pub fn encrypt_text(&self, plaintext: &str) -> Result<EncryptedMessage> {
        self.encrypt_message(plaintext.as_bytes())
    }

    /// Decrypt a message from this conversation
    pub fn decrypt_message(&self, envelope: &EncryptedMessage) -> Result<Vec<u8>> {
        let requested = envelope
            .counter
            .ok_or_else(|| Error::InvalidEnvelope("message has no counter".into()))?;
        let previous = envelope.previous_counter.unwrap_or(0);
        let iv = decode_b64(&envelope.iv).map_err(|_| Error::AuthenticationFailed)?;
        let nonce = crate::crypto::Nonce::from_slice(&iv)?;
        let ciphertext = decode_b64(&envelope.ciphertext).map_err(|_| Error::AuthenticationFailed)?;
        let expected_fingerprint = match &envelope.ephemeral_key_export {
            Some(export) => Some(decode_b64(export)?),
            None => None,
        };

        let mut phase = self.phase.lock();
        let state = ready(&mut phase)?;
        let p = self.provider.as_ref();

        let message_key = match state.cache.get(requested) {
            Some(key) => key.clone(),
            None => {
                if state.counter.abs_diff(requested) > RATCHET_ITERATION_LIMIT {
                    return Err(Error::CounterOutOfRange {
                        requested,
                        current: state.counter,
                        limit: RATCHET_ITERATION_LIMIT,
                    });
                }
                replay(p, state, requested)?
            }
        };

        if let Some(expected) = expected_fingerprint {
            if !crate::crypto::constant_time_eq(&message_key.fingerprint(), &expected) {
                return Err(Error::MissingKeyMaterial(requested));
            }
        }

        p.decrypt(&message_key, &nonce, &ciphertext, &message_aad(requested, previous))
    }

    /// Decrypt a message and interpret it as UTF-8
    pub fn decrypt_message_text(&self, envelope: &EncryptedMessage) -> Result<String> {
        let bytes = self.decrypt_message(envelope)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidEnvelope("message is not UTF-8".into()))
    }

    /// Export `{rootKey, chainKey, counter}` for another device
    pub fn export_key_state(&self) -> Result<KeyStateExport> {
        let mut phase = self.phase.lock();
        let state = ready(&mut phase)?;
        Ok(KeyStateExport {
            root_key: encode_b64(state.root.as_bytes()),
            chain_key: encode_b64(state.chain.as_bytes()),
            counter: state.counter,
        })
    }

    /// Replace local state with a fork of exported state
    ///
    /// Cached message keys are discarded. Works on an uninitialized engine.
    /// A counter of `u64::MAX` leaves no room to encrypt and is rejected.
    pub fn import_key_state(&self, exported: &KeyStateExport) -> Result<()> {
        if exported.counter == u64::MAX {
            return Err(Error::InvalidEnvelope("exported counter is exhausted".into()));
        }
        let p = self.provider.as_ref();
        let root = p.import_key(&zeroize::Zeroizing::new(decode_b64(&exported.root_key)?))?;
        let chain_key = p.import_key(&zeroize::Zeroizing::new(decode_b64(&exported.chain_key)?))?;

        let forked_root = chain::derive_import_root(p, &root, &chain_key, exported.counter)?;
        let forked_chain = chain::derive_chain_key(p, &forked_root, exported.counter)?;

        let mut phase = self.phase.lock();
        if matches!(*phase, Phase::Disposed) {
            return Err(Error::Disposed);
        }
        *phase = Phase::Ready(RatchetState {
            root: forked_root,
            chain: forked_chain,
            counter: exported.counter,
            previous_counter: exported.counter.saturating_sub(1),
            cache: MessageKeyCache::new(MESSAGE_KEY_CACHE_MAX),
        });

        tracing::info!("Ratchet state imported at counter {}", exported.counter);
        Ok(())
    }

    /// Drop all key material; every later call fails with `Disposed`
    pub fn dispose(&self) {
        *self.phase.lock() = Phase::Disposed;
    }
}

fn ready(phase: &mut Phase) -> Result<&mut RatchetState> {
    match phase {
        Phase::Ready(state) => Ok(state),
        Phase::Uninitialized => Err(Error::NotInitialized),
        Phase::Disposed => Err(Error::Disposed),
    }
}

/// Regenerate the key for `requested` without moving the live chain
///
/// Keys for counters between the live counter and `requested` are cached
/// so the rest of an out-of-order batch hits the cache. Counters below the
/// oldest cached key, or more than half a cache behind `requested`, are
/// not regenerated; they would only be evicted again.
fn replay(p: &dyn CryptoProvider, state: &mut RatchetState, requested: u64) -> Result<EncryptionKey> {
    let target = chain::message_key_at(p, &state.root, requested)?;

    let window_start = requested.saturating_sub((MESSAGE_KEY_CACHE_MAX / 2) as u64);
    let start = state
        .counter
        .max(window_start)
        .max(state.cache.oldest().unwrap_or(0));
    for skipped in start..requested {
        if state.cache.get(skipped).is_none() {
            let key = chain::message_key_at(p, &state.root, skipped)?;
            state.cache.insert(skipped, key);
        }
    }
    state.cache.insert(requested, target.clone());

    Ok(target)
}

fn message_aad(counter: u64, previous_counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32);
    aad.extend_from_slice(b"snakkaz-ratchet-v1");
    aad.extend_from_slice(&counter.to_be_bytes());
    aad.extend_from_slice(&previous_counter.to_be_bytes());
    aad
}

// ============================================================================
// TESTS
// ============================================================================
