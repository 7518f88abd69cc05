//! # Snakkaz E2EE
//!
//! End-to-end encryption and key-lifecycle engine for the Snakkaz messenger.
//! Forward-secret message encryption, context-isolated storage keys, an
//! in-memory key store with rotation and anti-forensic erasure, burn-on-read
//! scheduling and battery-aware crypto.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SNAKKAZ E2EE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  │
//! │  │    Vault     │  │   Ratchet    │  │   KeyStore   │  │    Burn    │  │
//! │  │              │  │              │  │              │  │            │  │
//! │  │ - Master key │  │ - Root/chain │  │ - Rotation   │  │ - Tokens   │  │
//! │  │ - Contexts   │  │ - Counters   │  │ - Expiry     │  │ - Timers   │  │
//! │  │ - Backups    │  │ - Replay     │  │ - Wipe       │  │ - Destroy  │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘  └─────┬──────┘  │
//! │         │                 │                 │                │         │
//! │         └─────────────────┴────────┬────────┴────────────────┘         │
//! │                                    │                                    │
//! │  ┌──────────────┐  ┌──────────────┐│┌──────────────────────────────────┐│
//! │  │    Crypto    │  │    Power     │││  Scheduler / Clock               ││
//! │  │              │  │              │││                                  ││
//! │  │ - AES-GCM    │  │ - Handle     │└┤  - TokioScheduler (production)   ││
//! │  │ - PBKDF2     │  │   cache      │ │  - ManualScheduler (tests)       ││
//! │  │ - HKDF       │  │ - Deferral   │ │                                  ││
//! │  └──────────────┘  └──────────────┘ └──────────────────────────────────┘│
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`crypto`] - Random source, AES-256-GCM, key derivation, provider trait
//! - [`envelope`] - Wire records (encrypted messages, vault data, backups)
//! - [`vault`] - Master key and per-context derived keys
//! - [`ratchet`] - Forward-secret per-conversation message encryption
//! - [`keystore`] - In-memory key registry with rotation and cleanup
//! - [`burn`] - Burn-on-read destruction scheduling
//! - [`power`] - Battery-aware async encrypt/decrypt
//! - [`scheduler`] / [`time`] - Timer and clock capabilities
//! - [`lifecycle`] - Foreground/background signals
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Forward Secrecy (hash ratchet)                               │
//! │  ───────────────────────────────────────                                │
//! │  Each message uses a key derived one-way from the conversation root    │
//! │  and its counter. A leaked message key exposes only that message.      │
//! │                                                                         │
//! │  Layer 2: Context Isolation (HKDF)                                     │
//! │  ─────────────────────────────────                                      │
//! │  Stored data is encrypted under keys derived per context and version. │
//! │  A key for one chat cannot open data from another.                     │
//! │                                                                         │
//! │  Layer 3: Key Lifecycle                                                │
//! │  ──────────────────────                                                 │
//! │  Keys age out, rotate, and are overwritten with random bytes before    │
//! │  release. Backgrounding resets usage and burns protected messages.     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod burn;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keystore;
pub mod lifecycle;
pub mod power;
pub mod ratchet;
pub mod scheduler;
pub mod time;
pub mod vault;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use burn::{BurnConfig, BurnEvent, BurnOnReadScheduler, BurnReason, BurnToken, MessageDestroyer};
pub use crypto::{CryptoProvider, EncryptionKey, Nonce, RustCryptoProvider};
pub use envelope::{EncryptedData, EncryptedMessage, KeyBackup, KeyStateExport};
pub use error::{Error, Result};
pub use keystore::{KeyStoreConfig, KeyStoreEvent, SecureKeyStore};
pub use lifecycle::Visibility;
pub use power::{BatteryEfficientConfig, PowerAwareCryptoScheduler, PowerSignal};
pub use ratchet::RatchetEngine;
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
pub use time::{Clock, ManualClock, SystemClock};
pub use vault::{ContextKeyVault, VaultConfig};

// ============================================================================
// CORE INSTANCE
// ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Configuration for every component of the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Context key vault settings
    pub vault: VaultConfig,
    /// Secure key store limits
    pub key_store: KeyStoreConfig,
    /// Burn settings used by [`SecureMessagingCore::burn_after_read`]
    pub burn: BurnConfig,
    /// Power-aware scheduling
    pub power: BatteryEfficientConfig,
}

impl CoreConfig {
    /// Parse a camelCase JSON document; missing sections take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Key store id under which a conversation's ratchet identity key is kept
fn identity_key_id(conversation_id: &str) -> String {
    format!("ratchet-identity:{}", conversation_id)
}

/// The engine instance that owns and wires every component
///
/// ## Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                     SECURE MESSAGING LIFECYCLE                          │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. Construct                                                          │
/// │     SecureMessagingCore::new(config, scheduler, clock, destroyer)      │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  2. Unlock storage                                                     │
/// │     vault().initialize(secret, salt)                                   │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  3. Converse                                                           │
/// │     open_conversation(id, identity) ──► RatchetEngine                 │
/// │     burn_after_read(message_id)     ──► BurnToken                     │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  4. Background / foreground                                            │
/// │     on_visibility_change(Hidden) ──► key store, burn, power            │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  5. Shutdown                                                           │
/// │     shutdown() ──► timers cancelled, every key erased                  │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub struct SecureMessagingCore {
    config: CoreConfig,
    provider: Arc<dyn CryptoProvider>,
    vault: ContextKeyVault,
    key_store: SecureKeyStore,
    burn: BurnOnReadScheduler,
    power: PowerAwareCryptoScheduler,
    conversations: RwLock<HashMap<String, Arc<RatchetEngine>>>,
    shut_down: AtomicBool,
}

impl SecureMessagingCore {
    /// Build the engine on explicit timer, clock and storage collaborators
    pub fn new(
        config: CoreConfig,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        destroyer: Arc<dyn MessageDestroyer>,
    ) -> Self {
        tracing::info!("Initializing Snakkaz E2EE v{}", env!("CARGO_PKG_VERSION"));
        let provider: Arc<dyn CryptoProvider> = Arc::new(RustCryptoProvider);

        Self {
            vault: ContextKeyVault::with_provider(config.vault.clone(), provider.clone(), clock.clone()),
            key_store: SecureKeyStore::new(config.key_store.clone(), clock.clone(), scheduler.clone()),
            burn: BurnOnReadScheduler::new(clock.clone(), scheduler.clone(), destroyer),
            power: PowerAwareCryptoScheduler::new(config.power.clone(), clock, scheduler),
            provider,
            config,
            conversations: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Build the engine on the current tokio runtime and the system clock
    pub fn with_tokio(config: CoreConfig, destroyer: Arc<dyn MessageDestroyer>) -> Result<Self> {
        let scheduler = Arc::new(TokioScheduler::new()?);
        Ok(Self::new(config, scheduler, Arc::new(SystemClock), destroyer))
    }

    /// Context key vault
    pub fn vault(&self) -> &ContextKeyVault {
        &self.vault
    }

    /// Secure key store
    pub fn key_store(&self) -> &SecureKeyStore {
        &self.key_store
    }

    /// Burn-on-read scheduler
    pub fn burn(&self) -> &BurnOnReadScheduler {
        &self.burn
    }

    /// Power-aware crypto scheduler
    pub fn power(&self) -> &PowerAwareCryptoScheduler {
        &self.power
    }

    /// Active configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ========================================================================
    // CONVERSATIONS
    // ========================================================================

    /// Start (or restart) the ratchet for a conversation
    ///
    /// The identity key is kept in the key store so the conversation can be
    /// re-seeded with [`reopen_conversation`](Self::reopen_conversation).
    pub fn open_conversation(&self, conversation_id: &str, identity_key: &[u8]) -> Result<Arc<RatchetEngine>> {
        self.ensure_running()?;

        let engine = Arc::new(RatchetEngine::with_provider(self.provider.clone()));
        engine.initialize(identity_key, conversation_id)?;
        self.key_store.store_key(&identity_key_id(conversation_id), identity_key)?;

        // Shutdown raises its flag before draining this map
        let previous = {
            let mut conversations = self.conversations.write();
            if self.is_shut_down() {
                drop(conversations);
                engine.dispose();
                return Err(Error::Disposed);
            }
            conversations.insert(conversation_id.to_string(), engine.clone())
        };
        if let Some(previous) = previous {
            previous.dispose();
        }
        tracing::debug!("Conversation {} opened", conversation_id);
        Ok(engine)
    }

    /// Re-seed a conversation from the identity key held in the key store
    ///
    /// Fails with `NotInitialized` if the key is missing or too old.
    pub fn reopen_conversation(&self, conversation_id: &str) -> Result<Arc<RatchetEngine>> {
        let identity = self
            .key_store
            .get_key(&identity_key_id(conversation_id))
            .ok_or(Error::NotInitialized)?;
        self.open_conversation(conversation_id, &identity)
    }

    /// Ratchet for an open conversation
    pub fn conversation(&self, conversation_id: &str) -> Option<Arc<RatchetEngine>> {
        self.conversations.read().get(conversation_id).cloned()
    }

    /// Dispose a conversation's ratchet and erase its identity key
    pub fn close_conversation(&self, conversation_id: &str) -> bool {
        let engine = self.conversations.write().remove(conversation_id);
        self.key_store.delete_key(&identity_key_id(conversation_id));
        match engine {
            Some(engine) => {
                engine.dispose();
                tracing::debug!("Conversation {} closed", conversation_id);
                true
            }
            None => false,
        }
    }

    /// Number of open conversations
    pub fn conversation_count(&self) -> usize {
        self.conversations.read().len()
    }

    // ========================================================================
    // EPHEMERAL MESSAGES
    // ========================================================================

    /// Schedule a read message for destruction with the configured defaults
    pub fn burn_after_read(&self, message_id: &str) -> Result<BurnToken> {
        self.ensure_running()?;
        self.burn.schedule_message_destruction(message_id, self.config.burn.clone())
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Forward a foreground/background change to every component
    pub fn on_visibility_change(&self, visibility: Visibility) {
        tracing::debug!("Visibility changed to {:?}", visibility);
        self.key_store.on_visibility_change(visibility);
        self.burn.on_visibility_change(visibility);
        self.power.on_visibility_change(visibility);
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancel every timer and erase all key material
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down Snakkaz E2EE");

        for (_, engine) in self.conversations.write().drain() {
            engine.dispose();
        }
        self.burn.dispose();
        self.power.dispose();
        self.key_store.dispose();
        self.vault.clear_all_data();

        tracing::info!("Snakkaz E2EE shutdown complete");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Disposed);
        }
        Ok(())
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of the engine
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::OS,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Target operating system
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Fixture {
        scheduler: Arc<ManualScheduler>,
        burned: Arc<Mutex<Vec<String>>>,
        core: SecureMessagingCore,
    }

    fn fixture() -> Fixture {
        let scheduler = Arc::new(ManualScheduler::new());
        let burned = Arc::new(Mutex::new(Vec::new()));
        let sink = burned.clone();
        let destroyer = move |id: &str| -> Result<()> {
            sink.lock().push(id.to_string());
            Ok(())
        };
        let core = SecureMessagingCore::new(
            CoreConfig::default(),
            scheduler.clone(),
            scheduler.clock(),
            Arc::new(destroyer),
        );
        Fixture {
            scheduler,
            burned,
            core,
        }
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = build_info();
        assert_eq!(info.version, version());
    }

    #[test]
    fn test_config_from_json() {
        let config = CoreConfig::from_json(
            r#"{"burn": {"burnTimeout": 1000}, "power": {"maxKeysInCache": 4}, "keyStore": {"maxEntries": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.burn.burn_timeout_ms, 1_000);
        assert_eq!(config.power.max_keys_in_cache, 4);
        assert_eq!(config.key_store.max_entries, 2);
        assert_eq!(config.vault.max_cache_size, VaultConfig::default().max_cache_size);

        assert!(matches!(CoreConfig::from_json("{"), Err(Error::SerializationError(_))));
    }

    #[test]
    fn test_conversation_between_two_devices() {
        let alice = fixture();
        let bob = fixture();
        let identity = [9u8; 32];

        let a = alice.core.open_conversation("chat-1", &identity).unwrap();
        let b = bob.core.open_conversation("chat-1", &identity).unwrap();

        let first = a.encrypt_text("hei").unwrap();
        let second = a.encrypt_text("hallo").unwrap();
        assert_eq!(b.decrypt_message_text(&second).unwrap(), "hallo");
        assert_eq!(b.decrypt_message_text(&first).unwrap(), "hei");
    }

    #[test]
    fn test_reopen_and_close_conversation() {
        let f = fixture();
        let engine = f.core.open_conversation("chat-1", b"identity").unwrap();
        let sent = engine.encrypt_text("before restart").unwrap();

        let reopened = f.core.reopen_conversation("chat-1").unwrap();
        assert!(matches!(engine.counter(), Err(Error::Disposed)));
        assert_eq!(reopened.decrypt_message_text(&sent).unwrap(), "before restart");
        assert_eq!(f.core.conversation_count(), 1);

        assert!(f.core.close_conversation("chat-1"));
        assert!(!f.core.close_conversation("chat-1"));
        assert!(f.core.conversation("chat-1").is_none());
        assert!(matches!(f.core.reopen_conversation("chat-1"), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_backgrounding_fans_out() {
        let f = fixture();
        f.core.open_conversation("chat-1", b"identity").unwrap();
        f.core.key_store().get_key("ratchet-identity:chat-1");
        f.core.burn_after_read("msg-1").unwrap();

        f.core.on_visibility_change(Visibility::Hidden);
        assert_eq!(*f.burned.lock(), vec!["msg-1".to_string()]);
        assert_eq!(f.core.key_store().uses("ratchet-identity:chat-1"), Some(0));
    }

    #[test]
    fn test_burn_after_read_uses_configured_timeout() {
        let f = fixture();
        f.core.burn_after_read("msg-1").unwrap();
        f.scheduler.advance(Duration::from_secs(29));
        assert!(f.burned.lock().is_empty());
        f.scheduler.advance(Duration::from_secs(1));
        assert_eq!(f.burned.lock().len(), 1);
    }

    #[test]
    fn test_shutdown_erases_everything() {
        let f = fixture();
        f.core.vault().initialize(b"s1", b"salt1").unwrap();
        let engine = f.core.open_conversation("chat-1", b"identity").unwrap();
        f.core.burn_after_read("msg-1").unwrap();

        f.core.shutdown();
        assert!(f.core.is_shut_down());
        assert!(!f.core.vault().is_ready());
        assert!(f.core.key_store().is_empty());
        assert!(matches!(engine.encrypt_text("late"), Err(Error::Disposed)));
        assert_eq!(f.scheduler.pending(), 0);
        assert!(matches!(f.core.burn_after_read("msg-2"), Err(Error::Disposed)));

        f.scheduler.advance(Duration::from_secs(60));
        assert!(f.burned.lock().is_empty());
        f.core.shutdown();
    }

    #[test]
    fn test_open_racing_shutdown_leaves_no_live_conversation() {
        for _ in 0..20 {
            let f = fixture();
            let opened = Mutex::new(Vec::new());
            std::thread::scope(|s| {
                for worker in 0..4 {
                    let core = &f.core;
                    let opened = &opened;
                    s.spawn(move || {
                        for i in 0..20 {
                            if let Ok(engine) = core.open_conversation(&format!("chat-{}-{}", worker, i), b"identity") {
                                opened.lock().push(engine);
                            }
                        }
                    });
                }
                f.core.shutdown();
            });

            assert_eq!(f.core.conversation_count(), 0);
            assert!(f.core.key_store().is_empty());
            for engine in opened.lock().iter() {
                assert!(matches!(engine.encrypt_text("late"), Err(Error::Disposed)));
            }
        }
    }

    #[tokio::test]
    async fn test_with_tokio_runtime() {
        let destroyer = |_: &str| -> Result<()> { Ok(()) };
        let core = SecureMessagingCore::with_tokio(CoreConfig::default(), Arc::new(destroyer)).unwrap();
        let key = EncryptionKey::from_bytes([4u8; 32]);
        let (ct, nonce) = core.power().encrypt(b"media", &key, "attachments").await.unwrap();
        assert_eq!(core.power().decrypt(&ct, &nonce, &key, "attachments").await.unwrap(), b"media");
        core.shutdown();
    }
}
