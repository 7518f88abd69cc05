//! # Power-Aware Crypto Scheduling
//!
//! Async wrapper around AES-256-GCM that caches cipher handles and pushes
//! large jobs off the caller's task when the device is low on battery.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    POWER-AWARE ENCRYPT / DECRYPT                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  encrypt(data, key, context)                                           │
//! │      │                                                                  │
//! │      ├── cache_keys?  (context, key fingerprint) ──► CipherHandle      │
//! │      │                 hit: uses += 1, timestamp = now                 │
//! │      │                 miss: build, insert while below capacity        │
//! │      │                                                                  │
//! │      ├── data > 512 KiB and chunk_large_operations?                    │
//! │      │       low power + defer_non_essential_operations                │
//! │      │         └──► yield, then run on the blocking pool               │
//! │      │       otherwise inline                                          │
//! │      │                                                                  │
//! │      └── (ciphertext, nonce)                                           │
//! │                                                                         │
//! │  Low power  ⇔  battery < 20 % and not charging                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Scheduling never changes the bytes: a payload encrypted in low-power
//! mode decrypts with the plain [`crate::crypto::decrypt`] and vice versa.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::crypto::{CipherHandle, EncryptionKey, Nonce};
use crate::error::{Error, Result};
use crate::lifecycle::Visibility;
use crate::scheduler::{Scheduler, TaskId};
use crate::time::Clock;

/// Payloads above this size count as large operations
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Default lifetime of a cached cipher handle (5 minutes)
pub const KEY_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

/// Period of the cache sweep
pub const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Battery level below which an unplugged device is in low-power mode
pub const LOW_BATTERY_THRESHOLD: f32 = 0.2;

/// Tuning for power-aware scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatteryEfficientConfig {
    /// Allow deferral when the device reports low power
    pub enable_low_power_mode: bool,
    /// Defer large jobs while in low-power mode
    pub defer_non_essential_operations: bool,
    /// Treat payloads above [`CHUNK_SIZE`] as deferrable
    pub chunk_large_operations: bool,
    /// Cache cipher handles by context and key
    pub cache_keys: bool,
    /// Lifetime of an idle cached handle in milliseconds
    #[serde(rename = "cacheTTL")]
    pub cache_ttl_ms: i64,
    /// Upper bound on cached handles
    pub max_keys_in_cache: usize,
}

impl Default for BatteryEfficientConfig {
    fn default() -> Self {
        Self {
            enable_low_power_mode: true,
            defer_non_essential_operations: true,
            chunk_large_operations: true,
            cache_keys: true,
            cache_ttl_ms: KEY_CACHE_TTL_MS,
            max_keys_in_cache: 10,
        }
    }
}

/// Partial update applied by [`PowerAwareCryptoScheduler::configure`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatteryConfigUpdate {
    /// New `enable_low_power_mode`
    pub enable_low_power_mode: Option<bool>,
    /// New `defer_non_essential_operations`
    pub defer_non_essential_operations: Option<bool>,
    /// New `chunk_large_operations`
    pub chunk_large_operations: Option<bool>,
    /// New `cache_keys`
    pub cache_keys: Option<bool>,
    /// New `cache_ttl_ms`
    #[serde(rename = "cacheTTL")]
    pub cache_ttl_ms: Option<i64>,
    /// New `max_keys_in_cache`
    pub max_keys_in_cache: Option<usize>,
}

impl BatteryEfficientConfig {
    fn apply(&mut self, update: BatteryConfigUpdate) {
        if let Some(v) = update.enable_low_power_mode {
            self.enable_low_power_mode = v;
        }
        if let Some(v) = update.defer_non_essential_operations {
            self.defer_non_essential_operations = v;
        }
        if let Some(v) = update.chunk_large_operations {
            self.chunk_large_operations = v;
        }
        if let Some(v) = update.cache_keys {
            self.cache_keys = v;
        }
        if let Some(v) = update.cache_ttl_ms {
            self.cache_ttl_ms = v;
        }
        if let Some(v) = update.max_keys_in_cache {
            self.max_keys_in_cache = v;
        }
    }
}

/// Device power and connectivity as last reported by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerState {
    /// Battery below threshold and unplugged
    pub is_low_power_mode: bool,
    /// Device is charging
    pub is_charging: bool,
    /// Network is reachable
    pub is_online: bool,
    /// Battery level in `0.0..=1.0`, unknown until reported
    pub battery_level: Option<f32>,
    /// Time of the last signal (Unix millis)
    pub last_update: i64,
}

/// A single change reported by the host platform
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerSignal {
    /// New battery level in `0.0..=1.0`
    BatteryLevel(f32),
    /// Charger connected or disconnected
    Charging(bool),
    /// Network came up or went down
    Online(bool),
}

/// Counters reported by [`PowerAwareCryptoScheduler::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerStats {
    /// Cipher handles currently cached
    pub cached_keys: usize,
    /// Lookups served from the cache
    pub cache_hits: u64,
    /// Lookups that built a new handle
    pub cache_misses: u64,
    /// Operations moved to the blocking pool
    pub deferred_operations: u64,
}

struct CachedCipher {
    cipher: Arc<CipherHandle>,
    timestamp: i64,
    context: String,
    uses: u64,
}

struct PowerInner {
    clock: Arc<dyn Clock>,
    config: RwLock<BatteryEfficientConfig>,
    state: RwLock<PowerState>,
    cache: Mutex<HashMap<String, CachedCipher>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    deferred: AtomicU64,
}

impl PowerInner {
    fn cleanup_key_cache(&self) -> usize {
        let config = self.config.read().clone();
        if !config.cache_keys {
            return 0;
        }
        let now = self.clock.now_millis();

        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, entry| now - entry.timestamp <= config.cache_ttl_ms);

        if cache.len() > config.max_keys_in_cache {
            let mut by_use: Vec<(String, u64)> = cache.iter().map(|(id, e)| (id.clone(), e.uses)).collect();
            by_use.sort_by_key(|(_, uses)| *uses);
            let excess = cache.len() - config.max_keys_in_cache;
            for (id, _) in by_use.into_iter().take(excess) {
                cache.remove(&id);
            }
        }

        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!("Power scheduler dropped {} cached cipher handles", removed);
        }
        removed
    }
}

/// Cache identifier for a key used under a context
fn cache_id(context: &str, key: &EncryptionKey) -> String {
    format!("{}-{}", context, hex::encode(key.fingerprint()))
}

/// Battery-aware AES-256-GCM front end
pub struct PowerAwareCryptoScheduler {
    inner: Arc<PowerInner>,
    scheduler: Arc<dyn Scheduler>,
    cleanup_task: Mutex<Option<TaskId>>,
}

impl PowerAwareCryptoScheduler {
    /// Create a scheduler and start its cache sweep
    pub fn new(config: BatteryEfficientConfig, clock: Arc<dyn Clock>, scheduler: Arc<dyn Scheduler>) -> Self {
        let now = clock.now_millis();
        let inner = Arc::new(PowerInner {
            clock,
            config: RwLock::new(config),
            state: RwLock::new(PowerState {
                is_low_power_mode: false,
                is_charging: true,
                is_online: true,
                battery_level: None,
                last_update: now,
            }),
            cache: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        });

        let weak: Weak<PowerInner> = Arc::downgrade(&inner);
        let task = scheduler.schedule_every(
            CACHE_CLEANUP_INTERVAL,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.cleanup_key_cache();
                }
            }),
        );

        Self {
            inner,
            scheduler,
            cleanup_task: Mutex::new(Some(task)),
        }
    }

    // ========================================================================
    // CRYPTO
    // ========================================================================

    /// Encrypt `data` with `key`, caching the cipher under `context`
    pub async fn encrypt(&self, data: &[u8], key: &EncryptionKey, context: &str) -> Result<(Vec<u8>, Nonce)> {
        let cipher = self.cipher_for(key, context);

        if self.is_large(data.len()) {
            let data = data.to_vec();
            let (nonce, ciphertext) = self.run_low_priority(move || cipher.encrypt(&data, &[])).await?;
            return Ok((ciphertext, nonce));
        }

        let (nonce, ciphertext) = cipher.encrypt(data, &[])?;
        Ok((ciphertext, nonce))
    }

    /// Encrypt a UTF-8 string
    pub async fn encrypt_text(&self, text: &str, key: &EncryptionKey, context: &str) -> Result<(Vec<u8>, Nonce)> {
        self.encrypt(text.as_bytes(), key, context).await
    }

    /// Decrypt `ciphertext` produced by [`encrypt`](Self::encrypt)
    pub async fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &Nonce,
        key: &EncryptionKey,
        context: &str,
    ) -> Result<Vec<u8>> {
        let cipher = self.cipher_for(key, context);

        if self.is_large(ciphertext.len()) {
            let ciphertext = ciphertext.to_vec();
            let nonce = *nonce;
            return self.run_low_priority(move || cipher.decrypt(&nonce, &ciphertext, &[])).await;
        }

        cipher.decrypt(nonce, ciphertext, &[])
    }

    fn is_large(&self, len: usize) -> bool {
        self.inner.config.read().chunk_large_operations && len > CHUNK_SIZE
    }

    fn should_defer(&self) -> bool {
        let config = self.inner.config.read();
        config.enable_low_power_mode && config.defer_non_essential_operations && self.is_low_power_mode()
    }

    /// Run `job` after yielding, on the blocking pool, when power is low
    async fn run_low_priority<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.should_defer() {
            return job();
        }

        self.inner.deferred.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| Error::Internal(format!("Deferred crypto task failed: {}", e)))?
    }

    fn cipher_for(&self, key: &EncryptionKey, context: &str) -> Arc<CipherHandle> {
        let config = self.inner.config.read().clone();
        if !config.cache_keys {
            return Arc::new(CipherHandle::new(key));
        }

        let id = cache_id(context, key);
        let now = self.inner.clock.now_millis();
        let mut cache = self.inner.cache.lock();

        if let Some(entry) = cache.get_mut(&id) {
            entry.timestamp = now;
            entry.uses += 1;
            self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
            return entry.cipher.clone();
        }

        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
        let cipher = Arc::new(CipherHandle::new(key));
        if cache.len() < config.max_keys_in_cache {
            cache.insert(
                id,
                CachedCipher {
                    cipher: cipher.clone(),
                    timestamp: now,
                    context: context.to_string(),
                    uses: 1,
                },
            );
        }
        cipher
    }

    // ========================================================================
    // POWER STATE
    // ========================================================================

    /// Record a battery, charging or connectivity change
    pub fn update_power_state(&self, signal: PowerSignal) {
        let mut state = self.inner.state.write();
        match signal {
            PowerSignal::BatteryLevel(level) => state.battery_level = Some(level.clamp(0.0, 1.0)),
            PowerSignal::Charging(charging) => state.is_charging = charging,
            PowerSignal::Online(online) => state.is_online = online,
        }
        state.last_update = self.inner.clock.now_millis();

        let low = matches!(state.battery_level, Some(level) if level < LOW_BATTERY_THRESHOLD) && !state.is_charging;
        if low != state.is_low_power_mode {
            tracing::info!("Low-power mode {}", if low { "entered" } else { "left" });
        }
        state.is_low_power_mode = low;
    }

    /// Battery below 20 % and not charging
    pub fn is_low_power_mode(&self) -> bool {
        self.inner.state.read().is_low_power_mode
    }

    /// Snapshot of the reported power state
    pub fn power_state(&self) -> PowerState {
        self.inner.state.read().clone()
    }

    /// Reset usage counters when the application is backgrounded
    pub fn on_visibility_change(&self, visibility: Visibility) {
        if visibility.is_hidden() {
            for entry in self.inner.cache.lock().values_mut() {
                entry.uses = 0;
            }
        }
    }

    // ========================================================================
    // CACHE MANAGEMENT
    // ========================================================================

    /// Drop expired handles, then the least used beyond capacity
    ///
    /// Returns the number of handles dropped.
    pub fn cleanup_key_cache(&self) -> usize {
        self.inner.cleanup_key_cache()
    }

    /// Merge `update` into the active configuration
    pub fn configure(&self, update: BatteryConfigUpdate) {
        let caching = {
            let mut config = self.inner.config.write();
            config.apply(update);
            config.cache_keys
        };
        if !caching {
            self.clear_cache();
        }
    }

    /// Active configuration
    pub fn config(&self) -> BatteryEfficientConfig {
        self.inner.config.read().clone()
    }

    /// Drop every cached handle
    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }

    /// Contexts that currently have a cached handle
    pub fn cached_contexts(&self) -> Vec<String> {
        let mut contexts: Vec<String> = self.inner.cache.lock().values().map(|e| e.context.clone()).collect();
        contexts.sort();
        contexts.dedup();
        contexts
    }

    /// Cache and deferral counters
    pub fn stats(&self) -> PowerStats {
        PowerStats {
            cached_keys: self.inner.cache.lock().len(),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            deferred_operations: self.inner.deferred.load(Ordering::Relaxed),
        }
    }

    /// Stop the cache sweep and drop every handle
    pub fn dispose(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            self.scheduler.cancel(task);
        }
        self.clear_cache();
    }
}

impl Drop for PowerAwareCryptoScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::scheduler::ManualScheduler;

    fn power() -> (PowerAwareCryptoScheduler, Arc<ManualScheduler>) {
        power_with(BatteryEfficientConfig::default())
    }

    fn power_with(config: BatteryEfficientConfig) -> (PowerAwareCryptoScheduler, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let power = PowerAwareCryptoScheduler::new(config, scheduler.clock(), scheduler.clone());
        (power, scheduler)
    }

    fn key(n: u8) -> EncryptionKey {
        EncryptionKey::from_bytes([n; 32])
    }

    fn drain_battery(power: &PowerAwareCryptoScheduler) {
        power.update_power_state(PowerSignal::Charging(false));
        power.update_power_state(PowerSignal::BatteryLevel(0.1));
    }

    #[tokio::test]
    async fn test_round_trip_and_cache_hits() {
        let (power, _) = power();
        let (ct, nonce) = power.encrypt(b"hello", &key(1), "chat").await.unwrap();
        let pt = power.decrypt(&ct, &nonce, &key(1), "chat").await.unwrap();
        assert_eq!(pt, b"hello");

        let stats = power.stats();
        assert_eq!(stats.cached_keys, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_interoperates_with_plain_aead() {
        let (power, _) = power();
        let (ct, nonce) = power.encrypt_text("interop", &key(2), "ctx").await.unwrap();
        assert_eq!(crypto::decrypt(&key(2), &nonce, &ct, &[]).unwrap(), b"interop");

        let (nonce, ct) = crypto::encrypt(&key(2), b"other way", &[]).unwrap();
        assert_eq!(power.decrypt(&ct, &nonce, &key(2), "ctx").await.unwrap(), b"other way");
    }

    #[tokio::test]
    async fn test_distinct_keys_in_same_context_get_distinct_handles() {
        let (power, _) = power();
        let (ct, nonce) = power.encrypt(b"a", &key(1), "shared").await.unwrap();
        power.encrypt(b"b", &key(2), "shared").await.unwrap();
        assert_eq!(power.stats().cached_keys, 2);

        let wrong = power.decrypt(&ct, &nonce, &key(2), "shared").await;
        assert!(matches!(wrong, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_low_power_mode_rules() {
        let (power, _) = power();
        assert!(!power.is_low_power_mode());

        power.update_power_state(PowerSignal::BatteryLevel(0.1));
        assert!(!power.is_low_power_mode(), "charging by default");

        power.update_power_state(PowerSignal::Charging(false));
        assert!(power.is_low_power_mode());

        power.update_power_state(PowerSignal::BatteryLevel(0.2));
        assert!(!power.is_low_power_mode());

        power.update_power_state(PowerSignal::Online(false));
        assert!(!power.power_state().is_online);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_large_payload_deferred_in_low_power() {
        let (power, _) = power();
        drain_battery(&power);
        let data = vec![7u8; CHUNK_SIZE + 1];

        let (ct, nonce) = power.encrypt(&data, &key(3), "media").await.unwrap();
        let pt = power.decrypt(&ct, &nonce, &key(3), "media").await.unwrap();
        assert_eq!(pt, data);
        assert_eq!(power.stats().deferred_operations, 2);
    }

    #[tokio::test]
    async fn test_no_deferral_when_disabled_or_small() {
        let (power, _) = power();
        drain_battery(&power);
        power.encrypt(&[1u8; 64], &key(3), "small").await.unwrap();
        assert_eq!(power.stats().deferred_operations, 0);

        power.configure(BatteryConfigUpdate {
            defer_non_essential_operations: Some(false),
            ..Default::default()
        });
        power.encrypt(&vec![0u8; CHUNK_SIZE + 1], &key(3), "media").await.unwrap();
        assert_eq!(power.stats().deferred_operations, 0);
    }

    #[tokio::test]
    async fn test_cache_capacity_is_respected() {
        let config = BatteryEfficientConfig {
            max_keys_in_cache: 2,
            ..Default::default()
        };
        let (power, _) = power_with(config);
        for n in 0..4 {
            power.encrypt(b"x", &key(n), "ctx").await.unwrap();
        }
        assert_eq!(power.stats().cached_keys, 2);
    }

    #[tokio::test]
    async fn test_periodic_sweep_expires_idle_handles() {
        let (power, scheduler) = power();
        power.encrypt(b"x", &key(1), "old").await.unwrap();
        scheduler.advance(Duration::from_secs(4 * 60));
        power.encrypt(b"x", &key(2), "fresh").await.unwrap();

        scheduler.advance(Duration::from_secs(2 * 60));
        assert_eq!(power.cached_contexts(), vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_least_used_after_shrink() {
        let (power, _) = power();
        for n in 0..3 {
            power.encrypt(b"x", &key(n), &format!("ctx-{}", n)).await.unwrap();
        }
        power.encrypt(b"x", &key(2), "ctx-2").await.unwrap();
        power.encrypt(b"x", &key(0), "ctx-0").await.unwrap();

        power.configure(BatteryConfigUpdate {
            max_keys_in_cache: Some(2),
            ..Default::default()
        });
        assert_eq!(power.cleanup_key_cache(), 1);
        assert_eq!(power.cached_contexts(), vec!["ctx-0".to_string(), "ctx-2".to_string()]);
    }

    #[tokio::test]
    async fn test_backgrounding_resets_usage() {
        let (power, _) = power();
        power.encrypt(b"x", &key(1), "a").await.unwrap();
        power.encrypt(b"x", &key(1), "a").await.unwrap();
        power.encrypt(b"x", &key(2), "b").await.unwrap();

        power.on_visibility_change(Visibility::Hidden);
        assert!(power.inner.cache.lock().values().all(|e| e.uses == 0));
    }

    #[tokio::test]
    async fn test_disabling_cache_clears_it() {
        let (power, _) = power();
        power.encrypt(b"x", &key(1), "a").await.unwrap();
        power.configure(BatteryConfigUpdate {
            cache_keys: Some(false),
            ..Default::default()
        });
        assert_eq!(power.stats().cached_keys, 0);
        power.encrypt(b"x", &key(1), "a").await.unwrap();
        assert_eq!(power.stats().cached_keys, 0);
    }

    #[test]
    fn test_blocking_context_via_tokio_test() {
        let (power, scheduler) = power();
        let (ct, nonce) = tokio_test::block_on(power.encrypt(b"sync caller", &key(9), "sync")).unwrap();
        let pt = tokio_test::block_on(power.decrypt(&ct, &nonce, &key(9), "sync"));
        tokio_test::assert_ok!(pt);

        power.dispose();
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_config_json_names() {
        let config: BatteryEfficientConfig =
            serde_json::from_str(r#"{"cacheTTL": 1000, "maxKeysInCache": 3, "cacheKeys": false}"#).unwrap();
        assert_eq!(config.cache_ttl_ms, 1_000);
        assert_eq!(config.max_keys_in_cache, 3);
        assert!(!config.cache_keys);
        assert!(config.chunk_large_operations);
    }
}
