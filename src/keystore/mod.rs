//! # Secure Key Store
//!
//! In-memory registry of named key material with age limits, rotation
//! signalling and anti-forensic erasure.
//!
//! ## Entry Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      STORED KEY LIFECYCLE                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  store_key ──► private copy, created = lastUsed = now                  │
//! │                rotationDue = now + 4h                                  │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  get_key ────► copy out, lastUsed = now, uses += 1                     │
//! │      │         past rotationDue? emit RotationDue (once)               │
//! │      │                                                                  │
//! │      ├── rotate_key ──► new copy stored, old buffer overwritten        │
//! │      ├── delete_key ──► overwritten, removed                           │
//! │      └── cleanup (every 30m) ──► older than 24h? overwritten, removed  │
//! │                                                                         │
//! │  App hidden ──► all usage counters reset to zero                       │
//! │  dispose ─────► cleanup timer cancelled, every entry overwritten       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stored material is never aliased with a caller buffer: keys are copied
//! in on store and copied out on get, so overwriting an entry cannot
//! corrupt data the caller still holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::crypto::secure_wipe;
use crate::error::{Error, Result};
use crate::lifecycle::Visibility;
use crate::scheduler::{Scheduler, TaskId};
use crate::time::Clock;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Age and rotation limits for stored keys
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyStoreConfig {
    /// Keys older than this are invalid and swept by cleanup
    pub max_key_age_ms: i64,
    /// Time after storing when rotation becomes due
    pub rotation_interval_ms: i64,
    /// Period of the cleanup sweep
    pub cleanup_interval_ms: i64,
    /// Entries kept after a sweep; least-used keys go first beyond this
    pub max_entries: usize,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            max_key_age_ms: 24 * HOUR_MS,
            rotation_interval_ms: 4 * HOUR_MS,
            cleanup_interval_ms: 30 * 60 * 1000,
            max_entries: 256,
        }
    }
}

/// Events emitted by the key store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreEvent {
    /// A key was read after its rotation deadline
    RotationDue {
        /// Key identifier
        key_id: String,
        /// When rotation became due (Unix millis)
        due_at: i64,
    },
    /// A key was erased by the cleanup sweep
    Expired {
        /// Key identifier
        key_id: String,
    },
}

struct StoredKeyEntry {
    material: Zeroizing<Vec<u8>>,
    created: i64,
    last_used: i64,
    rotation_due: i64,
    rotation_signalled: bool,
    uses: u64,
}

impl StoredKeyEntry {
    fn new(material: &[u8], now: i64, rotation_interval_ms: i64) -> Self {
        Self {
            material: Zeroizing::new(material.to_vec()),
            created: now,
            last_used: now,
            rotation_due: now.saturating_add(rotation_interval_ms),
            rotation_signalled: false,
            uses: 0,
        }
    }
}

/// Overwrite an entry's material before it is dropped
///
/// Failures are logged; the buffer has been zero-filled in that case.
fn erase(key_id: &str, mut entry: StoredKeyEntry) {
    if let Err(e) = secure_wipe(&mut entry.material) {
        tracing::warn!("Random overwrite of key {} failed, zero-filled instead: {}", key_id, e);
    }
}

struct StoreInner {
    config: KeyStoreConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, StoredKeyEntry>>,
    disposed: AtomicBool,
    event_tx: broadcast::Sender<KeyStoreEvent>,
}

impl StoreInner {
    fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let max_age = self.config.max_key_age_ms;

        let mut entries = self.entries.write();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now > entry.created.saturating_add(max_age))
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for key_id in expired {
            if let Some(entry) = entries.remove(&key_id) {
                erase(&key_id, entry);
                let _ = self.event_tx.send(KeyStoreEvent::Expired { key_id });
                removed += 1;
            }
        }

        if entries.len() > self.config.max_entries {
            let mut by_use: Vec<(String, u64, i64)> = entries
                .iter()
                .map(|(id, e)| (id.clone(), e.uses, e.last_used))
                .collect();
            by_use.sort_by_key(|(_, uses, last_used)| (*uses, *last_used));

            let excess = entries.len() - self.config.max_entries;
            for (key_id, _, _) in by_use.into_iter().take(excess) {
                if let Some(entry) = entries.remove(&key_id) {
                    erase(&key_id, entry);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::debug!("Key store cleanup removed {} entries", removed);
        }
        removed
    }
}

/// In-memory store of named key material
pub struct SecureKeyStore {
    inner: Arc<StoreInner>,
    scheduler: Arc<dyn Scheduler>,
    cleanup_task: Mutex<Option<TaskId>>,
}

impl SecureKeyStore {
    /// Create a store and start its periodic cleanup on `scheduler`
    pub fn new(config: KeyStoreConfig, clock: Arc<dyn Clock>, scheduler: Arc<dyn Scheduler>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let period = Duration::from_millis(config.cleanup_interval_ms.max(1) as u64);

        let inner = Arc::new(StoreInner {
            config,
            clock,
            entries: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            event_tx,
        });

        let weak: Weak<StoreInner> = Arc::downgrade(&inner);
        let task = scheduler.schedule_every(
            period,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.cleanup();
                }
            }),
        );

        Self {
            inner,
            scheduler,
            cleanup_task: Mutex::new(Some(task)),
        }
    }

    /// Subscribe to rotation and expiry events
    pub fn subscribe(&self) -> broadcast::Receiver<KeyStoreEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Store a private copy of `material` under `key_id`
    ///
    /// Replacing an existing id overwrites the previous buffer.
    pub fn store_key(&self, key_id: &str, material: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let now = self.inner.clock.now_millis();
        let entry = StoredKeyEntry::new(material, now, self.inner.config.rotation_interval_ms);

        let previous = {
            let mut entries = self.inner.entries.write();
            if self.inner.disposed.load(Ordering::Acquire) {
                drop(entries);
                erase(key_id, entry);
                return Err(Error::Disposed);
            }
            entries.insert(key_id.to_string(), entry)
        };
        if let Some(old) = previous {
            erase(key_id, old);
        }
        Ok(())
    }

    /// Copy out the material for `key_id`
    ///
    /// Returns `None` for unknown keys and keys past the maximum age. Reading
    /// a key past its rotation deadline emits [`KeyStoreEvent::RotationDue`]
    /// once; the key is not rotated automatically.
    pub fn get_key(&self, key_id: &str) -> Option<Zeroizing<Vec<u8>>> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return None;
        }
        let now = self.inner.clock.now_millis();

        let mut entries = self.inner.entries.write();
        let entry = entries.get_mut(key_id)?;
        if now >= entry.created.saturating_add(self.inner.config.max_key_age_ms) {
            return None;
        }

        entry.last_used = now;
        entry.uses += 1;

        if now > entry.rotation_due && !entry.rotation_signalled {
            entry.rotation_signalled = true;
            tracing::info!("Key {} due for rotation", key_id);
            let _ = self.inner.event_tx.send(KeyStoreEvent::RotationDue {
                key_id: key_id.to_string(),
                due_at: entry.rotation_due,
            });
        }

        Some(Zeroizing::new(entry.material.to_vec()))
    }

    /// Whether `key_id` exists and is younger than the maximum age
    pub fn has_valid_key(&self, key_id: &str) -> bool {
        let now = self.inner.clock.now_millis();
        self.inner
            .entries
            .read()
            .get(key_id)
            .map(|entry| now < entry.created.saturating_add(self.inner.config.max_key_age_ms))
            .unwrap_or(false)
    }

    /// Replace `key_id` with new material and overwrite the old buffer
    pub fn rotate_key(&self, key_id: &str, new_material: &[u8]) -> Result<()> {
        self.store_key(key_id, new_material)?;
        tracing::debug!("Key {} rotated", key_id);
        Ok(())
    }

    /// Overwrite and remove `key_id`
    ///
    /// Returns false if the key was not present.
    pub fn delete_key(&self, key_id: &str) -> bool {
        let removed = self.inner.entries.write().remove(key_id);
        match removed {
            Some(entry) => {
                erase(key_id, entry);
                true
            }
            None => false,
        }
    }

    /// React to the application moving between foreground and background
    pub fn on_visibility_change(&self, visibility: Visibility) {
        if visibility == Visibility::Hidden {
            let mut entries = self.inner.entries.write();
            for entry in entries.values_mut() {
                entry.uses = 0;
            }
            tracing::debug!("Protecting {} keys after backgrounding", entries.len());
        }
    }

    /// Run the expiry sweep now
    ///
    /// Returns the number of entries erased.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Usage count of `key_id` since it was stored or last reset
    pub fn uses(&self, key_id: &str) -> Option<u64> {
        self.inner.entries.read().get(key_id).map(|entry| entry.uses)
    }

    /// Stored key ids
    pub fn key_ids(&self) -> Vec<String> {
        self.inner.entries.read().keys().cloned().collect()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Stop the cleanup timer and erase every key
    ///
    /// Later stores fail with `Disposed`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.cleanup_task.lock().take() {
            self.scheduler.cancel(task);
        }

        let drained: Vec<(String, StoredKeyEntry)> = self.inner.entries.write().drain().collect();
        let count = drained.len();
        for (key_id, entry) in drained {
            erase(&key_id, entry);
        }
        tracing::info!("Key store disposed, {} keys erased", count);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        Ok(())
    }
}

impl Drop for SecureKeyStore {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            self.scheduler.cancel(task);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
