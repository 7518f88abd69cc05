//! Bounded TTL cache of derived context keys.

use std::collections::HashMap;

use crate::crypto::EncryptionKey;

struct CachedKey {
    key: EncryptionKey,
    timestamp: i64,
}

/// Context keys keyed by `"{context}-v{version}"`
///
/// Entries older than the TTL are treated as absent. Inserting into a full
/// cache evicts the entry with the oldest timestamp.
pub struct ContextKeyCache {
    entries: HashMap<String, CachedKey>,
    max_size: usize,
    ttl_ms: i64,
}

impl ContextKeyCache {
    /// Create an empty cache
    pub fn new(max_size: usize, ttl_ms: i64) -> Self {
        Self {
            entries: HashMap::new(),
            max_size,
            ttl_ms,
        }
    }

    /// Cache id for a context at a key version
    pub fn cache_id(context: &str, version: u32) -> String {
        format!("{}-v{}", context, version)
    }

    /// Look up a live entry, dropping it if it has expired
    pub fn get(&mut self, id: &str, now: i64) -> Option<EncryptionKey> {
        let expired = match self.entries.get(id) {
            Some(entry) if now - entry.timestamp < self.ttl_ms => return Some(entry.key.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(id);
        }
        None
    }

    /// Insert or refresh an entry
    pub fn insert(&mut self, id: String, key: EncryptionKey, now: i64) {
        if self.max_size == 0 {
            return;
        }
        if !self.entries.contains_key(&id) && self.entries.len() >= self.max_size {
            self.evict_oldest();
        }
        self.entries.insert(id, CachedKey { key, timestamp: now });
    }

    /// Remove the entry with the oldest timestamp
    pub fn evict_oldest(&mut self) -> Option<String> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.timestamp)
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&oldest);
        Some(oldest)
    }

    /// Remove every entry past the TTL
    pub fn evict_expired(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl_ms;
        self.entries.retain(|_, entry| now - entry.timestamp < ttl);
        before - self.entries.len()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached keys, live or not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
