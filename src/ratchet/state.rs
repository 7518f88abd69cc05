//! Per-conversation ratchet state and its bounded message-key cache.

use std::collections::BTreeMap;

use crate::crypto::EncryptionKey;

/// Message keys by counter, bounded to `max` entries
pub struct MessageKeyCache {
    keys: BTreeMap<u64, EncryptionKey>,
    max: usize,
}

impl MessageKeyCache {
    /// Create an empty cache holding at most `max` keys
    pub fn new(max: usize) -> Self {
        Self {
            keys: BTreeMap::new(),
            max,
        }
    }

    /// Key for `counter`, if cached
    pub fn get(&self, counter: u64) -> Option<&EncryptionKey> {
        self.keys.get(&counter)
    }

    /// Cache a key, evicting the oldest half if the bound is exceeded
    pub fn insert(&mut self, counter: u64, key: EncryptionKey) {
        self.keys.insert(counter, key);
        if self.keys.len() > self.max {
            self.evict_oldest_half();
        }
    }

    /// Drop the lowest-counter half of the cache
    ///
    /// Returns the number of keys dropped.
    pub fn evict_oldest_half(&mut self) -> usize {
        let drop_count = self.keys.len() / 2;
        let Some(&split_at) = self.keys.keys().nth(drop_count) else {
            return 0;
        };
        let kept = self.keys.split_off(&split_at);
        let dropped = self.keys.len();
        self.keys = kept;
        dropped
    }

    /// Lowest cached counter
    pub fn oldest(&self) -> Option<u64> {
        self.keys.keys().next().copied()
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are cached
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop every key
    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Live ratchet state for one conversation
pub(crate) struct RatchetState {
    pub root: EncryptionKey,
    pub chain: EncryptionKey,
    pub counter: u64,
    pub previous_counter: u64,
    pub cache: MessageKeyCache,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> EncryptionKey {
        EncryptionKey::from_bytes([n as u8; 32])
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = MessageKeyCache::new(10);
        cache.insert(3, key(3));
        assert_eq!(cache.get(3), Some(&key(3)));
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest_half() {
        let mut cache = MessageKeyCache::new(4);
        for n in 0..5 {
            cache.insert(n, key(n));
        }
        // 5 > 4 triggers eviction of the lowest 2
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.oldest(), Some(2));
        assert!(cache.get(0).is_none());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn test_evict_oldest_half_explicit() {
        let mut cache = MessageKeyCache::new(100);
        for n in [10, 2, 7, 5] {
            cache.insert(n, key(n));
        }
        assert_eq!(cache.evict_oldest_half(), 2);
        assert_eq!(cache.oldest(), Some(7));

        let mut empty = MessageKeyCache::new(1);
        assert_eq!(empty.evict_oldest_half(), 0);
        assert!(empty.is_empty());
    }
}
