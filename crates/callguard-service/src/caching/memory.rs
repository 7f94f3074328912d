use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;

use crate::key::EndpointKey;

use super::CacheEntry;

/// The in-memory tier: a strict LRU bounded by entry count.
///
/// A capacity of `0` disables the tier.
#[derive(Debug)]
pub struct MemoryTier {
    entries: Option<Mutex<LruCache<EndpointKey, CacheEntry>>>,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        let entries = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self { entries }
    }

    /// Looks up `key`, marking it as most recently used.
    pub fn get(&self, key: &EndpointKey) -> Option<CacheEntry> {
        let entries = self.entries.as_ref()?;
        let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Inserts or replaces the entry, evicting the least recently used one if full.
    pub fn insert(&self, entry: CacheEntry) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        let key = entry.key.clone();
        let evicted = entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone(), entry);
        if let Some((evicted, _)) = evicted.filter(|(evicted, _)| *evicted != key) {
            tracing::trace!(key = %evicted, "Evicted entry from memory cache");
            metric!(counter("caches.memory.evicted") += 1);
        }
    }

    pub fn remove(&self, key: &EndpointKey) -> Option<CacheEntry> {
        let entries = self.entries.as_ref()?;
        let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.pop(key)
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| {
            entries.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry {
            key: EndpointKey::for_testing(key),
            value: Bytes::from(key.to_owned()),
            created_at: 0,
            max_age: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_lru_eviction() {
        let tier = MemoryTier::new(2);
        tier.insert(entry("a"));
        tier.insert(entry("b"));

        // touching `a` makes `b` the least recently used one
        assert!(tier.get(&EndpointKey::for_testing("a")).is_some());
        tier.insert(entry("c"));

        assert_eq!(tier.len(), 2);
        assert!(tier.get(&EndpointKey::for_testing("a")).is_some());
        assert!(tier.get(&EndpointKey::for_testing("b")).is_none());
        assert!(tier.get(&EndpointKey::for_testing("c")).is_some());
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let tier = MemoryTier::new(2);
        tier.insert(entry("a"));
        let mut newer = entry("a");
        newer.value = Bytes::from_static(b"newer");
        tier.insert(newer);

        assert_eq!(tier.len(), 1);
        let found = tier.get(&EndpointKey::for_testing("a")).unwrap();
        assert_eq!(found.value, "newer");
    }

    #[test]
    fn test_disabled() {
        let tier = MemoryTier::new(0);
        tier.insert(entry("a"));
        assert!(tier.is_empty());
        assert!(tier.get(&EndpointKey::for_testing("a")).is_none());
    }
}
