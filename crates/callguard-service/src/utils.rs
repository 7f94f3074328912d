use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};

use crate::key::EndpointKey;

/// Default number of lock stripes for per-key state.
pub const DEFAULT_SHARDS: usize = 16;

/// A fixed set of independently locked buckets, picked by [`EndpointKey`].
///
/// Shards only guard in-memory bookkeeping. Use [`KeyLocks`] to serialize blocking work per key.
#[derive(Debug)]
pub struct Sharded<T> {
    shards: Box<[T]>,
}

impl<T: Default> Sharded<T> {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| T::default()).collect(),
        }
    }
}

impl<T: Default> Default for Sharded<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl<T> Sharded<T> {
    pub fn for_key(&self, key: &EndpointKey) -> &T {
        &self.shards[key.shard(self.shards.len())]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.shards.iter()
    }
}

/// Mutual exclusion per [`EndpointKey`].
///
/// Only keys that are currently locked are tracked. Waiting for one key never blocks callers
/// of another key.
#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<EndpointKey>>,
    released: Condvar,
}

impl KeyLocks {
    /// Blocks until `key` is free, then holds it until the guard is dropped.
    pub fn lock(&self, key: &EndpointKey) -> KeyLockGuard<'_> {
        let mut held = self.held();
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.clone());

        KeyLockGuard {
            locks: self,
            key: key.clone(),
        }
    }

    pub fn is_locked(&self, key: &EndpointKey) -> bool {
        self.held().contains(key)
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<EndpointKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a key of [`KeyLocks`].
#[derive(Debug)]
#[must_use = "the key is released when the guard is dropped"]
pub struct KeyLockGuard<'a> {
    locks: &'a KeyLocks,
    key: EndpointKey,
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.key);
        self.locks.released.notify_all();
    }
}
