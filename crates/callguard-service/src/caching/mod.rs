//! # The two-tier response cache
//!
//! Successful responses of cacheable endpoints are kept in a [`CacheStore`], keyed by
//! [`EndpointKey`]. The store has two tiers:
//!
//! - The [`MemoryTier`] holds a bounded number of entries and evicts the least recently used
//!   one when full.
//! - The optional [`DiskTier`] lives in `<cache_dir>/responses`, is bounded by total size and
//!   evicts the entries with the oldest creation time first. It survives restarts.
//!
//! Reads check memory first and fall back to disk, promoting disk hits into memory. Writes go
//! to both tiers.
//!
//! Every entry carries its creation time and maximum age. An entry is fresh as long as
//! `now - created_at <= max_age`; stale entries read as misses and are dropped on the way. No
//! background task expires entries, though `cleanup` can be used to sweep the disk tier.
//!
//! Failures of the disk tier are logged and turn into misses or skipped writes, they never
//! fail a call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::clock::{Clock, as_millis};
use crate::config::Config;
use crate::key::EndpointKey;
use crate::utils::{KeyLockGuard, KeyLocks};

mod cache_error;
mod disk;
mod memory;


pub use cache_error::CacheError;
pub use disk::{CleanupStats, DISK_FORMAT_VERSION, DiskTier};
pub use memory::MemoryTier;

/// A cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: EndpointKey,
    pub value: Bytes,
    /// Creation time in milliseconds of the store's [`Clock`].
    pub created_at: u64,
    pub max_age: Duration,
}

impl CacheEntry {
    /// Whether this entry may still be served at `now`.
    pub fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) <= as_millis(self.max_age)
    }
}

/// The two-tier response cache.
///
/// Operations on the same key are serialized, including their disk I/O. Operations on different
/// keys only contend on the brief bookkeeping locks of the tiers.
#[derive(Debug)]
pub struct CacheStore {
    clock: Arc<dyn Clock>,
    memory: MemoryTier,
    disk: Option<DiskTier>,
    locks: KeyLocks,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>, memory: MemoryTier, disk: Option<DiskTier>) -> Self {
        Self {
            clock,
            memory,
            disk,
            locks: KeyLocks::default(),
        }
    }

    /// Creates the store from the `caches` section of the config.
    ///
    /// The disk tier is only used when a `cache_dir` is configured.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let memory = MemoryTier::new(config.caches.in_memory_capacity);
        let disk = match config.cache_dir.as_deref() {
            Some(cache_dir) => Some(DiskTier::open(cache_dir, config.caches.disk_capacity)?),
            None => None,
        };
        Ok(Self::new(clock, memory, disk))
    }

    /// Returns the fresh entry for `key`, if any.
    pub fn get(&self, key: &EndpointKey) -> Option<CacheEntry> {
        let _guard = self.lock(key);
        let now = self.clock.now();

        if let Some(entry) = self.memory.get(key) {
            if entry.is_fresh(now) {
                metric!(counter("caches.access") += 1, "hit" => "memory");
                return Some(entry);
            }
            tracing::trace!(%key, "Dropping stale cache entry");
            self.memory.remove(key);
            self.remove_from_disk(key);
            metric!(counter("caches.access") += 1, "hit" => "stale");
            return None;
        }

        let disk = self.disk.as_ref()?;
        match disk.load(key) {
            Ok(Some(entry)) if entry.is_fresh(now) => {
                metric!(counter("caches.access") += 1, "hit" => "disk");
                self.memory.insert(entry.clone());
                Some(entry)
            }
            Ok(Some(_)) => {
                tracing::trace!(%key, "Dropping stale cache entry");
                self.remove_from_disk(key);
                metric!(counter("caches.access") += 1, "hit" => "stale");
                None
            }
            Ok(None) => {
                metric!(counter("caches.access") += 1, "hit" => "miss");
                None
            }
            Err(e) => {
                metric!(counter("caches.access") += 1, "hit" => "error");
                record_failure(key, "read", &e);
                None
            }
        }
    }

    /// Inserts or overwrites the entry for `key`, created now.
    pub fn put(&self, key: &EndpointKey, value: Bytes, max_age: Duration) {
        let _guard = self.lock(key);
        let entry = CacheEntry {
            key: key.clone(),
            value,
            created_at: self.clock.now(),
            max_age,
        };

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.store(&entry) {
                record_failure(key, "write", &e);
            }
        }
        self.memory.insert(entry);
    }

    /// Removes `key` from both tiers, regardless of freshness.
    pub fn invalidate(&self, key: &EndpointKey) {
        let _guard = self.lock(key);
        self.memory.remove(key);
        self.remove_from_disk(key);
        tracing::debug!(%key, "Invalidated cache entry");
    }

    /// Removes all stale and unreadable entries from the disk tier.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> anyhow::Result<CleanupStats> {
        let disk = self.disk.as_ref().ok_or_else(|| {
            anyhow::anyhow!("no caching configured! Did you provide a path to your config file?")
        })?;
        disk.cleanup(self.clock.now(), dry_run)
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn disk(&self) -> Option<&DiskTier> {
        self.disk.as_ref()
    }

    fn remove_from_disk(&self, key: &EndpointKey) {
        let Some(disk) = &self.disk else {
            return;
        };
        if let Err(e) = disk.remove(key) {
            record_failure(key, "remove", &e);
        }
    }

    fn lock(&self, key: &EndpointKey) -> KeyLockGuard<'_> {
        self.locks.lock(key)
    }
}

/// Logs a failure of the disk tier. The call itself carries on as if the entry was missing.
fn record_failure(key: &EndpointKey, operation: &str, error: &CacheError) {
    tracing::error!(
        error = error as &dyn std::error::Error,
        %key,
        operation,
        "Disk cache operation failed"
    );
    metric!(
        counter("caches.disk.failures") += 1,
        "kind" => error.kind().as_str(),
        "operation" => operation,
    );
}
