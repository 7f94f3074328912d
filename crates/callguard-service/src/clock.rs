//! Time sources used for cache freshness and debounce windows.
//!
//! All timestamps are milliseconds. Backoff sleeps and follower timeouts go through
//! [`tokio::time`] instead, so they can be paused in tests independently of the [`Clock`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A monotonic source of "now" in milliseconds.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// Persisted cache entries carry timestamps from this clock, so they stay comparable across
/// restarts. Readings never go backwards within one process, even if the system time does.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(as_millis)
            .unwrap_or_default();
        let previous = self.last.fetch_max(wall, Ordering::Relaxed);
        previous.max(wall)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Jumps to `now`. Moving backwards is ignored.
    pub fn set(&self, now: u64) {
        self.now.fetch_max(now, Ordering::Relaxed);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(as_millis(by), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Converts a [`Duration`] into whole milliseconds, saturating at `u64::MAX`.
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
