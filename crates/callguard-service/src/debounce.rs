//! Coalescing of concurrent calls for the same key.
//!
//! The first caller for a key becomes the [`Lead`](Admission::Lead) and performs the call.
//! Everyone arriving while the call is in flight, or within the debounce window after it
//! completed, becomes a [`Follow`](Admission::Follow)er and receives the lead's outcome,
//! failures included.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::clock::{Clock, as_millis};
use crate::error::CallError;
use crate::key::EndpointKey;
use crate::utils::Sharded;

/// The outcome of a call, shared by the lead with all its followers.
pub type Outcome = Result<Bytes, CallError>;

type Records = HashMap<EndpointKey, Record>;

#[derive(Debug)]
enum Record {
    /// The lead is still working. Followers subscribe to `tx`.
    InFlight {
        started_at: u64,
        tx: watch::Sender<Option<Outcome>>,
    },
    /// The lead completed and the debounce window is open.
    Completed {
        completed_at: u64,
        window: u64,
        outcome: Outcome,
    },
}

impl Record {
    fn is_expired(&self, now: u64) -> bool {
        match self {
            Record::InFlight { .. } => false,
            Record::Completed {
                completed_at,
                window,
                ..
            } => now.saturating_sub(*completed_at) >= *window,
        }
    }
}

/// Whether a caller leads or follows a call.
#[derive(Debug)]
pub enum Admission {
    Lead(LeadGuard),
    Follow(Follower),
}

/// Per-key coalescing of calls, with a debounce window after completion.
#[derive(Debug)]
pub struct DebounceGate {
    clock: Arc<dyn Clock>,
    shards: Sharded<Mutex<Records>>,
}

impl DebounceGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shards: Sharded::default(),
        }
    }

    /// Admits a caller for `key`.
    ///
    /// The returned [`LeadGuard`] opens a window of `debounce` once completed. Records whose
    /// window has passed are discarded here, for all keys sharing a shard with `key`.
    pub fn begin(self: &Arc<Self>, key: &EndpointKey, debounce: Duration) -> Admission {
        let now = self.clock.now();
        let mut records = self.lock(key);
        records.retain(|_, record| !record.is_expired(now));

        match records.get(key) {
            Some(Record::InFlight { started_at, tx }) => {
                tracing::trace!(%key, in_flight_ms = now.saturating_sub(*started_at), "Joining in-flight call");
                Admission::Follow(Follower {
                    state: FollowState::Waiting(tx.subscribe()),
                })
            }
            Some(Record::Completed { outcome, .. }) => {
                tracing::trace!(%key, "Joining recently completed call");
                Admission::Follow(Follower {
                    state: FollowState::Ready(outcome.clone()),
                })
            }
            None => {
                let (tx, _) = watch::channel(None);
                records.insert(
                    key.clone(),
                    Record::InFlight {
                        started_at: now,
                        tx,
                    },
                );
                Admission::Lead(LeadGuard {
                    gate: Arc::clone(self),
                    key: key.clone(),
                    debounce,
                    completed: false,
                })
            }
        }
    }

    /// Whether a lead for `key` is currently working.
    pub fn is_in_flight(&self, key: &EndpointKey) -> bool {
        matches!(self.lock(key).get(key), Some(Record::InFlight { .. }))
    }

    /// Number of records, including expired ones not yet discarded.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self, key: &EndpointKey) -> MutexGuard<'_, Records> {
        self.shards
            .for_key(key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the caller that performs the call.
///
/// Dropping the guard without completing it releases the key, and all waiting followers
/// receive [`CallError::Abandoned`].
#[derive(Debug)]
#[must_use = "followers wait until the lead is completed"]
pub struct LeadGuard {
    gate: Arc<DebounceGate>,
    key: EndpointKey,
    debounce: Duration,
    completed: bool,
}

impl LeadGuard {
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Hands `outcome` to all followers and opens the debounce window.
    pub fn complete(mut self, outcome: Outcome) {
        let window = self.debounce;
        self.finish(outcome, window);
    }

    /// Hands `outcome` to all current followers without opening a debounce window.
    pub fn complete_bypassing_window(mut self, outcome: Outcome) {
        self.finish(outcome, Duration::ZERO);
    }

    fn finish(&mut self, outcome: Outcome, window: Duration) {
        self.completed = true;
        let now = self.gate.clock.now();
        let mut records = self.gate.lock(&self.key);

        if let Some(Record::InFlight { tx, .. }) = records.remove(&self.key) {
            tx.send_replace(Some(outcome.clone()));
        }
        if !window.is_zero() {
            records.insert(
                self.key.clone(),
                Record::Completed {
                    completed_at: now,
                    window: as_millis(window),
                    outcome,
                },
            );
        }
    }
}

impl Drop for LeadGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        tracing::warn!(key = %self.key, "In-flight call was abandoned");
        let mut records = self.gate.lock(&self.key);
        if matches!(records.get(&self.key), Some(Record::InFlight { .. })) {
            records.remove(&self.key);
        }
    }
}

#[derive(Debug)]
enum FollowState {
    Ready(Outcome),
    Waiting(watch::Receiver<Option<Outcome>>),
}

/// A caller waiting for the outcome of a lead.
///
/// Dropping a follower only affects that follower.
#[derive(Debug)]
pub struct Follower {
    state: FollowState,
}

impl Follower {
    /// Waits for the lead's outcome for at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> Outcome {
        let mut rx = match self.state {
            FollowState::Ready(outcome) => return outcome,
            FollowState::Waiting(rx) => rx,
        };

        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => (*outcome).clone().unwrap_or(Err(CallError::Abandoned)),
            Ok(Err(_)) => Err(CallError::Abandoned),
            Err(_) => {
                metric!(counter("calls.debounce_timeout") += 1);
                Err(CallError::DebounceTimeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;

    use super::*;

    const WAIT: Duration = Duration::from_secs(30);

    fn gate() -> (Arc<ManualClock>, Arc<DebounceGate>) {
        let clock = Arc::new(ManualClock::new(0));
        let gate = Arc::new(DebounceGate::new(clock.clone()));
        (clock, gate)
    }

    fn lead(admission: Admission) -> LeadGuard {
        match admission {
            Admission::Lead(guard) => guard,
            Admission::Follow(_) => panic!("expected to lead"),
        }
    }

    fn follow(admission: Admission) -> Follower {
        match admission {
            Admission::Follow(follower) => follower,
            Admission::Lead(_) => panic!("expected to follow"),
        }
    }

    #[tokio::test]
    async fn test_followers_receive_outcome() {
        let (_clock, gate) = gate();
        let key = EndpointKey::for_testing("a");

        let guard = lead(gate.begin(&key, Duration::from_secs(1)));
        let first = follow(gate.begin(&key, Duration::from_secs(1)));
        let second = follow(gate.begin(&key, Duration::from_secs(1)));
        assert!(gate.is_in_flight(&key));

        guard.complete(Ok(Bytes::from_static(b"hot")));

        assert_eq!(first.wait(WAIT).await.unwrap(), "hot");
        assert_eq!(second.wait(WAIT).await.unwrap(), "hot");
        assert!(!gate.is_in_flight(&key));
    }

    #[tokio::test]
    async fn test_debounce_window() {
        let (clock, gate) = gate();
        let key = EndpointKey::for_testing("a");

        let guard = lead(gate.begin(&key, Duration::from_millis(1000)));
        guard.complete(Err(CallError::Server(503)));

        clock.set(999);
        let follower = follow(gate.begin(&key, Duration::from_millis(1000)));
        assert_eq!(follower.wait(WAIT).await, Err(CallError::Server(503)));

        clock.set(1000);
        let _guard = lead(gate.begin(&key, Duration::from_millis(1000)));
    }

    #[tokio::test]
    async fn test_bypassing_window() {
        let (_clock, gate) = gate();
        let key = EndpointKey::for_testing("a");

        let guard = lead(gate.begin(&key, Duration::from_secs(1)));
        let follower = follow(gate.begin(&key, Duration::from_secs(1)));
        guard.complete_bypassing_window(Err(CallError::Server(503)));

        assert_eq!(follower.wait(WAIT).await, Err(CallError::Server(503)));
        assert!(gate.is_empty());
        let _guard = lead(gate.begin(&key, Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_abandoned_lead() {
        let (_clock, gate) = gate();
        let key = EndpointKey::for_testing("a");

        let guard = lead(gate.begin(&key, Duration::from_secs(1)));
        let follower = follow(gate.begin(&key, Duration::from_secs(1)));
        drop(guard);

        assert_eq!(follower.wait(WAIT).await, Err(CallError::Abandoned));
        let _guard = lead(gate.begin(&key, Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_timeout() {
        let (_clock, gate) = gate();
        let key = EndpointKey::for_testing("a");

        let guard = lead(gate.begin(&key, Duration::from_secs(1)));
        let impatient = follow(gate.begin(&key, Duration::from_secs(1)));
        let patient = follow(gate.begin(&key, Duration::from_secs(1)));

        assert_eq!(
            impatient.wait(Duration::from_secs(5)).await,
            Err(CallError::DebounceTimeout(Duration::from_secs(5)))
        );

        // the lead and other followers are unaffected
        assert!(gate.is_in_flight(&key));
        guard.complete(Ok(Bytes::from_static(b"late")));
        assert_eq!(patient.wait(WAIT).await.unwrap(), "late");
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let (_clock, gate) = gate();
        let a = EndpointKey::for_testing("a");
        let b = EndpointKey::for_testing("b");

        let lead_a = lead(gate.begin(&a, Duration::from_secs(1)));
        let lead_b = lead(gate.begin(&b, Duration::from_secs(1)));

        lead_b.complete(Ok(Bytes::from_static(b"b")));
        assert!(gate.is_in_flight(&a));
        lead_a.complete(Ok(Bytes::from_static(b"a")));
    }

    #[test]
    fn test_expired_records_are_swept() {
        let (clock, gate) = gate();
        let keys: Vec<_> = (0..32)
            .map(|i| EndpointKey::for_testing(format!("key-{i}")))
            .collect();

        for key in &keys {
            lead(gate.begin(key, Duration::from_millis(100))).complete(Ok(Bytes::new()));
        }
        assert_eq!(gate.len(), 32);

        clock.set(100);
        for key in &keys {
            lead(gate.begin(key, Duration::from_millis(100)))
                .complete_bypassing_window(Ok(Bytes::new()));
        }
        assert!(gate.is_empty());
    }
}
