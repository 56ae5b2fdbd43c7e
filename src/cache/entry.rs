//! Cache Entry Module
//!
//! A single key's `(expiry, value)` cell and its compute-and-publish protocol.
//!
//! The expiry lives in an atomic so validity can be checked without locking,
//! while the value sits behind a read/write lock. A computation publishes the
//! new expiry *before* running the producer, so callers arriving mid-computation
//! see a valid entry and block on the read lock until the value lands instead
//! of starting a second computation.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::clock::{duration_ms, Timestamp};
use crate::error::{CacheError, Result};

// == Slot ==
/// What the last computation left behind.
#[derive(Debug)]
enum Slot<V> {
    /// Nothing yet, a computation is running, or its producer panicked
    Empty,
    Ready(V),
    /// The producer returned an error; kept until the entry expires
    Failed(Arc<anyhow::Error>),
}

// == Cache Entry ==
/// One key's cached value with its expiry timestamp.
#[derive(Debug)]
pub struct Entry<V> {
    /// Expiration timestamp (Unix milliseconds). Written only under the slot's write lock.
    expires_at: AtomicU64,
    slot: RwLock<Slot<V>>,
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Entry<V> {
    // == Constructor ==
    /// Creates an empty entry that is not yet valid.
    pub fn new() -> Self {
        Self {
            expires_at: AtomicU64::new(0),
            slot: RwLock::new(Slot::Empty),
        }
    }

    /// Returns the expiration timestamp in Unix milliseconds.
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at.load(Ordering::Acquire)
    }

    // == Is Valid ==
    /// Checks whether the entry is still fresh at `now`.
    ///
    /// Lock-free and advisory: an entry turns valid as soon as a computation
    /// starts, even though its value is only readable once that computation ends.
    /// The entry is expired from the exact expiry millisecond onwards.
    pub fn is_valid(&self, now: Timestamp) -> bool {
        self.expires_at() > now
    }

    /// Returns remaining TTL in milliseconds at `now`, or 0 once expired.
    pub fn ttl_remaining_ms(&self, now: Timestamp) -> u64 {
        self.expires_at().saturating_sub(now)
    }

    // == Compute And Publish ==
    /// Runs `producer` under the exclusive lock and stores its result.
    ///
    /// Fails fast with [`CacheError::ConcurrentComputeConflict`] if the write
    /// lock is already held. Otherwise the new expiry `now + ttl` is published
    /// before the producer runs and is kept even if the producer fails, leaving
    /// the entry valid-but-empty until it expires. Producer errors are recorded
    /// and returned as [`CacheError::ProducerFailed`].
    ///
    /// No timeout is applied: readers of this key wait for as long as the
    /// producer takes.
    pub fn compute_and_publish<F, E>(&self, now: Timestamp, ttl: Duration, producer: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<V, E>,
        E: Into<anyhow::Error>,
    {
        self.try_compute(now, ttl, producer)
            .unwrap_or(Err(CacheError::ConcurrentComputeConflict))
    }

    /// Same as [`Entry::compute_and_publish`], but hands `producer` back
    /// unused when the write lock is already held, so the caller can retry.
    pub(crate) fn try_compute<F, E>(
        &self,
        now: Timestamp,
        ttl: Duration,
        producer: F,
    ) -> std::result::Result<Result<()>, F>
    where
        F: FnOnce() -> std::result::Result<V, E>,
        E: Into<anyhow::Error>,
    {
        let Some(mut slot) = self.slot.try_write() else {
            return Err(producer);
        };

        self.expires_at
            .store(now.saturating_add(duration_ms(ttl)), Ordering::Release);
        *slot = Slot::Empty;

        Ok(match producer() {
            Ok(value) => {
                *slot = Slot::Ready(value);
                Ok(())
            }
            Err(err) => {
                let cause = Arc::new(err.into());
                warn!(error = %cause, "Value producer failed, entry stays empty until expiry");
                *slot = Slot::Failed(Arc::clone(&cause));
                Err(CacheError::ProducerFailed(cause))
            }
        })
    }

    // == Publish ==
    /// Stores `value` with expiry `now + ttl`, waiting for any running computation.
    ///
    /// Returns the replaced value if it was still valid at `now`.
    pub fn publish(&self, now: Timestamp, ttl: Duration, value: V) -> Option<V> {
        let mut slot = self.slot.write();
        let was_valid = self.is_valid(now);

        self.expires_at
            .store(now.saturating_add(duration_ms(ttl)), Ordering::Release);
        match mem::replace(&mut *slot, Slot::Ready(value)) {
            Slot::Ready(previous) if was_valid => Some(previous),
            _ => None,
        }
    }

    /// Returns true if the stored value equals `value`, blocking while a
    /// computation runs. Does not look at the expiry.
    pub fn holds(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        matches!(&*self.slot.read(), Slot::Ready(current) if current == value)
    }
}

impl<V: Clone> Entry<V> {
    // == Read Value ==
    /// Returns a clone of the stored value, blocking while a computation runs.
    ///
    /// Does not look at the expiry; pair with [`Entry::is_valid`].
    pub fn read_value(&self) -> Option<V> {
        match &*self.slot.read() {
            Slot::Ready(value) => Some(value.clone()),
            Slot::Empty | Slot::Failed(_) => None,
        }
    }

    /// Like [`Entry::read_value`], but reports why there is no value.
    pub fn read_outcome(&self) -> Result<V> {
        match &*self.slot.read() {
            Slot::Ready(value) => Ok(value.clone()),
            Slot::Failed(cause) => Err(CacheError::ProducerFailed(Arc::clone(cause))),
            Slot::Empty => {
                debug!("Entry read found no value");
                Err(CacheError::ComputationAbandoned)
            }
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc;
    use std::thread;

    const NOW: Timestamp = 1_000_000;
    const TTL: Duration = Duration::from_millis(1000);

    fn ok<V>(value: V) -> impl FnOnce() -> anyhow::Result<V> {
        move || Ok(value)
    }

    #[test]
    fn test_new_entry_is_invalid_and_empty() {
        let entry: Entry<String> = Entry::new();

        assert!(!entry.is_valid(NOW));
        assert!(!entry.is_valid(0));
        assert_eq!(entry.read_value(), None);
        assert!(matches!(
            entry.read_outcome(),
            Err(CacheError::ComputationAbandoned)
        ));
    }

    #[test]
    fn test_compute_stores_value_and_expiry() {
        let entry = Entry::new();

        entry.compute_and_publish(NOW, TTL, ok("v1".to_string())).unwrap();

        assert_eq!(entry.expires_at(), NOW + 1000);
        assert!(entry.is_valid(NOW));
        assert_eq!(entry.read_value(), Some("v1".to_string()));
        assert_eq!(entry.read_outcome().unwrap(), "v1");
        assert_eq!(entry.ttl_remaining_ms(NOW + 400), 600);
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let entry = Entry::new();
        entry.compute_and_publish(NOW, TTL, ok(1)).unwrap();

        assert!(entry.is_valid(NOW + 999));
        // Expired once the TTL has fully elapsed
        assert!(!entry.is_valid(NOW + 1000));
        assert_eq!(entry.ttl_remaining_ms(NOW + 5000), 0);
    }

    #[test]
    fn test_expiry_is_published_before_producer_runs() {
        let entry = Arc::new(Entry::new());
        let observer = Arc::clone(&entry);

        entry
            .compute_and_publish(NOW, TTL, move || {
                assert!(observer.is_valid(NOW), "expiry must be visible mid-compute");
                Ok::<_, anyhow::Error>(7)
            })
            .unwrap();
    }

    #[test]
    fn test_recompute_replaces_value() {
        let entry = Entry::new();
        entry.compute_and_publish(NOW, TTL, ok(1)).unwrap();
        entry.compute_and_publish(NOW + 2000, TTL, ok(2)).unwrap();

        assert_eq!(entry.read_value(), Some(2));
        assert_eq!(entry.expires_at(), NOW + 3000);
    }

    #[test]
    fn test_producer_failure_keeps_expiry_and_records_cause() {
        let entry: Entry<i32> = Entry::new();

        let result = entry.compute_and_publish(NOW, TTL, || Err(anyhow::anyhow!("boom")));

        let err = result.unwrap_err();
        assert_eq!(err.producer_cause().unwrap().to_string(), "boom");
        // Valid-but-empty until natural expiry
        assert!(entry.is_valid(NOW + 500));
        assert_eq!(entry.read_value(), None);
        match entry.read_outcome() {
            Err(CacheError::ProducerFailed(cause)) => assert_eq!(cause.to_string(), "boom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_failure_replaces_previous_value() {
        let entry = Entry::new();
        entry.compute_and_publish(NOW, TTL, ok(1)).unwrap();

        let _ = entry.compute_and_publish(NOW + 2000, TTL, || Err(anyhow::anyhow!("gone")));

        assert_eq!(entry.read_value(), None);
    }

    #[test]
    fn test_concurrent_compute_conflict() {
        let entry = Arc::new(Entry::new());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let worker = {
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                entry.compute_and_publish(NOW, TTL, move || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok::<_, anyhow::Error>("winner")
                })
            })
        };

        started_rx.recv().unwrap();
        let result = entry.compute_and_publish(NOW, TTL, ok("loser"));
        assert!(matches!(result, Err(CacheError::ConcurrentComputeConflict)));

        release_tx.send(()).unwrap();
        worker.join().unwrap().unwrap();
        assert_eq!(entry.read_value(), Some("winner"));
    }

    #[test]
    fn test_read_blocks_until_computation_finishes() {
        let entry = Arc::new(Entry::new());
        let (started_tx, started_rx) = mpsc::channel();

        let worker = {
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                entry.compute_and_publish(NOW, TTL, move || {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(200));
                    Ok::<_, anyhow::Error>(42)
                })
            })
        };

        started_rx.recv().unwrap();
        assert!(entry.is_valid(NOW));
        // The slot is empty while computing, so Some(42) proves the read waited
        assert_eq!(entry.read_value(), Some(42));

        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_publish_returns_previous_valid_value() {
        let entry = Entry::new();

        assert_eq!(entry.publish(NOW, TTL, "a"), None);
        assert_eq!(entry.publish(NOW + 10, TTL, "b"), Some("a"));
        assert_eq!(entry.expires_at(), NOW + 1010);

        // Previous value expired: nothing is reported
        assert_eq!(entry.publish(NOW + 5000, TTL, "c"), None);
        assert_eq!(entry.read_value(), Some("c"));
    }

    #[test]
    fn test_panicking_producer_leaves_entry_abandoned() {
        let entry: Entry<i32> = Entry::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            entry.compute_and_publish(NOW, TTL, || -> anyhow::Result<i32> {
                panic!("producer exploded")
            })
        }));
        assert!(result.is_err());

        // The lock is released and the entry is valid-but-empty
        assert!(entry.is_valid(NOW));
        assert!(matches!(
            entry.read_outcome(),
            Err(CacheError::ComputationAbandoned)
        ));
        entry.compute_and_publish(NOW + 2000, TTL, ok(5)).unwrap();
        assert_eq!(entry.read_value(), Some(5));
    }

    #[test]
    fn test_try_compute_hands_producer_back_while_read_locked() {
        let entry = Entry::new();
        entry.publish(NOW, TTL, 1);

        let guard = entry.slot.read();
        let returned = match entry.try_compute(NOW + 5000, TTL, ok(2)) {
            Err(producer) => producer,
            Ok(outcome) => panic!("computed while a reader held the lock: {:?}", outcome),
        };
        // Nothing was published
        assert_eq!(entry.expires_at(), NOW + 1000);
        drop(guard);

        entry.try_compute(NOW + 5000, TTL, returned).ok().unwrap().unwrap();
        assert_eq!(entry.read_value(), Some(2));
        assert_eq!(entry.expires_at(), NOW + 6000);
    }

    #[test]
    fn test_holds_compares_stored_value() {
        let entry = Entry::new();
        assert!(!entry.holds(&"a"));

        entry.publish(NOW, TTL, "a");
        assert!(entry.holds(&"a"));
        assert!(!entry.holds(&"b"));

        let _ = entry.compute_and_publish(NOW + 2000, TTL, || -> anyhow::Result<&str> {
            Err(anyhow::anyhow!("boom"))
        });
        assert!(!entry.holds(&"a"));
    }
}
