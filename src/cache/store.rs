//! Cache Store Module
//!
//! Main cache engine combining the eviction map with per-entry TTL and
//! single-flight recomputation.
//!
//! Two kinds of lock are involved and they are never nested:
//! - the container lock around the [`EvictionMap`], held only for lookups and
//!   for creating entries of brand-new keys;
//! - each [`Entry`]'s own read/write lock, held while reading or computing
//!   that key's value.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::cache::stats::StatsCounters;
use crate::cache::{CacheStats, Entry, EvictionMap};
use crate::clock::{duration_ms, Clock, SystemClock, Timestamp};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Extra try-lock attempts a stale `fetch_or_compute` makes before reporting
/// [`CacheError::ConcurrentComputeConflict`].
const CONFLICT_RETRIES: usize = 8;

// == Cache Store ==
/// A bounded TTL cache guaranteeing at most one running computation per key.
///
/// Expiry is lazy: stale entries are filtered out on read but keep occupying a
/// capacity slot until evicted, overwritten, or removed.
pub struct CacheStore<K, V> {
    /// Key to entry storage, insertion-order eviction
    entries: RwLock<EvictionMap<K, Arc<Entry<V>>>>,
    /// TTL applied on every computation or put
    ttl: Duration,
    clock: Arc<dyn Clock>,
    /// Performance statistics
    stats: StatsCounters,
}

impl<K, V> fmt::Debug for CacheStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("CacheStore")
            .field("capacity", &entries.capacity())
            .field("len", &entries.len())
            .field("ttl", &self.ttl)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    // == Constructor ==
    /// Creates a new CacheStore on the system clock.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of entries the cache can hold
    /// * `ttl` - Lifetime of every computed or stored value
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        Self::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    /// Creates a new CacheStore reading time from `clock`.
    pub fn with_clock(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        CacheConfig::new(capacity, ttl).validate()?;
        debug!(capacity, ttl_ms = duration_ms(ttl), "Cache store initialized");

        Ok(Self {
            entries: RwLock::new(EvictionMap::new(capacity)),
            ttl,
            clock,
            stats: StatsCounters::default(),
        })
    }

    /// Creates a new CacheStore on the system clock from a config.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(config.capacity, config.ttl)
    }

    /// Maximum number of entries held at once.
    pub fn capacity(&self) -> usize {
        self.entries.read().capacity()
    }

    /// TTL applied to every computed or stored value.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // == Entry Lookup ==
    fn lookup<Q>(&self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.read().get(key).map(Arc::clone)
    }

    /// Returns the entry for `key`, creating it if absent.
    ///
    /// Creation re-checks under the write lock so two first accesses to the
    /// same key always share one entry.
    fn entry_for(&self, key: &K) -> Arc<Entry<V>> {
        if let Some(entry) = self.lookup(key) {
            return entry;
        }

        let (entry, evicted) = {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get(key) {
                return Arc::clone(entry);
            }
            let entry = Arc::new(Entry::new());
            let (_, evicted) = entries.insert_full(key.clone(), Arc::clone(&entry));
            (entry, evicted)
        };

        // Dropped outside the container lock
        if let Some((_, oldest)) = evicted {
            let evictions = self.stats.record_eviction();
            debug!(
                evictions,
                was_valid = oldest.is_valid(self.now()),
                "Evicted oldest entry to stay within capacity"
            );
        }
        entry
    }

    // == Get ==
    /// Returns the value for `key` if present and not expired.
    ///
    /// Blocks while that key's value is being computed.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.now();
        let value = self
            .lookup(key)
            .filter(|entry| entry.is_valid(now))
            .and_then(|entry| entry.read_value());

        if value.is_some() {
            self.stats.record_hit();
            trace!("Cache hit");
        } else {
            self.stats.record_miss();
            trace!("Cache miss");
        }
        value
    }

    // == Put ==
    /// Stores `value` under `key` with a fresh TTL.
    ///
    /// Waits for a running computation of the same key, then overwrites it.
    /// Returns the previous value if it was still valid.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let entry = self.entry_for(&key);
        entry.publish(self.now(), self.ttl, value)
    }

    /// Stores every pair from `items`.
    pub fn put_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in items {
            self.put(key, value);
        }
    }

    // == Remove ==
    /// Removes `key`, returning its value only if it was still valid.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.now();
        let entry = self.entries.write().remove(key)?;
        if entry.is_valid(now) {
            entry.read_value()
        } else {
            None
        }
    }

    /// Returns true if `key` holds a valid entry.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.now();
        self.lookup(key).is_some_and(|entry| entry.is_valid(now))
    }

    /// Returns true if some valid entry holds `value`.
    ///
    /// Scans every entry; entries left empty by a failed computation never match.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.valid_entries()
            .iter()
            .any(|(_, entry)| entry.holds(value))
    }

    // == Fetch Or Compute ==
    /// Returns the cached value for `key`, computing it with `producer` if the
    /// entry is absent or expired.
    ///
    /// Concurrent callers for the same stale key run `producer` once: the first
    /// takes the entry's write lock, the rest block on the read lock and receive
    /// the same value, or the same [`CacheError::ProducerFailed`]. A failed
    /// computation leaves the entry valid-but-empty, so until it expires callers
    /// keep getting that failure rather than a retry.
    ///
    /// A caller that finds the entry stale but its write lock taken joins only
    /// once the entry has turned valid again, i.e. once another caller has
    /// published a new expiry. Readers still cloning the stale value also hold
    /// that lock; if it stays taken after a few retries the call fails with the
    /// retryable [`CacheError::ConcurrentComputeConflict`] instead of returning
    /// the expired value.
    ///
    /// Different keys never wait on each other. No timeout is applied to
    /// `producer`.
    pub fn fetch_or_compute<F, E>(&self, key: K, producer: F) -> Result<V>
    where
        F: FnOnce() -> std::result::Result<V, E>,
        E: Into<anyhow::Error>,
    {
        let entry = self.entry_for(&key);
        let now = self.now();

        if entry.is_valid(now) {
            let outcome = entry.read_outcome();
            if outcome.is_ok() {
                self.stats.record_hit();
            } else {
                self.stats.record_miss();
            }
            return outcome;
        }

        self.stats.record_miss();
        self.compute_or_join(&entry, now, producer)
    }

    /// Drives the compute path of an entry that was stale at `now`.
    fn compute_or_join<F, E>(&self, entry: &Entry<V>, now: Timestamp, mut producer: F) -> Result<V>
    where
        F: FnOnce() -> std::result::Result<V, E>,
        E: Into<anyhow::Error>,
    {
        let mut retries = 0;

        loop {
            match entry.try_compute(now, self.ttl, producer) {
                Ok(Ok(())) => {
                    self.stats.record_computation();
                    debug!(expires_at = entry.expires_at(), "Computed fresh value");
                    break;
                }
                Ok(Err(err)) => {
                    self.stats.record_computation();
                    self.stats.record_compute_failure();
                    return Err(err);
                }
                // A fresh expiry means another caller is computing or has put a value
                Err(_) if entry.is_valid(now) => {
                    self.stats.record_conflict();
                    debug!("Joining in-flight computation");
                    break;
                }
                Err(_) if retries == CONFLICT_RETRIES => {
                    self.stats.record_conflict();
                    debug!(retries, "Entry lock still held while stale");
                    return Err(CacheError::ConcurrentComputeConflict);
                }
                Err(returned) => {
                    producer = returned;
                    retries += 1;
                    thread::yield_now();
                }
            }
        }

        let outcome = entry.read_outcome();
        if let Err(CacheError::ComputationAbandoned) = &outcome {
            warn!("Computation ended without a value");
        }
        outcome
    }

    // == Snapshots ==
    fn valid_entries(&self) -> Vec<(K, Arc<Entry<V>>)> {
        let now = self.now();
        self.entries
            .read()
            .entries()
            .filter(|(_, entry)| entry.is_valid(now))
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect()
    }

    /// Keys of valid entries, oldest insertion first.
    pub fn keys(&self) -> Vec<K> {
        self.valid_entries().into_iter().map(|(key, _)| key).collect()
    }

    /// Values of valid entries, oldest insertion first.
    ///
    /// Entries left empty by a failed computation are skipped.
    pub fn values(&self) -> Vec<V> {
        self.valid_entries()
            .into_iter()
            .filter_map(|(_, entry)| entry.read_value())
            .collect()
    }

    /// Key-value pairs of valid entries, oldest insertion first.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.valid_entries()
            .into_iter()
            .filter_map(|(key, entry)| entry.read_value().map(|value| (key, value)))
            .collect()
    }

    // == Length ==
    /// Returns the number of held entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    // == Is Empty ==
    /// Returns true if no entries are held, expired ones included.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry. Statistics are kept.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.len())
    }
}
