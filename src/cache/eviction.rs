//! Eviction Map Module
//!
//! Capacity-bounded map that evicts in insertion order.

use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::mem;

// == Eviction Map ==
/// An insertion-ordered map holding at most `capacity` entries.
///
/// Inserting a new key past capacity drops the oldest *inserted* key. Reads and
/// value replacements never move a key, so this is FIFO eviction even though
/// callers often think of it as LRU.
///
/// Keys are stored in a VecDeque where:
/// - Front = Oldest insertion (next eviction candidate)
/// - Back = Newest insertion
#[derive(Debug, Clone)]
pub struct EvictionMap<K, V> {
    /// Key-value storage
    map: HashMap<K, V>,
    /// Keys by insertion time
    order: VecDeque<K>,
    /// Maximum number of entries retained
    capacity: usize,
}

impl<K, V> EvictionMap<K, V>
where
    K: Eq + Hash + Clone,
{
    // == Constructor ==
    /// Creates an empty map bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns the maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // == Get ==
    /// Looks up a key without touching its eviction position.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key)
    }

    /// Returns true if `key` is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    // == Insert ==
    /// Inserts or replaces a value, returning the replaced value.
    ///
    /// See [`EvictionMap::insert_full`] for the eviction rules.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_full(key, value).0
    }

    /// Inserts or replaces a value.
    ///
    /// Returns `(replaced, evicted)`. Replacing keeps the key's position and
    /// never evicts. A new key that pushes the map over capacity evicts exactly
    /// the oldest inserted entry.
    pub fn insert_full(&mut self, key: K, value: V) -> (Option<V>, Option<(K, V)>) {
        if let Some(existing) = self.map.get_mut(&key) {
            return (Some(mem::replace(existing, value)), None);
        }

        self.map.insert(key.clone(), value);
        self.order.push_back(key);

        let evicted = if self.map.len() > self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        (None, evicted)
    }

    // == Evict Oldest ==
    fn evict_oldest(&mut self) -> Option<(K, V)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(value) = self.map.remove(&key) {
                return Some((key, value));
            }
        }
        None
    }

    // == Remove ==
    /// Removes a key, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = self.map.remove(key)?;
        self.order.retain(|k| <K as Borrow<Q>>::borrow(k) != key);
        Some(value)
    }

    // == Clear ==
    /// Removes every entry.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    // == Length ==
    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    // == Is Empty ==
    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    // == Iteration ==
    /// Keys, oldest insertion first.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.order.iter()
    }

    /// Values, oldest insertion first.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.entries().map(|(_, value)| value)
    }

    /// Key-value pairs, oldest insertion first.
    pub fn entries(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.map.get(key).map(|value| (key, value)))
    }
}
