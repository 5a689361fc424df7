//! Bounded maps backing the matching tables.
//!
//! Two eviction policies share one shape: the MID/token tables expire
//! entries after EXCHANGE_LIFETIME, the block and observe tables hold a
//! fixed number of entries and drop the least-frequently-used one when a
//! new key arrives at capacity.

use std::{
    hash::Hash,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};

/// Map whose entries expire a fixed time after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, (V, Instant)>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Insert, refreshing the deadline for an existing key. At capacity
    /// the entry closest to expiry is dropped first.
    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.entries.retain(|_, (_, deadline)| *deadline > now);

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, deadline))| *deadline)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(key, (value, now + self.ttl));
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if let Some((_, deadline)) = self.entries.get(key) {
            if *deadline <= Instant::now() {
                self.entries.remove(key);
                return None;
            }
        }

        self.entries.get(key).map(|(value, _)| value)
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(value, _)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Map that evicts the least-frequently-used entry at capacity.
pub struct LfuCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
}

impl<K, V> LfuCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(coldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, uses))| *uses)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&coldest);
            }
        }

        self.entries.insert(key, (value, 0));
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get_mut(key).map(|(value, uses)| {
            *uses += 1;
            &*value
        })
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(value, uses)| {
            *uses += 1;
            value
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(value, _)| value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, (v, _))| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.entries.iter_mut().map(|(k, (v, _))| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
