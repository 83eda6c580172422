//! Size-capped map with least-recently-used eviction
//!
//! Every piece of per-phase and per-batch bookkeeping in the engine lives in
//! a [`BoundedMap`], so sustained load cannot grow memory without limit:
//! inserting past capacity evicts the entry that was touched longest ago.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Map holding at most `capacity` entries
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    /// Create a map; a zero capacity is treated as one
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace a value, marking it most recently used
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let stamp = self.next_stamp();
        if let Some((slot, old_stamp)) = self.entries.get_mut(&key) {
            *slot = value;
            let previous = std::mem::replace(old_stamp, stamp);
            self.recency.remove(&previous);
            self.recency.insert(stamp, key);
            return None;
        }

        self.entries.insert(key.clone(), (value, stamp));
        self.recency.insert(stamp, key);

        if self.entries.len() > self.capacity {
            self.evict_oldest()
        } else {
            None
        }
    }

    /// Read a value without changing its recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Mutable access, marking the entry most recently used
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let stamp = self.next_stamp();
        let owned_key = self.entries.get_key_value(key).map(|(k, _)| k.clone())?;
        let (value, old_stamp) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(old_stamp, stamp);
        self.recency.remove(&previous);
        self.recency.insert(stamp, owned_key);
        Some(value)
    }

    /// Whether the key is present
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Remove an entry
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (value, stamp) = self.entries.remove(key)?;
        self.recency.remove(&stamp);
        Some(value)
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let doomed: Vec<(K, u64)> = self
            .entries
            .iter()
            .filter(|(k, (v, _))| !keep(k, v))
            .map(|(k, (_, stamp))| (k.clone(), *stamp))
            .collect();
        for (key, stamp) in &doomed {
            self.entries.remove(key);
            self.recency.remove(stamp);
        }
        doomed.len()
    }

    /// Iterate over entries in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, (v, _))| (k, v))
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.recency.pop_first()?;
        let (value, _) = self.entries.remove(&key)?;
        Some((key, value))
    }
}
