//! Priority queue of batches awaiting consensus
//!
//! Selection order is `(timestamp, id)`. The heap holds keys only; removals
//! and timestamp changes leave stale keys behind that are skipped when they
//! surface and swept by [`PendingQueue::compact`].

use crate::batch::{Batch, BatchId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Result of offering a batch to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New entry
    Added,
    /// Merged into an entry with the same id
    Merged,
    /// Queue at capacity; batch not stored
    Full,
}

/// Bounded set of pending batches with ordered selection
#[derive(Debug)]
pub struct PendingQueue<C> {
    heap: BinaryHeap<Reverse<(u64, BatchId)>>,
    entries: HashMap<BatchId, Batch<C>>,
    capacity: usize,
}

impl<C: Clone> PendingQueue<C> {
    /// Empty queue holding at most `capacity` batches
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Add a batch, merging with an entry of the same id
    pub fn insert(&mut self, batch: Batch<C>) -> Admission {
        let id = batch.id();
        if let Some(existing) = self.entries.get(&id) {
            let Some(merged) = existing.merge_with(&batch) else {
                return Admission::Merged;
            };
            if merged.timestamp() != existing.timestamp() {
                self.heap.push(Reverse(merged.order_key()));
            }
            self.entries.insert(id, merged);
            return Admission::Merged;
        }
        if self.entries.len() >= self.capacity {
            return Admission::Full;
        }
        self.heap.push(Reverse(batch.order_key()));
        self.entries.insert(id, batch);
        Admission::Added
    }

    /// Earliest batch by `(timestamp, id)`
    pub fn peek_min(&mut self) -> Option<&Batch<C>> {
        loop {
            let Reverse((timestamp, id)) = *self.heap.peek()?;
            match self.entries.get(&id) {
                Some(batch) if batch.timestamp() == timestamp => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
        let Reverse((_, id)) = self.heap.peek()?;
        self.entries.get(id)
    }

    /// Remove a batch
    pub fn remove(&mut self, id: &BatchId) -> Option<Batch<C>> {
        self.entries.remove(id)
    }

    /// Stored batch with this id
    pub fn get(&self, id: &BatchId) -> Option<&Batch<C>> {
        self.entries.get(id)
    }

    /// Whether a batch with this id is queued
    pub fn contains(&self, id: &BatchId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of queued batches
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only the batches for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&Batch<C>) -> bool) {
        self.entries.retain(|_, batch| keep(batch));
    }

    /// Queued batches in selection order
    pub fn to_sorted_vec(&self) -> Vec<Batch<C>> {
        let mut batches: Vec<Batch<C>> = self.entries.values().cloned().collect();
        batches.sort();
        batches
    }

    /// Rebuild the heap when stale keys dominate it
    pub fn compact(&mut self) {
        if self.heap.len() <= self.entries.len() * 2 + 16 {
            return;
        }
        self.heap = self
            .entries
            .values()
            .map(|batch| Reverse(batch.order_key()))
            .collect();
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
