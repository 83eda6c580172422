//! Content-addressed command batches
//!
//! A batch groups the commands of one client proposal. Its [`BatchId`] is a
//! SHA-256 digest of the canonical (bincode) encoding of the command
//! sequence, so two proposers submitting identical commands concurrently
//! produce batches that consensus treats as one. [`Batch::merge_with`] folds
//! such twins together so every proposer is notified on commit.

use crate::error::{RabiaError, Result};
use crate::types::{CorrelationId, LogicalClock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of a batch: content hash, or the reserved empty sentinel
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId([u8; 32]);

impl BatchId {
    /// Reserved id of the protocol's no-op batch
    pub const EMPTY: BatchId = BatchId([0u8; 32]);

    /// Content hash of a command sequence
    pub fn for_commands<C: Serialize>(commands: &[C]) -> Result<Self> {
        let encoded = bincode::serialize(commands)
            .map_err(|e| RabiaError::serialization_error("batch commands", e))?;
        let digest = Sha256::digest(&encoded);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Ok(BatchId(id))
    }

    /// Whether this is the empty-batch sentinel
    pub fn is_empty_sentinel(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty_sentinel() {
            return write!(f, "batch-empty");
        }
        write!(f, "batch-")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Immutable group of commands proposed together
///
/// Equality and hashing consider only the id. Ordering between batches is
/// `(timestamp, id)`, which is the order in which pending batches enter
/// consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch<C> {
    id: BatchId,
    correlation_ids: BTreeSet<CorrelationId>,
    timestamp: u64,
    commands: Vec<C>,
}

impl<C: Serialize> Batch<C> {
    /// New batch with a fresh correlation id
    pub fn new(commands: Vec<C>, timestamp: u64) -> Result<Self> {
        Self::with_correlation(commands, CorrelationId::new(), timestamp)
    }

    /// New batch bound to a caller-chosen correlation id
    pub fn with_correlation(
        commands: Vec<C>,
        correlation_id: CorrelationId,
        timestamp: u64,
    ) -> Result<Self> {
        let id = BatchId::for_commands(&commands)?;
        Ok(Self {
            id,
            correlation_ids: BTreeSet::from([correlation_id]),
            timestamp,
            commands,
        })
    }
}

impl<C> Batch<C> {
    /// The protocol's no-op proposal
    pub fn empty() -> Self {
        Self {
            id: BatchId::EMPTY,
            correlation_ids: BTreeSet::new(),
            timestamp: 0,
            commands: Vec::new(),
        }
    }

    /// Batch identifier
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Proposers waiting on this batch
    pub fn correlation_ids(&self) -> &BTreeSet<CorrelationId> {
        &self.correlation_ids
    }

    /// Logical submission time
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Commands in submission order
    pub fn commands(&self) -> &[C] {
        &self.commands
    }

    /// Whether this is the empty-batch sentinel
    pub fn is_empty_sentinel(&self) -> bool {
        self.id.is_empty_sentinel()
    }

    /// Scheduling key: `(timestamp, id)`
    pub fn order_key(&self) -> (u64, BatchId) {
        (self.timestamp, self.id)
    }
}

impl<C: Clone> Batch<C> {
    /// Combine two batches with the same id
    ///
    /// The result carries the union of correlation ids and the earlier
    /// timestamp. Returns `None` when the ids differ.
    pub fn merge_with(&self, other: &Batch<C>) -> Option<Batch<C>> {
        if self.id != other.id {
            return None;
        }
        let mut correlation_ids = self.correlation_ids.clone();
        correlation_ids.extend(other.correlation_ids.iter().copied());
        Some(Batch {
            id: self.id,
            correlation_ids,
            timestamp: self.timestamp.min(other.timestamp),
            commands: self.commands.clone(),
        })
    }
}

impl<C> PartialEq for Batch<C> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<C> Eq for Batch<C> {}

impl<C> Hash for Batch<C> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<C> PartialOrd for Batch<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Batch<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Form a batch stamped with the next local logical time
pub fn batch<C: Serialize>(commands: Vec<C>, clock: &mut LogicalClock) -> Result<Batch<C>> {
    Batch::new(commands, clock.tick())
}

/// The protocol's no-op proposal
pub fn empty_batch<C>() -> Batch<C> {
    Batch::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmds(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identical_commands_share_id() {
        let mut clock = LogicalClock::new();
        let a = batch(cmds(&["set x 1", "set y 2"]), &mut clock).unwrap();
        let b = batch(cmds(&["set x 1", "set y 2"]), &mut clock).unwrap();

        assert_eq!(a.id(), b.id());
        assert_eq!(a, b);
        assert_ne!(a.correlation_ids(), b.correlation_ids());
        assert!(a.timestamp() < b.timestamp());
    }

    #[test]
    fn test_command_order_matters() {
        let a = Batch::new(cmds(&["a", "b"]), 1).unwrap();
        let b = Batch::new(cmds(&["b", "a"]), 1).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_merge_unions_correlations_and_keeps_earlier_timestamp() {
        let late = Batch::new(cmds(&["same"]), 9).unwrap();
        let early = Batch::new(cmds(&["same"]), 4).unwrap();

        let merged = late.merge_with(&early).unwrap();
        assert_eq!(merged.timestamp(), 4);
        assert_eq!(merged.correlation_ids().len(), 2);
        assert!(merged
            .correlation_ids()
            .is_superset(late.correlation_ids()));
        assert!(merged
            .correlation_ids()
            .is_superset(early.correlation_ids()));

        let other = Batch::new(cmds(&["different"]), 1).unwrap();
        assert!(late.merge_with(&other).is_none());
    }

    #[test]
    fn test_empty_commands_are_not_the_sentinel() {
        let empty_commands: Batch<String> = Batch::new(Vec::new(), 1).unwrap();
        let sentinel: Batch<String> = empty_batch();

        assert!(!empty_commands.is_empty_sentinel());
        assert!(sentinel.is_empty_sentinel());
        assert_ne!(empty_commands.id(), sentinel.id());
        assert_eq!(sentinel.id().to_string(), "batch-empty");
    }

    #[test]
    fn test_ordering_by_timestamp_then_id() {
        let first = Batch::new(cmds(&["z"]), 1).unwrap();
        let second = Batch::new(cmds(&["a"]), 2).unwrap();
        assert!(first < second);

        let x = Batch::new(cmds(&["x"]), 5).unwrap();
        let y = Batch::new(cmds(&["y"]), 5).unwrap();
        assert_eq!(x.cmp(&y), x.id().cmp(&y.id()));
    }
}
