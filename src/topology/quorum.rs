//! Quorum and fault-tolerance arithmetic
//!
//! All thresholds are derived from the cluster size and never stored
//! separately, so they cannot drift from the membership they describe.

use serde::{Deserialize, Serialize};

/// Thresholds for a crash-fault-tolerant cluster of `n` nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quorum {
    cluster_size: usize,
}

impl Quorum {
    /// Thresholds for a cluster of `cluster_size` nodes
    #[must_use]
    pub const fn new(cluster_size: usize) -> Self {
        Self { cluster_size }
    }

    /// Number of nodes in the cluster
    #[must_use]
    pub const fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Majority of the cluster: `n / 2 + 1`
    #[must_use]
    pub const fn quorum_size(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    /// Crash faults the cluster tolerates: `(n - 1) / 2`
    #[must_use]
    pub const fn max_failures(&self) -> usize {
        self.cluster_size.saturating_sub(1) / 2
    }

    /// Smallest vote count every quorum is guaranteed to observe: `n - quorum + 1`
    #[must_use]
    pub const fn f_plus_one(&self) -> usize {
        (self.cluster_size + 1).saturating_sub(self.quorum_size())
    }

    /// Agreement needed for the round-one fast path: `n - max_failures`
    #[must_use]
    pub const fn super_majority_size(&self) -> usize {
        self.cluster_size - self.max_failures()
    }

    /// Whether `count` nodes form a quorum
    #[must_use]
    pub const fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn thresholds(n: usize) -> (usize, usize, usize, usize) {
        let q = Quorum::new(n);
        (q.quorum_size(), q.max_failures(), q.f_plus_one(), q.super_majority_size())
    }

    #[test]
    fn test_hand_computed_thresholds() {
        assert_eq!(thresholds(1), (1, 0, 1, 1));
        assert_eq!(thresholds(3), (2, 1, 2, 2));
        assert_eq!(thresholds(4), (3, 1, 2, 3));
        assert_eq!(thresholds(5), (3, 2, 3, 3));
        assert_eq!(thresholds(7), (4, 3, 4, 4));
    }

    #[test]
    fn test_is_quorum() {
        let q = Quorum::new(5);
        assert!(!q.is_quorum(2));
        assert!(q.is_quorum(3));
        assert!(q.is_quorum(5));
    }
}
