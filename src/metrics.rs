//! Engine counters
//!
//! Lock-free counters updated from the engine's hot path and read through a
//! point-in-time [`MetricsSnapshot`]. Counters are monotonic; rates are left
//! to whoever scrapes them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one engine instance
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Batches submitted by local clients
    pub proposals_submitted: AtomicU64,
    /// Proposals refused because the pending queue was full
    pub proposals_rejected: AtomicU64,
    /// Batches learned from peers
    pub batches_learned: AtomicU64,
    /// Phases decided by the round-1 fast path
    pub fast_path_decisions: AtomicU64,
    /// Phases decided in round 2
    pub slow_path_decisions: AtomicU64,
    /// Phases adopted from a peer's decision
    pub adopted_decisions: AtomicU64,
    /// Decided phases that committed nothing
    pub empty_phases: AtomicU64,
    /// Batches applied to the state machine
    pub batches_applied: AtomicU64,
    /// Decided batches skipped as already committed
    pub duplicate_commits_skipped: AtomicU64,
    /// Coin-driven iterations started
    pub iterations: AtomicU64,
    /// Phases that crossed the stalled-phase threshold
    pub stalled_phases: AtomicU64,
    /// Retransmission rounds
    pub retransmissions: AtomicU64,
    /// Sync attempts started
    pub syncs_started: AtomicU64,
    /// Sync attempts completed
    pub syncs_completed: AtomicU64,
    /// Inbound messages dropped
    pub messages_dropped: AtomicU64,
    /// Failed checkpoint writes
    pub persistence_failures: AtomicU64,
}

/// Copy of the counters at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub proposals_submitted: u64,
    pub proposals_rejected: u64,
    pub batches_learned: u64,
    pub fast_path_decisions: u64,
    pub slow_path_decisions: u64,
    pub adopted_decisions: u64,
    pub empty_phases: u64,
    pub batches_applied: u64,
    pub duplicate_commits_skipped: u64,
    pub iterations: u64,
    pub stalled_phases: u64,
    pub retransmissions: u64,
    pub syncs_started: u64,
    pub syncs_completed: u64,
    pub messages_dropped: u64,
    pub persistence_failures: u64,
}

impl EngineMetrics {
    /// Add one to a counter
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            proposals_submitted: read(&self.proposals_submitted),
            proposals_rejected: read(&self.proposals_rejected),
            batches_learned: read(&self.batches_learned),
            fast_path_decisions: read(&self.fast_path_decisions),
            slow_path_decisions: read(&self.slow_path_decisions),
            adopted_decisions: read(&self.adopted_decisions),
            empty_phases: read(&self.empty_phases),
            batches_applied: read(&self.batches_applied),
            duplicate_commits_skipped: read(&self.duplicate_commits_skipped),
            iterations: read(&self.iterations),
            stalled_phases: read(&self.stalled_phases),
            retransmissions: read(&self.retransmissions),
            syncs_started: read(&self.syncs_started),
            syncs_completed: read(&self.syncs_completed),
            messages_dropped: read(&self.messages_dropped),
            persistence_failures: read(&self.persistence_failures),
        }
    }
}

impl MetricsSnapshot {
    /// Phases decided locally or adopted
    pub fn phases_decided(&self) -> u64 {
        self.fast_path_decisions + self.slow_path_decisions + self.adopted_decisions
    }
}
