//! Snapshot collection for lagging nodes
//!
//! A syncing node gathers checkpoints until it holds one from a quorum of
//! members (its own included), then adopts the one with the highest phase.
//! Every checkpoint describes a prefix of the same decided log, so the
//! furthest one is a valid state for all of them.

use crate::batch::{Batch, BatchId};
use crate::storage::SavedState;
use crate::types::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Checkpoints received during one sync attempt
#[derive(Debug)]
pub(crate) struct SyncCollector<C> {
    responses: BTreeMap<NodeId, SavedState<C>>,
    pub started: Instant,
    pub last_request: Instant,
}

/// Result of merging a quorum of checkpoints
#[derive(Debug)]
pub(crate) struct SyncOutcome<C> {
    /// Checkpoint with the highest phase
    pub best: SavedState<C>,
    /// Responder that supplied `best`
    pub source: NodeId,
    /// Pending batches from every response, not yet committed anywhere
    pub pending: Vec<Batch<C>>,
    /// Union of committed history, newest timestamp per id
    pub committed: Vec<(BatchId, u64)>,
}

impl<C: Clone> SyncCollector<C> {
    pub fn new(self_id: NodeId, own: SavedState<C>, now: Instant) -> Self {
        let mut responses = BTreeMap::new();
        responses.insert(self_id, own);
        Self {
            responses,
            started: now,
            last_request: now,
        }
    }

    /// Store a response; a later response from the same node replaces it
    pub fn record(&mut self, sender: NodeId, state: SavedState<C>) -> usize {
        self.responses.insert(sender, state);
        self.responses.len()
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Merge the collected checkpoints
    pub fn finish(self) -> Option<SyncOutcome<C>> {
        let mut committed: HashMap<BatchId, u64> = HashMap::new();
        for state in self.responses.values() {
            for (id, ts) in &state.committed {
                let slot = committed.entry(*id).or_insert(*ts);
                *slot = (*slot).max(*ts);
            }
        }

        let mut pending: HashMap<BatchId, Batch<C>> = HashMap::new();
        for state in self.responses.values() {
            for batch in &state.pending {
                if committed
                    .get(&batch.id())
                    .map_or(false, |ts| *ts >= batch.timestamp())
                {
                    continue;
                }
                let merged = match pending.get(&batch.id()) {
                    Some(existing) => existing.merge_with(batch),
                    None => Some(batch.clone()),
                };
                if let Some(merged) = merged {
                    pending.insert(batch.id(), merged);
                }
            }
        }

        // Ties on phase go to the lowest node id so every node picks alike
        let (source, best) = self
            .responses
            .into_iter()
            .fold(None, |acc: Option<(NodeId, SavedState<C>)>, (id, state)| match acc {
                Some((best_id, best)) if best.last_phase >= state.last_phase => {
                    Some((best_id, best))
                }
                _ => Some((id, state)),
            })?;

        let mut committed: Vec<(BatchId, u64)> = committed.into_iter().collect();
        committed.sort_by_key(|(id, ts)| (*ts, *id));
        let mut pending: Vec<Batch<C>> = pending.into_values().collect();
        pending.sort();

        Some(SyncOutcome {
            best,
            source,
            pending,
            committed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    fn state(phase: u64, pending: Vec<Batch<String>>, committed: Vec<(BatchId, u64)>) -> SavedState<String> {
        SavedState {
            state: vec![phase as u8],
            last_phase: Phase::new(phase),
            pending,
            committed,
            open_phase: None,
        }
    }

    #[test]
    fn test_adopts_highest_phase_and_filters_committed() {
        let done = Batch::new(vec!["done".to_string()], 3).unwrap();
        let open = Batch::new(vec!["open".to_string()], 4).unwrap();
        let now = Instant::now();

        let mut collector = SyncCollector::new(
            NodeId::new(1),
            state(2, vec![done.clone(), open.clone()], vec![]),
            now,
        );
        collector.record(NodeId::new(2), state(7, vec![], vec![(done.id(), 3)]));
        collector.record(NodeId::new(3), state(5, vec![open.clone()], vec![]));
        assert_eq!(collector.len(), 3);

        let outcome = collector.finish().unwrap();
        assert_eq!(outcome.source, NodeId::new(2));
        assert_eq!(outcome.best.last_phase, Phase::new(7));
        assert_eq!(outcome.pending.len(), 1);
        assert_eq!(outcome.pending[0].id(), open.id());
        assert_eq!(outcome.pending[0].correlation_ids().len(), 1);
        assert_eq!(outcome.committed, vec![(done.id(), 3)]);
    }

    #[test]
    fn test_resubmission_newer_than_history_survives() {
        let old = Batch::new(vec!["same".to_string()], 3).unwrap();
        let again = Batch::new(vec!["same".to_string()], 9).unwrap();
        let mut collector = SyncCollector::new(NodeId::new(1), state(1, vec![again], vec![]), Instant::now());
        collector.record(NodeId::new(2), state(1, vec![], vec![(old.id(), 3)]));

        let outcome = collector.finish().unwrap();
        assert_eq!(outcome.source, NodeId::new(1));
        assert_eq!(outcome.pending.len(), 1);
        assert_eq!(outcome.pending[0].timestamp(), 9);
    }
}
