//! Per-phase bookkeeping
//!
//! Tallies are updated incrementally as votes arrive: each tally keeps the
//! set of senders it has counted plus per-value counters, so checking a
//! threshold is O(1) and a duplicated message is a no-op.

use crate::batch::{Batch, BatchId};
use crate::messages::StateValue;
use crate::storage::{CastVote, OpenPhase};
use crate::types::{NodeId, Phase};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Progress of one phase on the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseStage {
    /// Gathering proposals
    Collecting,
    /// First-round votes of the current iteration are being collected
    Round1,
    /// Second-round votes of the current iteration are being collected
    Round2,
    /// Outcome known, not yet applied
    Decided,
    /// Outcome applied to the state machine
    Applied,
}

/// Counts of one round's votes within one iteration
#[derive(Debug, Clone)]
pub struct VoteTally<C> {
    voters: HashMap<NodeId, StateValue>,
    counts: [usize; 3],
    batch: Option<Batch<C>>,
}

impl<C> VoteTally<C> {
    /// Empty tally
    pub fn new() -> Self {
        Self {
            voters: HashMap::new(),
            counts: [0; 3],
            batch: None,
        }
    }

    /// Count a vote; returns false if the sender already voted
    ///
    /// The first batch attached to a V1 vote is kept as the round's
    /// candidate.
    pub fn record(&mut self, sender: NodeId, value: StateValue, batch: Option<Batch<C>>) -> bool {
        if self.voters.contains_key(&sender) {
            return false;
        }
        self.voters.insert(sender, value);
        self.counts[value.index()] += 1;
        if value == StateValue::V1 && self.batch.is_none() {
            self.batch = batch;
        }
        true
    }

    /// Votes counted
    pub fn total(&self) -> usize {
        self.voters.len()
    }

    /// Votes counted for `value`
    pub fn count(&self, value: StateValue) -> usize {
        self.counts[value.index()]
    }

    /// Whether `sender` has voted
    pub fn has_voted(&self, sender: NodeId) -> bool {
        self.voters.contains_key(&sender)
    }

    /// Batch carried by the V1 votes
    pub fn batch(&self) -> Option<&Batch<C>> {
        self.batch.as_ref()
    }
}

impl<C> Default for VoteTally<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Proposals received for one phase
#[derive(Debug, Clone)]
pub struct ProposalTally<C> {
    by_sender: HashMap<NodeId, BatchId>,
    counts: HashMap<BatchId, usize>,
    batches: HashMap<BatchId, Batch<C>>,
    leading: Option<(BatchId, usize)>,
}

impl<C> ProposalTally<C> {
    /// Empty tally
    pub fn new() -> Self {
        Self {
            by_sender: HashMap::new(),
            counts: HashMap::new(),
            batches: HashMap::new(),
            leading: None,
        }
    }

    /// Count a proposal; a sender's first proposal is the only one counted
    pub fn record(&mut self, sender: NodeId, batch: Batch<C>) -> bool {
        if self.by_sender.contains_key(&sender) {
            return false;
        }
        let id = batch.id();
        self.by_sender.insert(sender, id);
        let count = self.counts.entry(id).or_insert(0);
        *count += 1;
        let count = *count;
        self.batches.entry(id).or_insert(batch);
        if self.leading.map_or(true, |(_, best)| count > best) {
            self.leading = Some((id, count));
        }
        true
    }

    /// Proposals counted
    pub fn total(&self) -> usize {
        self.by_sender.len()
    }

    /// Proposals counted for one batch
    pub fn count(&self, id: &BatchId) -> usize {
        self.counts.get(id).copied().unwrap_or(0)
    }

    /// Batch proposed by at least `threshold` senders
    pub fn majority(&self, threshold: usize) -> Option<&Batch<C>> {
        let (id, count) = self.leading?;
        if count >= threshold {
            self.batches.get(&id)
        } else {
            None
        }
    }
}

impl<C> Default for ProposalTally<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Voting round within an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Round {
    /// Votes on the proposals
    One,
    /// Votes on the round-1 outcome
    Two,
}

/// Everything the node tracks about one phase
#[derive(Debug)]
pub(crate) struct PhaseData<C> {
    pub stage: PhaseStage,
    pub iteration: u32,
    pub proposals: ProposalTally<C>,
    pub round1: BTreeMap<u32, VoteTally<C>>,
    pub round2: BTreeMap<u32, VoteTally<C>>,
    /// The batch any V1 vote of this phase refers to
    pub candidate: Option<Batch<C>>,
    pub own_proposal: Option<Batch<C>>,
    pub own_votes: BTreeMap<(u32, Round), (StateValue, Option<Batch<C>>)>,
    pub decision: Option<(StateValue, Batch<C>)>,
    pub last_progress: Instant,
    pub retransmit_after: Duration,
    pub stalled: bool,
}

impl<C: Clone> PhaseData<C> {
    pub fn new(now: Instant, retransmit_after: Duration) -> Self {
        Self {
            stage: PhaseStage::Collecting,
            iteration: 0,
            proposals: ProposalTally::new(),
            round1: BTreeMap::new(),
            round2: BTreeMap::new(),
            candidate: None,
            own_proposal: None,
            own_votes: BTreeMap::new(),
            decision: None,
            last_progress: now,
            retransmit_after,
            stalled: false,
        }
    }

    /// Rebuild the local side of a phase from a checkpoint
    ///
    /// Own proposal and votes are counted again exactly as cast, and the
    /// stage is the one the last own vote left the phase in.
    pub fn resume(
        open: OpenPhase<C>,
        node_id: NodeId,
        now: Instant,
        retransmit_after: Duration,
    ) -> Self {
        let mut data = Self::new(now, retransmit_after);
        data.iteration = open.iteration;
        data.proposals.record(node_id, open.proposal.clone());
        data.own_proposal = Some(open.proposal);
        for vote in open.votes {
            data.learn_candidate(vote.batch.as_ref());
            data.tally_mut(vote.round, vote.iteration)
                .record(node_id, vote.value, vote.batch.clone());
            data.own_votes
                .insert((vote.iteration, vote.round), (vote.value, vote.batch));
        }
        data.stage = if data.own_votes.contains_key(&(data.iteration, Round::Two)) {
            PhaseStage::Round2
        } else if data.own_votes.contains_key(&(data.iteration, Round::One)) {
            PhaseStage::Round1
        } else {
            PhaseStage::Collecting
        };
        data
    }

    /// Own proposal and votes, if this node has proposed in the phase
    pub fn open_phase(&self, phase: Phase) -> Option<OpenPhase<C>> {
        let proposal = self.own_proposal.clone()?;
        let votes = self
            .own_votes
            .iter()
            .map(|((iteration, round), (value, batch))| CastVote {
                iteration: *iteration,
                round: *round,
                value: *value,
                batch: batch.clone(),
            })
            .collect();
        Some(OpenPhase {
            phase,
            iteration: self.iteration,
            proposal,
            votes,
        })
    }

    /// Whether this node has taken part in the phase
    pub fn is_open(&self) -> bool {
        self.own_proposal.is_some()
    }

    /// Whether a peer has sent anything for the phase
    pub fn peer_activity(&self) -> bool {
        self.proposals.total() > 0 || !self.round1.is_empty() || !self.round2.is_empty()
    }

    pub fn tally_mut(&mut self, round: Round, iteration: u32) -> &mut VoteTally<C> {
        match round {
            Round::One => self.round1.entry(iteration).or_default(),
            Round::Two => self.round2.entry(iteration).or_default(),
        }
    }

    pub fn tally(&self, round: Round, iteration: u32) -> Option<&VoteTally<C>> {
        match round {
            Round::One => self.round1.get(&iteration),
            Round::Two => self.round2.get(&iteration),
        }
    }

    pub fn learn_candidate(&mut self, batch: Option<&Batch<C>>) {
        if self.candidate.is_none() {
            if let Some(batch) = batch {
                if !batch.is_empty_sentinel() {
                    self.candidate = Some(batch.clone());
                }
            }
        }
    }

    /// Drop tallies and own votes of iterations before `iteration - 1`
    pub fn prune_iterations(&mut self) {
        let keep_from = self.iteration.saturating_sub(1);
        self.round1 = self.round1.split_off(&keep_from);
        self.round2 = self.round2.split_off(&keep_from);
        self.own_votes = self.own_votes.split_off(&(keep_from, Round::One));
    }

    pub fn touch(&mut self, now: Instant, initial_retransmit: Duration) {
        self.last_progress = now;
        self.retransmit_after = initial_retransmit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64) -> NodeId {
        NodeId::new(id)
    }

    fn batch(name: &str) -> Batch<String> {
        Batch::new(vec![name.to_string()], 1).unwrap()
    }

    #[test]
    fn test_vote_tally_counts_each_sender_once() {
        let mut tally = VoteTally::new();
        assert!(tally.record(node(1), StateValue::V1, Some(batch("a"))));
        assert!(!tally.record(node(1), StateValue::V0, None));
        assert!(tally.record(node(2), StateValue::VQuestion, None));
        assert!(tally.record(node(3), StateValue::V1, Some(batch("a"))));

        assert_eq!(tally.total(), 3);
        assert_eq!(tally.count(StateValue::V1), 2);
        assert_eq!(tally.count(StateValue::V0), 0);
        assert_eq!(tally.count(StateValue::VQuestion), 1);
        assert_eq!(tally.batch().map(Batch::id), Some(batch("a").id()));
        assert!(tally.has_voted(node(2)));
    }

    #[test]
    fn test_proposal_majority() {
        let mut tally = ProposalTally::new();
        tally.record(node(1), batch("a"));
        tally.record(node(2), batch("b"));
        assert!(tally.majority(2).is_none());

        tally.record(node(3), batch("a"));
        assert!(!tally.record(node(3), batch("b")));
        assert_eq!(tally.majority(2).map(Batch::id), Some(batch("a").id()));
        assert_eq!(tally.count(&batch("b").id()), 1);
        assert_eq!(tally.total(), 3);
    }

    #[test]
    fn test_prune_keeps_previous_iteration() {
        let now = Instant::now();
        let mut data: PhaseData<String> = PhaseData::new(now, Duration::from_millis(10));
        for iteration in 0..4 {
            data.tally_mut(Round::One, iteration)
                .record(node(1), StateValue::V0, None);
            data.own_votes
                .insert((iteration, Round::Two), (StateValue::V0, None));
        }
        data.iteration = 3;
        data.prune_iterations();
        assert_eq!(data.round1.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(data.own_votes.len(), 2);
    }

    #[test]
    fn test_resume_restores_own_votes_and_stage() {
        let now = Instant::now();
        let mut data: PhaseData<String> = PhaseData::new(now, Duration::from_millis(10));
        data.own_proposal = Some(batch("a"));
        data.proposals.record(node(1), batch("a"));
        data.iteration = 1;
        data.own_votes
            .insert((0, Round::One), (StateValue::V1, Some(batch("a"))));
        data.own_votes.insert((0, Round::Two), (StateValue::VQuestion, None));
        data.own_votes
            .insert((1, Round::One), (StateValue::V1, Some(batch("a"))));

        let open = data.open_phase(Phase::new(4)).unwrap();
        assert_eq!(open.phase, Phase::new(4));
        assert_eq!(open.votes.len(), 3);

        let resumed = PhaseData::resume(open, node(1), now, Duration::from_millis(10));
        assert_eq!(resumed.stage, PhaseStage::Round1);
        assert_eq!(resumed.iteration, 1);
        assert!(resumed.is_open());
        assert_eq!(resumed.proposals.total(), 1);
        assert!(resumed.tally(Round::One, 1).unwrap().has_voted(node(1)));
        assert_eq!(
            resumed.tally(Round::Two, 0).unwrap().count(StateValue::VQuestion),
            1
        );
        assert_eq!(resumed.candidate.map(|b| b.id()), Some(batch("a").id()));

        let idle: PhaseData<String> = PhaseData::new(now, Duration::from_millis(10));
        assert!(idle.open_phase(Phase::new(4)).is_none());
    }

    #[test]
    fn test_candidate_ignores_empty_sentinel() {
        let mut data: PhaseData<String> = PhaseData::new(Instant::now(), Duration::from_millis(10));
        data.learn_candidate(Some(&Batch::empty()));
        assert!(data.candidate.is_none());
        data.learn_candidate(Some(&batch("x")));
        data.learn_candidate(Some(&batch("y")));
        assert_eq!(data.candidate.map(|b| b.id()), Some(batch("x").id()));
    }
}
