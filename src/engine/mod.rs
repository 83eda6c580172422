//! Randomized binary consensus over a replicated log
//!
//! [`RabiaEngine`] decides one batch per phase. It performs no I/O of its
//! own: inbound messages arrive through [`RabiaEngine::handle_message`],
//! time advances through [`RabiaEngine::on_tick`], and outbound traffic goes
//! to the injected [`ClusterNetwork`]. The same engine therefore runs under
//! the tokio node runtime and under the deterministic simulator.
//!
//! # Phase protocol
//!
//! ```text
//! COLLECTING ──quorum proposals──▶ ROUND1 ──quorum R1──▶ ROUND2 ──quorum R2──▶ DECIDED ──▶ APPLIED
//!                                    │  ▲                  │
//!                                    │  └── next iteration ┘ (no f+1 agreement, carry or coin)
//!                                    └── n-f V1 votes: fast path ──────────────▶ DECIDED
//! ```
//!
//! Each node proposes its earliest pending batch. A node votes V1 in round 1
//! when a quorum proposed the same non-empty batch, V0 otherwise. Round-2
//! votes repeat a value only when a quorum voted it in round 1. A value with
//! f+1 round-2 votes is decided. Otherwise the next iteration starts from any
//! value seen in round 2, then from V1 if any round-1 vote was V1, and only
//! then from a common coin derived from the phase and iteration.
//!
//! The round-1 fast path only ever decides V1: a quorum of V1 votes means no
//! round-2 vote of that iteration can be V0, and every node that completes
//! the iteration has seen at least one V1 round-1 vote, so all of them carry
//! V1 forward.

pub mod pending;
pub mod phase;
mod sync;

use crate::batch::{Batch, BatchId};
use crate::bounded::BoundedMap;
use crate::config::ProtocolConfig;
use crate::error::{RabiaError, Result};
use crate::messages::{ProtocolMessage, StateValue};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::state_machine::StateMachine;
use crate::storage::{PersistenceStore, SavedState};
use crate::topology::quorum::Quorum;
use crate::transport::ClusterNetwork;
use crate::types::{CorrelationId, LogicalClock, NodeId, Phase};
use pending::{Admission, PendingQueue};
use phase::{PhaseData, PhaseStage, Round};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync::{SyncCollector, SyncOutcome};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Channel that receives the responses of a committed proposal
pub type Responder<R> = oneshot::Sender<Result<Vec<R>>>;

/// Operating mode of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    /// Proposing and voting
    Active,
    /// Quorum lost; state persisted, no protocol traffic sent
    Suspended,
    /// Collecting peer checkpoints before rejoining
    Syncing,
}

/// Point-in-time view of an engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Local node
    pub node_id: NodeId,
    /// Operating mode
    pub mode: EngineMode,
    /// Phase being decided
    pub phase: Phase,
    /// Stage of that phase, if the node tracks it
    pub stage: Option<PhaseStage>,
    /// Iteration of that phase
    pub iteration: u32,
    /// Batches awaiting consensus
    pub pending: usize,
    /// Members counted for quorum
    pub cluster_size: usize,
    /// Votes needed per round
    pub quorum_size: usize,
    /// Phases with retained bookkeeping
    pub tracked_phases: usize,
    /// Counters
    pub metrics: MetricsSnapshot,
}

enum Step {
    Idle,
    Progress,
    Apply,
}

/// Consensus engine for one node
pub struct RabiaEngine<S: StateMachine, N, P> {
    node_id: NodeId,
    config: ProtocolConfig,
    state_machine: S,
    network: N,
    store: P,
    metrics: Arc<EngineMetrics>,
    members: BTreeSet<NodeId>,
    staged_members: Option<BTreeSet<NodeId>>,
    quorum: Quorum,
    mode: EngineMode,
    phase: Phase,
    behind: bool,
    phases: BoundedMap<Phase, PhaseData<S::Command>>,
    pending: PendingQueue<S::Command>,
    committed: BoundedMap<BatchId, u64>,
    waiters: BoundedMap<CorrelationId, Responder<S::Response>>,
    clock: LogicalClock,
    sync: Option<SyncCollector<S::Command>>,
    now: Instant,
    last_cleanup: Instant,
}

impl<S, N, P> RabiaEngine<S, N, P>
where
    S: StateMachine,
    N: ClusterNetwork<S::Command>,
    P: PersistenceStore<S::Command>,
{
    /// Create an engine, resuming from the store's checkpoint if it has one
    ///
    /// A single-member cluster starts active. Otherwise the engine starts
    /// suspended and syncs with its peers once quorum is reported.
    pub fn new(
        node_id: NodeId,
        members: impl IntoIterator<Item = NodeId>,
        config: ProtocolConfig,
        state_machine: S,
        network: N,
        store: P,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let mut members: BTreeSet<NodeId> = members.into_iter().collect();
        members.insert(node_id);
        let quorum = Quorum::new(members.len());
        let mode = if members.len() == 1 {
            EngineMode::Active
        } else {
            EngineMode::Suspended
        };

        let mut engine = Self {
            node_id,
            phases: BoundedMap::new(config.max_tracked_phases()),
            pending: PendingQueue::new(config.max_pending_batches()),
            committed: BoundedMap::new(config.committed_history_size()),
            waiters: BoundedMap::new(config.max_tracked_correlations()),
            config,
            state_machine,
            network,
            store,
            metrics: Arc::new(EngineMetrics::default()),
            members,
            staged_members: None,
            quorum,
            mode,
            phase: Phase::ZERO,
            behind: false,
            clock: LogicalClock::new(),
            sync: None,
            now,
            last_cleanup: now,
        };

        if let Some(saved) = engine.store.load()? {
            engine.state_machine.restore(&saved.state)?;
            engine.phase = saved.last_phase;
            for (id, ts) in saved.committed {
                engine.committed.insert(id, ts);
                engine.clock.observe(ts);
            }
            for batch in saved.pending {
                engine.clock.observe(batch.timestamp());
                engine.pending.insert(batch);
            }
            let resumed = saved.open_phase.filter(|open| open.phase == engine.phase);
            let voted = resumed.as_ref().map_or(0, |open| open.votes.len());
            if let Some(open) = resumed {
                engine.clock.observe(open.proposal.timestamp());
                let data = PhaseData::resume(
                    open,
                    node_id,
                    now,
                    engine.config.retransmit_interval(),
                );
                engine.phases.insert(engine.phase, data);
            }
            info!(
                node = %node_id,
                phase = %engine.phase,
                pending = engine.pending.len(),
                own_votes = voted,
                "resumed from checkpoint"
            );
        }

        info!(
            node = %node_id,
            members = engine.members.len(),
            mode = ?engine.mode,
            "consensus engine created"
        );
        Ok(engine)
    }

    /// Local node id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Operating mode
    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Phase being decided
    pub fn current_phase(&self) -> Phase {
        self.phase
    }

    /// Batches awaiting consensus
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Members counted for quorum
    pub fn members(&self) -> Vec<NodeId> {
        self.members.iter().copied().collect()
    }

    /// The replicated state machine
    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    /// Shared counters
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Outbound network handle
    pub fn network(&self) -> &N {
        &self.network
    }

    /// Point-in-time view
    pub fn status(&self) -> EngineStatus {
        let data = self.phases.peek(&self.phase);
        EngineStatus {
            node_id: self.node_id,
            mode: self.mode,
            phase: self.phase,
            stage: data.map(|d| d.stage),
            iteration: data.map_or(0, |d| d.iteration),
            pending: self.pending.len(),
            cluster_size: self.quorum.cluster_size(),
            quorum_size: self.quorum.quorum_size(),
            tracked_phases: self.phases.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Submit commands for replication
    ///
    /// The batch is queued locally and disseminated. When `responder` is
    /// given it receives the state machine's responses once the batch is
    /// applied, or the error if the submission is rejected here. While
    /// quorum is lost the batch simply waits.
    pub fn submit(
        &mut self,
        commands: Vec<S::Command>,
        responder: Option<Responder<S::Response>>,
    ) -> Result<CorrelationId> {
        let correlation_id = CorrelationId::new();
        let batch = match Batch::with_correlation(commands, correlation_id, self.clock.tick()) {
            Ok(batch) => batch,
            Err(e) => {
                EngineMetrics::incr(&self.metrics.proposals_rejected);
                let reason = e.to_string();
                return Err(reject(responder, || RabiaError::ProposalRejected {
                    reason: reason.clone(),
                }));
            }
        };

        if self.pending.insert(batch.clone()) == Admission::Full {
            EngineMetrics::incr(&self.metrics.proposals_rejected);
            warn!(node = %self.node_id, batch = %batch.id(), "pending queue full, proposal rejected");
            let limit = self.config.max_pending_batches();
            return Err(reject(responder, || RabiaError::ResourceExhausted {
                resource: "pending batches".to_string(),
                limit,
            }));
        }
        EngineMetrics::incr(&self.metrics.proposals_submitted);
        if let Some(responder) = responder {
            self.track(correlation_id, responder);
        }
        debug!(
            node = %self.node_id,
            batch = %batch.id(),
            timestamp = batch.timestamp(),
            commands = batch.commands().len(),
            "batch submitted"
        );

        // An identical pending batch keeps its earlier stamp
        let batch = self.pending.get(&batch.id()).cloned().unwrap_or(batch);
        match self.mode {
            EngineMode::Active => {
                self.network.broadcast(ProtocolMessage::NewBatch {
                    sender: self.node_id,
                    batch,
                });
                self.drive();
            }
            EngineMode::Suspended => self.persist(),
            EngineMode::Syncing => {}
        }
        Ok(correlation_id)
    }

    /// Process one message from a peer
    pub fn handle_message(&mut self, message: ProtocolMessage<S::Command>) {
        let sender = message.sender();
        if sender == self.node_id || !self.members.contains(&sender) {
            EngineMetrics::incr(&self.metrics.messages_dropped);
            trace!(node = %self.node_id, %sender, "message from non-member dropped");
            return;
        }

        match message {
            ProtocolMessage::NewBatch { batch, .. } => {
                self.learn_batch(batch);
                self.drive();
            }
            ProtocolMessage::Propose { phase, batch, .. } => {
                if self.admit(sender, phase, false) {
                    self.on_propose(sender, phase, batch);
                }
            }
            ProtocolMessage::VoteRound1 {
                phase,
                iteration,
                value,
                batch,
                ..
            } => {
                if self.admit(sender, phase, false) {
                    self.on_vote(sender, phase, Round::One, iteration, value, batch);
                }
            }
            ProtocolMessage::VoteRound2 {
                phase,
                iteration,
                value,
                batch,
                ..
            } => {
                if self.admit(sender, phase, false) {
                    self.on_vote(sender, phase, Round::Two, iteration, value, batch);
                }
            }
            ProtocolMessage::Decision {
                phase,
                value,
                batch,
                ..
            } => {
                if self.admit(sender, phase, true) {
                    self.on_decision(sender, phase, value, batch);
                }
            }
            ProtocolMessage::SyncRequest { .. } => self.on_sync_request(sender),
            ProtocolMessage::SyncResponse { state, .. } => self.on_sync_response(sender, state),
        }
    }

    /// Advance timers: retransmission, sync retry and cleanup
    pub fn on_tick(&mut self, now: Instant) {
        self.now = now;
        match self.mode {
            EngineMode::Active => self.retransmit(),
            EngineMode::Syncing => self.retry_sync(),
            EngineMode::Suspended => {}
        }
        if now.saturating_duration_since(self.last_cleanup) >= self.config.cleanup_interval() {
            self.last_cleanup = now;
            self.cleanup();
        }
    }

    /// Quorum is no longer reachable: stop voting and checkpoint
    pub fn on_quorum_lost(&mut self) {
        if self.mode == EngineMode::Suspended {
            return;
        }
        warn!(node = %self.node_id, phase = %self.phase, "quorum lost, suspending consensus");
        self.mode = EngineMode::Suspended;
        self.sync = None;
        self.persist();
    }

    /// Quorum is reachable again: sync with peers before voting
    pub fn on_quorum_established(&mut self) {
        if self.mode != EngineMode::Suspended {
            return;
        }
        info!(node = %self.node_id, "quorum established, syncing with peers");
        self.start_sync("quorum established");
    }

    /// Replace the member set used for quorum arithmetic
    ///
    /// Takes effect at the next phase boundary, or immediately when the
    /// current phase has not started.
    pub fn update_membership(&mut self, members: impl IntoIterator<Item = NodeId>) {
        let mut members: BTreeSet<NodeId> = members.into_iter().collect();
        members.insert(self.node_id);
        if members == self.members {
            self.staged_members = None;
            return;
        }
        let started = self
            .phases
            .peek(&self.phase)
            .map_or(false, |data| data.is_open() || data.peer_activity());
        self.staged_members = Some(members);
        if !started {
            self.apply_staged_membership();
        }
    }

    /// Write the current checkpoint to the store
    pub fn flush(&mut self) -> Result<()> {
        let state = self.checkpoint()?;
        self.store.save(&state)
    }

    /// Current checkpoint
    pub fn checkpoint(&self) -> Result<SavedState<S::Command>> {
        let mut committed: Vec<(BatchId, u64)> =
            self.committed.iter().map(|(id, ts)| (*id, *ts)).collect();
        committed.sort_by_key(|(id, ts)| (*ts, *id));
        Ok(SavedState {
            state: self.state_machine.snapshot()?,
            last_phase: self.phase,
            pending: self.pending.to_sorted_vec(),
            committed,
            open_phase: self
                .phases
                .peek(&self.phase)
                .and_then(|data| data.open_phase(self.phase)),
        })
    }

    /// Checkpoint shipped to peers; own votes stay local
    fn shared_checkpoint(&self) -> Result<SavedState<S::Command>> {
        let mut state = self.checkpoint()?;
        state.open_phase = None;
        Ok(state)
    }

    // === Intake ===

    fn track(&mut self, correlation_id: CorrelationId, responder: Responder<S::Response>) {
        if let Some((evicted, tx)) = self.waiters.insert(correlation_id, responder) {
            warn!(correlation = %evicted, "correlation tracker full, dropping oldest waiter");
            let _ = tx.send(Err(RabiaError::ProposalDropped {
                correlation_id: evicted.to_string(),
            }));
        }
    }

    fn is_committed(&self, batch: &Batch<S::Command>) -> bool {
        self.committed
            .peek(&batch.id())
            .map_or(false, |ts| *ts >= batch.timestamp())
    }

    fn learn_batch(&mut self, batch: Batch<S::Command>) -> bool {
        if batch.is_empty_sentinel() || self.is_committed(&batch) {
            return false;
        }
        self.clock.observe(batch.timestamp());
        match self.pending.insert(batch) {
            Admission::Added => {
                EngineMetrics::incr(&self.metrics.batches_learned);
                true
            }
            Admission::Merged => false,
            Admission::Full => {
                EngineMetrics::incr(&self.metrics.messages_dropped);
                warn!(node = %self.node_id, "pending queue full, learned batch dropped");
                false
            }
        }
    }

    /// Decide whether a phase message is processed; answers stale senders
    /// and starts sync when the sender is well ahead
    fn admit(&mut self, sender: NodeId, phase: Phase, is_decision: bool) -> bool {
        if self.mode != EngineMode::Active {
            EngineMetrics::incr(&self.metrics.messages_dropped);
            return false;
        }
        if phase < self.phase {
            if !is_decision {
                self.answer_stale(sender, phase);
            }
            return false;
        }
        let distance = phase.distance_from(self.phase);
        let lagging = if is_decision {
            distance > self.config.phase_lookahead()
        } else {
            distance >= 2
        };
        if lagging {
            self.start_sync("peer is at least two phases ahead");
            return false;
        }
        true
    }

    fn answer_stale(&mut self, sender: NodeId, phase: Phase) {
        if let Some((value, batch)) = self.phases.peek(&phase).and_then(|d| d.decision.clone()) {
            self.network.send(
                sender,
                ProtocolMessage::Decision {
                    sender: self.node_id,
                    phase,
                    value,
                    batch,
                },
            );
            return;
        }
        match self.shared_checkpoint() {
            Ok(state) => {
                debug!(node = %self.node_id, %sender, %phase, "peer behind retained window, sending checkpoint");
                self.network.send(
                    sender,
                    ProtocolMessage::SyncResponse {
                        sender: self.node_id,
                        state,
                    },
                );
            }
            Err(e) => error!(node = %self.node_id, error = %e, "failed to build checkpoint"),
        }
    }

    fn phase_entry(&mut self, phase: Phase) -> Option<&mut PhaseData<S::Command>> {
        if !self.phases.contains_key(&phase) {
            let data = PhaseData::new(self.now, self.config.retransmit_interval());
            if let Some((evicted, _)) = self.phases.insert(phase, data) {
                trace!(node = %self.node_id, phase = %evicted, "phase bookkeeping evicted");
            }
        }
        self.phases.get_mut(&phase)
    }

    fn on_propose(&mut self, sender: NodeId, phase: Phase, batch: Batch<S::Command>) {
        self.learn_batch(batch.clone());
        if phase > self.phase {
            self.behind = true;
        }
        let (now, initial) = (self.now, self.config.retransmit_interval());
        if let Some(data) = self.phase_entry(phase) {
            if data.proposals.record(sender, batch) {
                data.touch(now, initial);
            }
        }
        self.drive();
    }

    fn on_vote(
        &mut self,
        sender: NodeId,
        phase: Phase,
        round: Round,
        iteration: u32,
        value: StateValue,
        batch: Option<Batch<S::Command>>,
    ) {
        if value == StateValue::V1 && batch.as_ref().map_or(true, Batch::is_empty_sentinel) {
            EngineMetrics::incr(&self.metrics.messages_dropped);
            warn!(node = %self.node_id, %sender, %phase, "V1 vote without a batch dropped");
            return;
        }
        if let Some(batch) = &batch {
            self.learn_batch(batch.clone());
        }
        if phase > self.phase {
            self.behind = true;
        }
        let (now, initial) = (self.now, self.config.retransmit_interval());
        if let Some(data) = self.phase_entry(phase) {
            if iteration.saturating_add(1) < data.iteration {
                return;
            }
            data.learn_candidate(batch.as_ref());
            if data.tally_mut(round, iteration).record(sender, value, batch) {
                data.touch(now, initial);
            }
        }
        self.drive();
    }

    fn on_decision(
        &mut self,
        sender: NodeId,
        phase: Phase,
        value: StateValue,
        batch: Batch<S::Command>,
    ) {
        let valid = match value {
            StateValue::V1 => !batch.is_empty_sentinel(),
            StateValue::V0 => true,
            StateValue::VQuestion => false,
        };
        if !valid {
            EngineMetrics::incr(&self.metrics.messages_dropped);
            warn!(node = %self.node_id, %sender, %phase, %value, "malformed decision dropped");
            return;
        }
        if phase > self.phase {
            self.behind = true;
        }
        let node_id = self.node_id;
        let metrics = self.metrics.clone();
        let Some(data) = self.phase_entry(phase) else {
            return;
        };
        match &data.decision {
            Some((existing, decided)) => {
                if *existing != value || decided.id() != batch.id() {
                    error!(
                        node = %node_id,
                        %phase,
                        local = %existing,
                        remote = %value,
                        "conflicting decisions for one phase"
                    );
                }
                return;
            }
            None => {
                debug!(node = %node_id, %phase, %value, %sender, "decision adopted from peer");
                data.decision = Some((value, batch));
                data.stage = PhaseStage::Decided;
                EngineMetrics::incr(&metrics.adopted_decisions);
            }
        }
        self.drive();
    }

    // === Phase progress ===

    fn drive(&mut self) {
        if self.mode != EngineMode::Active {
            return;
        }
        loop {
            match self.step() {
                Step::Apply => self.apply_current(),
                Step::Progress => {}
                Step::Idle => {
                    if !self.open_current() {
                        break;
                    }
                }
            }
        }
    }

    /// Propose for the current phase if there is work or a peer started it
    fn open_current(&mut self) -> bool {
        let phase = self.phase;
        let (opened, activity) = self
            .phases
            .peek(&phase)
            .map_or((false, false), |d| (d.is_open() || d.decision.is_some(), d.peer_activity()));
        if opened || (self.pending.is_empty() && !activity && !self.behind) {
            return false;
        }

        let proposal = self.pending.peek_min().cloned().unwrap_or_else(Batch::empty);
        let (node_id, now, initial) = (self.node_id, self.now, self.config.retransmit_interval());
        let Some(data) = self.phase_entry(phase) else {
            return false;
        };
        data.own_proposal = Some(proposal.clone());
        data.proposals.record(node_id, proposal.clone());
        data.touch(now, initial);
        debug!(node = %node_id, %phase, batch = %proposal.id(), "proposing");
        self.persist();
        self.network.broadcast(ProtocolMessage::Propose {
            sender: node_id,
            phase,
            batch: proposal,
        });
        true
    }

    fn step(&mut self) -> Step {
        let phase = self.phase;
        let quorum = self.quorum;
        let node_id = self.node_id;
        let now = self.now;
        let initial = self.config.retransmit_interval();
        let max_iterations = self.config.max_phase_iterations();
        let metrics = self.metrics.clone();

        let Some(data) = self.phases.get_mut(&phase) else {
            return Step::Idle;
        };
        let mut outbox = Vec::new();

        let progressed = match data.stage {
            PhaseStage::Decided if data.decision.is_some() => return Step::Apply,
            PhaseStage::Decided => false,
            PhaseStage::Applied => false,
            PhaseStage::Collecting => {
                if !data.is_open() || data.proposals.total() < quorum.quorum_size() {
                    false
                } else {
                    let (value, batch) = match data.proposals.majority(quorum.quorum_size()) {
                        Some(batch) if !batch.is_empty_sentinel() => {
                            (StateValue::V1, Some(batch.clone()))
                        }
                        _ => (StateValue::V0, None),
                    };
                    data.stage = PhaseStage::Round1;
                    outbox.push(cast(data, node_id, phase, Round::One, 0, value, batch, now, initial));
                    true
                }
            }
            PhaseStage::Round1 => {
                let iteration = data.iteration;
                match data.tally(Round::One, iteration) {
                    Some(tally) if tally.total() >= quorum.quorum_size() => {
                        let v1 = tally.count(StateValue::V1);
                        let v0 = tally.count(StateValue::V0);
                        let batch = tally.batch().cloned().or_else(|| data.candidate.clone());
                        let fast = v1 >= quorum.super_majority_size() && batch.is_some();
                        let (value, vote_batch) = if v1 >= quorum.quorum_size() && batch.is_some() {
                            (StateValue::V1, batch.clone())
                        } else if v0 >= quorum.quorum_size() {
                            (StateValue::V0, None)
                        } else {
                            (StateValue::VQuestion, None)
                        };
                        data.stage = PhaseStage::Round2;
                        outbox.push(cast(
                            data, node_id, phase, Round::Two, iteration, value, vote_batch, now, initial,
                        ));
                        if fast {
                            if let Some(batch) = batch {
                                EngineMetrics::incr(&metrics.fast_path_decisions);
                                debug!(node = %node_id, %phase, iteration, "decided on fast path");
                                outbox.push(decide(data, node_id, phase, StateValue::V1, batch));
                            }
                        }
                        true
                    }
                    _ => false,
                }
            }
            PhaseStage::Round2 => {
                let iteration = data.iteration;
                let round2 = data
                    .tally(Round::Two, iteration)
                    .filter(|tally| tally.total() >= quorum.quorum_size())
                    .map(|tally| {
                        (
                            tally.count(StateValue::V1),
                            tally.count(StateValue::V0),
                            tally.batch().cloned(),
                        )
                    });
                match round2 {
                    None => false,
                    Some((v1, v0, r2_batch)) => {
                        let batch = r2_batch.or_else(|| data.candidate.clone());
                        let saw_v1_round1 = data
                            .tally(Round::One, iteration)
                            .map_or(false, |tally| tally.count(StateValue::V1) > 0);

                        if v1 >= quorum.f_plus_one() && batch.is_some() {
                            if let Some(batch) = batch {
                                EngineMetrics::incr(&metrics.slow_path_decisions);
                                debug!(node = %node_id, %phase, iteration, "decided V1 in round 2");
                                outbox.push(decide(data, node_id, phase, StateValue::V1, batch));
                            }
                        } else if v0 >= quorum.f_plus_one() {
                            EngineMetrics::incr(&metrics.slow_path_decisions);
                            debug!(node = %node_id, %phase, iteration, "decided V0 in round 2");
                            outbox.push(decide(data, node_id, phase, StateValue::V0, Batch::empty()));
                        } else {
                            let carried = if v1 > 0 || (v0 == 0 && saw_v1_round1) {
                                StateValue::V1
                            } else if v0 > 0 {
                                StateValue::V0
                            } else {
                                coin(phase, iteration)
                            };
                            let (value, vote_batch) = match (carried, batch) {
                                (StateValue::V1, Some(batch)) => (StateValue::V1, Some(batch)),
                                _ => (StateValue::V0, None),
                            };

                            data.iteration = iteration + 1;
                            data.stage = PhaseStage::Round1;
                            data.prune_iterations();
                            EngineMetrics::incr(&metrics.iterations);
                            debug!(
                                node = %node_id,
                                %phase,
                                iteration = data.iteration,
                                carried = %value,
                                "starting next iteration"
                            );
                            if data.iteration >= max_iterations
                                && data.iteration % max_iterations == 0
                            {
                                if !data.stalled {
                                    data.stalled = true;
                                    EngineMetrics::incr(&metrics.stalled_phases);
                                }
                                warn!(
                                    node = %node_id,
                                    %phase,
                                    iterations = data.iteration,
                                    "phase stalled, still retrying"
                                );
                            }
                            let next = data.iteration;
                            outbox.push(cast(
                                data, node_id, phase, Round::One, next, value, vote_batch, now, initial,
                            ));
                        }
                        true
                    }
                }
            }
        };

        // Own votes reach the store before any peer can count them
        if !outbox.is_empty() {
            self.persist();
        }
        for message in outbox {
            self.network.broadcast(message);
        }
        if progressed {
            Step::Progress
        } else {
            Step::Idle
        }
    }

    fn apply_current(&mut self) {
        let phase = self.phase;
        let Some(data) = self.phases.get_mut(&phase) else {
            return;
        };
        let Some((value, batch)) = data.decision.clone() else {
            return;
        };
        data.stage = PhaseStage::Applied;

        if value == StateValue::V1 && !batch.is_empty_sentinel() {
            self.commit(phase, batch);
        } else {
            EngineMetrics::incr(&self.metrics.empty_phases);
            debug!(node = %self.node_id, %phase, "phase decided without a batch");
        }

        self.phase = phase.next();
        self.behind = self
            .phases
            .iter()
            .any(|(p, data)| *p >= self.phase && (data.decision.is_some() || data.peer_activity()));
        self.apply_staged_membership();
        self.persist();
    }

    fn commit(&mut self, phase: Phase, batch: Batch<S::Command>) {
        let id = batch.id();
        let local = self.pending.remove(&id);
        let duplicate = self.is_committed(&batch);
        let recorded = self.committed.peek(&id).copied().unwrap_or(0);
        self.committed.insert(id, recorded.max(batch.timestamp()));
        self.clock.observe(batch.timestamp());

        let mut correlation_ids: BTreeSet<CorrelationId> = batch.correlation_ids().clone();
        if let Some(local) = &local {
            correlation_ids.extend(local.correlation_ids().iter().copied());
        }

        if duplicate {
            EngineMetrics::incr(&self.metrics.duplicate_commits_skipped);
            warn!(node = %self.node_id, %phase, batch = %id, "batch already committed, skipping");
            for correlation_id in correlation_ids {
                if let Some(tx) = self.waiters.remove(&correlation_id) {
                    let _ = tx.send(Err(RabiaError::ProposalRejected {
                        reason: format!("{id} duplicates a committed batch"),
                    }));
                }
            }
            return;
        }

        let responses = self.state_machine.apply(batch.commands());
        EngineMetrics::incr(&self.metrics.batches_applied);
        debug!(
            node = %self.node_id,
            %phase,
            batch = %id,
            commands = batch.commands().len(),
            "batch applied"
        );
        for correlation_id in correlation_ids {
            if let Some(tx) = self.waiters.remove(&correlation_id) {
                let _ = tx.send(Ok(responses.clone()));
            }
        }
    }

    fn apply_staged_membership(&mut self) {
        if let Some(members) = self.staged_members.take() {
            info!(
                node = %self.node_id,
                phase = %self.phase,
                from = self.members.len(),
                to = members.len(),
                "membership change applied"
            );
            self.quorum = Quorum::new(members.len());
            self.members = members;
        }
    }

    fn persist(&mut self) {
        let result = self.checkpoint().and_then(|state| self.store.save(&state));
        if let Err(e) = result {
            EngineMetrics::incr(&self.metrics.persistence_failures);
            error!(node = %self.node_id, error = %e, "checkpoint failed");
        }
    }

    // === Timers ===

    fn retransmit(&mut self) {
        let (phase, node_id, now) = (self.phase, self.node_id, self.now);
        let max = self.config.max_retransmit_interval();
        let Some(data) = self.phases.get_mut(&phase) else {
            return;
        };
        if !data.is_open() || data.decision.is_some() {
            return;
        }
        if now.saturating_duration_since(data.last_progress) < data.retransmit_after {
            return;
        }
        data.last_progress = now;
        data.retransmit_after = (data.retransmit_after * 2).min(max);

        let mut outbox = Vec::new();
        if let Some(batch) = &data.own_proposal {
            outbox.push(ProtocolMessage::Propose {
                sender: node_id,
                phase,
                batch: batch.clone(),
            });
        }
        for ((iteration, round), (value, batch)) in &data.own_votes {
            outbox.push(vote_message(node_id, phase, *round, *iteration, *value, batch.clone()));
        }

        EngineMetrics::incr(&self.metrics.retransmissions);
        debug!(node = %node_id, %phase, messages = outbox.len(), "retransmitting");
        for message in outbox {
            self.network.broadcast(message);
        }
    }

    fn cleanup(&mut self) {
        let floor = self.phase.saturating_back(self.config.remove_older_than_phases());
        let removed = self.phases.retain(|phase, _| *phase >= floor);
        self.pending.compact();
        if removed > 0 {
            debug!(node = %self.node_id, removed, %floor, "purged old phase bookkeeping");
        }
    }

    // === Sync ===

    fn start_sync(&mut self, reason: &str) {
        if self.mode == EngineMode::Syncing {
            return;
        }
        let own = match self.checkpoint() {
            Ok(own) => own,
            Err(e) => {
                error!(node = %self.node_id, error = %e, "cannot start sync without a local checkpoint");
                return;
            }
        };
        info!(node = %self.node_id, phase = %self.phase, reason, "starting sync");
        self.mode = EngineMode::Syncing;
        self.sync = Some(SyncCollector::new(self.node_id, own, self.now));
        EngineMetrics::incr(&self.metrics.syncs_started);
        self.network.broadcast(ProtocolMessage::SyncRequest {
            sender: self.node_id,
        });
        self.try_finish_sync();
    }

    fn retry_sync(&mut self) {
        let (now, interval) = (self.now, self.config.sync_retry_interval());
        let Some(collector) = self.sync.as_mut() else {
            return;
        };
        if now.saturating_duration_since(collector.last_request) < interval {
            return;
        }
        collector.last_request = now;
        debug!(
            node = %self.node_id,
            responses = collector.len(),
            waited = ?now.saturating_duration_since(collector.started),
            "retrying sync request"
        );
        self.network.broadcast(ProtocolMessage::SyncRequest {
            sender: self.node_id,
        });
    }

    fn on_sync_request(&mut self, sender: NodeId) {
        match self.shared_checkpoint() {
            Ok(state) => self.network.send(
                sender,
                ProtocolMessage::SyncResponse {
                    sender: self.node_id,
                    state,
                },
            ),
            Err(e) => error!(node = %self.node_id, error = %e, "failed to answer sync request"),
        }
    }

    fn on_sync_response(&mut self, sender: NodeId, state: SavedState<S::Command>) {
        match self.mode {
            EngineMode::Syncing => {}
            EngineMode::Active if state.last_phase.distance_from(self.phase) >= 2 => {
                self.start_sync("peer checkpoint is ahead");
            }
            _ => return,
        }
        if let Some(collector) = self.sync.as_mut() {
            collector.record(sender, state);
        }
        self.try_finish_sync();
    }

    fn try_finish_sync(&mut self) {
        let ready = self
            .sync
            .as_ref()
            .map_or(false, |collector| self.quorum.is_quorum(collector.len()));
        if !ready {
            return;
        }
        let Some(outcome) = self.sync.take().and_then(SyncCollector::finish) else {
            return;
        };
        if self.adopt(outcome) {
            self.mode = EngineMode::Active;
            EngineMetrics::incr(&self.metrics.syncs_completed);
            info!(node = %self.node_id, phase = %self.phase, "sync complete, rejoining");
            self.drive();
        } else {
            self.mode = EngineMode::Suspended;
            self.start_sync("previous sync could not be adopted");
        }
    }

    fn adopt(&mut self, outcome: SyncOutcome<S::Command>) -> bool {
        let SyncOutcome {
            best,
            source,
            pending,
            committed,
        } = outcome;

        if best.last_phase > self.phase {
            if let Err(e) = self.state_machine.restore(&best.state) {
                error!(node = %self.node_id, %source, error = %e, "failed to restore peer snapshot");
                return false;
            }
            info!(
                node = %self.node_id,
                from = %self.phase,
                to = %best.last_phase,
                %source,
                "adopted peer checkpoint"
            );
            self.phase = best.last_phase;
            let floor = self.phase;
            self.phases.retain(|phase, _| *phase >= floor);
        }

        for (id, ts) in committed {
            let recorded = self.committed.peek(&id).copied().unwrap_or(0);
            self.committed.insert(id, recorded.max(ts));
            self.clock.observe(ts);
        }
        for batch in pending {
            self.learn_batch(batch);
        }

        let stale: Vec<Batch<S::Command>> = self
            .pending
            .to_sorted_vec()
            .into_iter()
            .filter(|batch| self.is_committed(batch))
            .collect();
        for batch in stale {
            self.pending.remove(&batch.id());
            for correlation_id in batch.correlation_ids() {
                if let Some(tx) = self.waiters.remove(correlation_id) {
                    let _ = tx.send(Err(RabiaError::ProposalDropped {
                        correlation_id: correlation_id.to_string(),
                    }));
                }
            }
        }

        self.behind = false;
        self.persist();
        true
    }
}

fn reject<R>(responder: Option<Responder<R>>, error: impl Fn() -> RabiaError) -> RabiaError {
    if let Some(tx) = responder {
        let _ = tx.send(Err(error()));
    }
    error()
}

/// Common coin: identical on every node for a given phase and iteration
pub fn coin(phase: Phase, iteration: u32) -> StateValue {
    let mut hasher = Sha256::new();
    hasher.update(phase.get().to_be_bytes());
    hasher.update(iteration.to_be_bytes());
    let digest = hasher.finalize();
    if digest[0] & 1 == 1 {
        StateValue::V1
    } else {
        StateValue::V0
    }
}

fn vote_message<C>(
    sender: NodeId,
    phase: Phase,
    round: Round,
    iteration: u32,
    value: StateValue,
    batch: Option<Batch<C>>,
) -> ProtocolMessage<C> {
    match round {
        Round::One => ProtocolMessage::VoteRound1 {
            sender,
            phase,
            iteration,
            value,
            batch,
        },
        Round::Two => ProtocolMessage::VoteRound2 {
            sender,
            phase,
            iteration,
            value,
            batch,
        },
    }
}

/// Record the local vote and build its broadcast
#[allow(clippy::too_many_arguments)]
fn cast<C: Clone>(
    data: &mut PhaseData<C>,
    node_id: NodeId,
    phase: Phase,
    round: Round,
    iteration: u32,
    value: StateValue,
    batch: Option<Batch<C>>,
    now: Instant,
    initial: Duration,
) -> ProtocolMessage<C> {
    data.learn_candidate(batch.as_ref());
    data.tally_mut(round, iteration)
        .record(node_id, value, batch.clone());
    data.own_votes.insert((iteration, round), (value, batch.clone()));
    data.touch(now, initial);
    vote_message(node_id, phase, round, iteration, value, batch)
}

/// Record a local decision and build its broadcast
fn decide<C: Clone>(
    data: &mut PhaseData<C>,
    node_id: NodeId,
    phase: Phase,
    value: StateValue,
    batch: Batch<C>,
) -> ProtocolMessage<C> {
    data.decision = Some((value, batch.clone()));
    data.stage = PhaseStage::Decided;
    ProtocolMessage::Decision {
        sender: node_id,
        phase,
        value,
        batch,
    }
}
