//! Deterministic cluster simulator
//!
//! [`SimCluster`] runs several [`RabiaEngine`]s in one thread over a
//! discrete clock. Every message crosses a simulated network that can lose,
//! duplicate and delay it, cut links between groups of nodes, and drop all
//! traffic of nodes flagged as Byzantine. All randomness comes from a seeded
//! `StdRng`, so a failing run can be replayed from its seed. Reconnection
//! backoff therefore runs without jitter.
//!
//! Each simulated node also owns a [`TopologyManager`] and a
//! [`LeaderManager`]. Link changes are reported to them the way a transport
//! would, and their quorum notifications drive the engines into and out of
//! suspension.
//!
//! # Usage
//!
//! ```rust
//! use rabia_consensus::test_helpers::{LogMachine, SimCluster};
//!
//! let mut cluster = SimCluster::<LogMachine>::new(3).unwrap();
//! cluster.submit(0, vec!["hello".to_string()]).unwrap();
//! assert!(cluster.run_until_converged(1_000));
//! cluster.assert_all_nodes_agree();
//! ```
//!
//! # Feature Requirements
//!
//! This module requires the `test-helpers` feature flag, which is enabled by
//! default.

use crate::config::{ConfigError, ProtocolConfig};
use crate::engine::{EngineMode, EngineStatus, RabiaEngine};
use crate::error::{RabiaError, Result};
use crate::leader::LeaderManager;
use crate::messages::{ClusterEvent, EventKind, ProtocolMessage};
use crate::router::MessageRouter;
use crate::state_machine::StateMachine;
use crate::storage::MemoryStore;
use crate::topology::backoff::{BackoffConfig, BackoffStrategy};
use crate::topology::{ConnectionControl, TopologyManager};
use crate::transport::ClusterNetwork;
use crate::types::{CorrelationId, NodeId, NodeInfo, Phase};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

/// Engine type driven by the simulator
pub type SimEngine<S> = RabiaEngine<
    S,
    SimNetwork<<S as StateMachine>::Command>,
    MemoryStore<<S as StateMachine>::Command>,
>;

/// Network conditions and protocol tuning of a simulation
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Seed of every random choice
    pub seed: u64,
    /// Probability that a message is lost
    pub loss_rate: f64,
    /// Probability that a delivered message is delivered twice
    pub duplicate_rate: f64,
    /// Messages arrive 1 to `max_delay_ticks` ticks after being sent
    pub max_delay_ticks: u64,
    /// Simulated time per tick
    pub tick: Duration,
    /// Topology reconciliation period, in ticks
    pub reconcile_every: u64,
    /// Engine tuning
    pub protocol: ProtocolConfig,
    /// Reconnection backoff; jitter must be zero
    pub backoff: BackoffConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            max_delay_ticks: 3,
            tick: Duration::from_millis(10),
            reconcile_every: 50,
            protocol: ProtocolConfig::default(),
            backoff: BackoffConfig {
                strategy: BackoffStrategy {
                    jitter: 0.0,
                    ..BackoffStrategy::default()
                },
                ..BackoffConfig::default()
            },
        }
    }
}

impl SimConfig {
    /// Replace the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replace the loss probability
    pub fn with_loss(mut self, rate: f64) -> Self {
        self.loss_rate = rate;
        self
    }

    /// Replace the duplication probability
    pub fn with_duplication(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    /// Replace the engine tuning
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    fn validate(&self) -> Result<()> {
        for (field, rate) in [
            ("sim.loss_rate", self.loss_rate),
            ("sim.duplicate_rate", self.duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    message: format!("Probability must be within [0, 1], got {rate}"),
                }
                .into());
            }
        }
        if self.max_delay_ticks == 0 || self.reconcile_every == 0 {
            return Err(ConfigError::Invalid {
                field: "sim".to_string(),
                message: "Delay and reconciliation period must be positive".to_string(),
            }
            .into());
        }
        if self.backoff.strategy.jitter != 0.0 {
            return Err(ConfigError::Invalid {
                field: "sim.backoff.jitter".to_string(),
                message: "Backoff jitter is not seeded and must be 0".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Traffic counters of a simulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Messages handed to an engine
    pub delivered: u64,
    /// Messages lost in transit
    pub lost: u64,
    /// Extra copies injected
    pub duplicated: u64,
    /// Messages dropped on a cut link or at a stopped node
    pub blocked: u64,
    /// Messages of Byzantine-flagged nodes dropped at the boundary
    pub byzantine_dropped: u64,
}

struct Outgoing<C> {
    from: NodeId,
    to: Option<NodeId>,
    message: ProtocolMessage<C>,
}

struct Envelope<C> {
    from: NodeId,
    to: NodeId,
    message: ProtocolMessage<C>,
}

type Outbox<C> = Arc<Mutex<Vec<Outgoing<C>>>>;

/// Engine side of the simulated network
pub struct SimNetwork<C> {
    node_id: NodeId,
    outbox: Outbox<C>,
}

impl<C: Send> ClusterNetwork<C> for SimNetwork<C> {
    fn send(&self, to: NodeId, message: ProtocolMessage<C>) {
        self.outbox.lock().push(Outgoing {
            from: self.node_id,
            to: Some(to),
            message,
        });
    }

    fn broadcast(&self, message: ProtocolMessage<C>) {
        self.outbox.lock().push(Outgoing {
            from: self.node_id,
            to: None,
            message,
        });
    }
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

#[derive(Default)]
struct Links {
    blocked: HashSet<(NodeId, NodeId)>,
    down: HashSet<NodeId>,
}

impl Links {
    fn up(&self, a: NodeId, b: NodeId) -> bool {
        !self.down.contains(&a) && !self.down.contains(&b) && !self.blocked.contains(&link(a, b))
    }
}

/// Topology side of the simulated network
///
/// Connection attempts are queued and resolved on the next tick.
struct SimControl {
    node_id: NodeId,
    members: Vec<NodeId>,
    links: Arc<RwLock<Links>>,
    requests: Arc<Mutex<Vec<(NodeId, NodeId)>>>,
}

impl ConnectionControl for SimControl {
    fn connect(&self, node: &NodeInfo) {
        self.requests.lock().push((self.node_id, node.id));
    }

    fn disconnect(&self, node: NodeId) {
        trace!(local = %self.node_id, peer = %node, "simulated disconnect");
    }

    fn connected_nodes(&self) -> Vec<NodeId> {
        let links = self.links.read();
        self.members
            .iter()
            .copied()
            .filter(|peer| *peer != self.node_id && links.up(self.node_id, *peer))
            .collect()
    }
}

struct SimNode<S: StateMachine> {
    id: NodeId,
    engine: Option<SimEngine<S>>,
    store: MemoryStore<S::Command>,
    topology: Arc<TopologyManager>,
    leader: Arc<LeaderManager>,
    quorum_events: Arc<Mutex<Vec<bool>>>,
    byzantine: bool,
}

/// Seeded discrete-time cluster
pub struct SimCluster<S: StateMachine> {
    config: SimConfig,
    nodes: Vec<SimNode<S>>,
    links: Arc<RwLock<Links>>,
    requests: Arc<Mutex<Vec<(NodeId, NodeId)>>>,
    outbox: Outbox<S::Command>,
    in_flight: BTreeMap<(u64, u64), Envelope<S::Command>>,
    rng: StdRng,
    origin: Instant,
    ticks: u64,
    sequence: u64,
    stats: SimStats,
}

impl<S: StateMachine + Default> SimCluster<S> {
    /// Healthy cluster of `size` nodes with default conditions
    pub fn new(size: usize) -> Result<Self> {
        Self::with_config(size, SimConfig::default())
    }

    /// Cluster of `size` nodes under the given conditions
    pub fn with_config(size: usize, config: SimConfig) -> Result<Self> {
        config.validate()?;
        let ids: Vec<NodeId> = (1..=size as u64).map(NodeId::new).collect();
        let links = Arc::new(RwLock::new(Links::default()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let outbox: Outbox<S::Command> = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();

        let mut nodes = Vec::with_capacity(size);
        for id in &ids {
            let router = Arc::new(MessageRouter::new());
            let control = Arc::new(SimControl {
                node_id: *id,
                members: ids.clone(),
                links: links.clone(),
                requests: requests.clone(),
            });
            let topology = Arc::new(TopologyManager::new(
                NodeInfo::new(*id, format!("sim-{id}")),
                config.backoff.clone(),
                control,
                router.clone(),
            ));
            topology.attach();
            let leader = LeaderManager::attach(topology.clone(), router.clone());

            let quorum_events = Arc::new(Mutex::new(Vec::new()));
            let sink = quorum_events.clone();
            router.add_routes(
                &[EventKind::QuorumEstablished, EventKind::QuorumDisappeared],
                move |event: &ClusterEvent| {
                    sink.lock()
                        .push(matches!(event, ClusterEvent::QuorumEstablished))
                },
            );

            let store = MemoryStore::new();
            let engine = RabiaEngine::new(
                *id,
                ids.iter().copied(),
                config.protocol.clone(),
                S::default(),
                SimNetwork {
                    node_id: *id,
                    outbox: outbox.clone(),
                },
                store.clone(),
                origin,
            )?;
            nodes.push(SimNode {
                id: *id,
                engine: Some(engine),
                store,
                topology,
                leader,
                quorum_events,
                byzantine: false,
            });
        }

        for node in &nodes {
            for id in &ids {
                node.topology.add_node(NodeInfo::new(*id, format!("sim-{id}")));
            }
            node.topology.reconcile(origin);
        }

        info!(size, seed = config.seed, "simulated cluster created");
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            nodes,
            links,
            requests,
            outbox,
            in_flight: BTreeMap::new(),
            origin,
            ticks: 0,
            sequence: 0,
            stats: SimStats::default(),
        })
    }

    /// Number of nodes, stopped ones included
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Ids of every node, by index
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    /// Id of the node at `index`
    pub fn node_id(&self, index: usize) -> NodeId {
        self.nodes[index].id
    }

    /// Engine of a running node
    pub fn engine(&self, index: usize) -> Option<&SimEngine<S>> {
        self.nodes[index].engine.as_ref()
    }

    /// Application state of a running node
    pub fn state(&self, index: usize) -> Option<&S::State> {
        self.engine(index).map(|engine| engine.state_machine().current_state())
    }

    /// Phase of a running node
    pub fn phase(&self, index: usize) -> Option<Phase> {
        self.engine(index).map(|engine| engine.current_phase())
    }

    /// Topology view of a node
    pub fn topology(&self, index: usize) -> &Arc<TopologyManager> {
        &self.nodes[index].topology
    }

    /// Leader as seen by a node
    pub fn leader(&self, index: usize) -> Option<NodeId> {
        self.nodes[index].leader.leader()
    }

    /// Status of every running node
    pub fn statuses(&self) -> Vec<EngineStatus> {
        self.nodes
            .iter()
            .filter_map(|node| node.engine.as_ref().map(|engine| engine.status()))
            .collect()
    }

    /// Traffic counters
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Elapsed ticks
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Current simulated time
    pub fn now(&self) -> Instant {
        self.origin + self.config.tick * self.ticks as u32
    }

    /// Submit commands at a node without waiting for the outcome
    pub fn submit(&mut self, index: usize, commands: Vec<S::Command>) -> Result<CorrelationId> {
        let engine = self.running_mut(index)?;
        let correlation_id = engine.submit(commands, None)?;
        self.flush_outbox();
        Ok(correlation_id)
    }

    /// Submit commands and receive the responses once applied at that node
    pub fn submit_tracked(
        &mut self,
        index: usize,
        commands: Vec<S::Command>,
    ) -> Result<oneshot::Receiver<Result<Vec<S::Response>>>> {
        let (tx, rx) = oneshot::channel();
        let engine = self.running_mut(index)?;
        engine.submit(commands, Some(tx))?;
        self.flush_outbox();
        Ok(rx)
    }

    /// Flag a node as Byzantine: all of its traffic is dropped
    pub fn set_byzantine(&mut self, index: usize, byzantine: bool) {
        self.nodes[index].byzantine = byzantine;
    }

    /// Cut every link between `isolated` and the other nodes
    pub fn create_network_partition(&mut self, isolated: &[usize]) {
        let now = self.now();
        let inside: Vec<NodeId> = isolated.iter().map(|i| self.nodes[*i].id).collect();
        let outside: Vec<NodeId> = self
            .node_ids()
            .into_iter()
            .filter(|id| !inside.contains(id))
            .collect();
        let mut cut = Vec::new();
        {
            let mut links = self.links.write();
            for a in &inside {
                for b in &outside {
                    if links.blocked.insert(link(*a, *b)) {
                        cut.push((*a, *b));
                    }
                }
            }
        }
        info!(isolated = ?inside, "network partition created");
        for (a, b) in cut {
            self.node_by_id(a).topology.on_connection_failed(b, now);
            self.node_by_id(b).topology.on_connection_failed(a, now);
        }
        self.dispatch_quorum_events();
    }

    /// Restore every cut link
    pub fn heal_network_partition(&mut self) {
        let restored: Vec<(NodeId, NodeId)> = self.links.write().blocked.drain().collect();
        info!(links = restored.len(), "network partition healed");
        for (a, b) in restored {
            if self.links.read().up(a, b) {
                self.node_by_id(a).topology.on_connection_established(b);
                self.node_by_id(b).topology.on_connection_established(a);
            }
        }
        self.dispatch_quorum_events();
    }

    /// Crash a node; its checkpoint store survives
    pub fn stop_node(&mut self, index: usize) {
        let now = self.now();
        let id = self.nodes[index].id;
        self.nodes[index].engine = None;
        self.links.write().down.insert(id);
        info!(node = %id, "node stopped");
        for node in &self.nodes {
            if node.id != id {
                node.topology.on_connection_failed(id, now);
            }
        }
        self.dispatch_quorum_events();
    }

    /// Restart a stopped node from its last checkpoint
    pub fn restart_node(&mut self, index: usize) -> Result<()> {
        let id = self.nodes[index].id;
        if self.nodes[index].engine.is_some() {
            return Ok(());
        }
        let engine = RabiaEngine::new(
            id,
            self.node_ids(),
            self.config.protocol.clone(),
            S::default(),
            SimNetwork {
                node_id: id,
                outbox: self.outbox.clone(),
            },
            self.nodes[index].store.clone(),
            self.now(),
        )?;
        self.nodes[index].engine = Some(engine);
        self.links.write().down.remove(&id);
        info!(node = %id, "node restarted");

        let peers: Vec<NodeId> = self
            .node_ids()
            .into_iter()
            .filter(|peer| *peer != id && self.links.read().up(id, *peer))
            .collect();
        for peer in peers {
            self.node_by_id(peer).topology.on_connection_established(id);
            self.nodes[index].topology.on_connection_established(peer);
        }
        self.nodes[index].quorum_events.lock().clear();
        if self.nodes[index].topology.has_quorum() {
            if let Some(engine) = self.nodes[index].engine.as_mut() {
                engine.on_quorum_established();
            }
        }
        self.dispatch_quorum_events();
        self.flush_outbox();
        Ok(())
    }

    /// Advance the clock by one tick
    pub fn step(&mut self) {
        self.ticks += 1;
        let now = self.now();

        self.resolve_connection_requests(now);

        while let Some(entry) = self.in_flight.first_entry() {
            if entry.key().0 > self.ticks {
                break;
            }
            let envelope = entry.remove();
            self.deliver(envelope);
        }

        for node in &mut self.nodes {
            if let Some(engine) = node.engine.as_mut() {
                engine.on_tick(now);
            }
        }
        if self.ticks % self.config.reconcile_every == 0 {
            for node in &self.nodes {
                if node.engine.is_some() {
                    node.topology.reconcile(now);
                }
            }
        }

        self.dispatch_quorum_events();
        self.flush_outbox();
    }

    /// Advance the clock by `ticks` ticks
    pub fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Step until `done` holds; false if `max_ticks` elapse first
    pub fn run_until(&mut self, max_ticks: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Step until every running honest node agrees and nothing is pending
    pub fn run_until_converged(&mut self, max_ticks: u64) -> bool {
        self.run_until(max_ticks, Self::check_consensus)
    }

    /// Whether every running honest node is active, idle and identical
    pub fn check_consensus(&self) -> bool {
        let mut reference: Option<(Phase, Vec<u8>)> = None;
        for node in &self.nodes {
            let Some(engine) = node.engine.as_ref() else {
                continue;
            };
            if node.byzantine {
                continue;
            }
            if engine.mode() != EngineMode::Active || engine.pending_len() > 0 {
                return false;
            }
            let Ok(snapshot) = engine.state_machine().snapshot() else {
                return false;
            };
            let current = (engine.current_phase(), snapshot);
            match &reference {
                None => reference = Some(current),
                Some(expected) if *expected != current => return false,
                Some(_) => {}
            }
        }
        true
    }

    /// Panic unless every running honest node agrees
    pub fn assert_all_nodes_agree(&self) {
        assert!(
            self.check_consensus(),
            "nodes disagree after {} ticks: {:#?}",
            self.ticks,
            self.statuses()
        );
    }

    fn running_mut(&mut self, index: usize) -> Result<&mut SimEngine<S>> {
        let id = self.nodes[index].id;
        self.nodes[index]
            .engine
            .as_mut()
            .ok_or_else(|| RabiaError::node_stopped(&format!("simulated node {id}")))
    }

    fn node_by_id(&self, id: NodeId) -> &SimNode<S> {
        let index = (id.get() - 1) as usize;
        &self.nodes[index]
    }

    fn resolve_connection_requests(&mut self, now: Instant) {
        let requests: Vec<(NodeId, NodeId)> = self.requests.lock().drain(..).collect();
        for (from, to) in requests {
            let up = self.links.read().up(from, to);
            let topology = &self.node_by_id(from).topology;
            if up {
                topology.on_connection_established(to);
            } else {
                topology.on_connection_failed(to, now);
            }
        }
    }

    fn dispatch_quorum_events(&mut self) {
        for node in &mut self.nodes {
            node.leader.refresh();
            let events: Vec<bool> = node.quorum_events.lock().drain(..).collect();
            let Some(engine) = node.engine.as_mut() else {
                continue;
            };
            for present in events {
                if present {
                    engine.on_quorum_established();
                } else {
                    engine.on_quorum_lost();
                }
            }
        }
    }

    fn deliver(&mut self, envelope: Envelope<S::Command>) {
        if !self.links.read().up(envelope.from, envelope.to) {
            self.stats.blocked += 1;
            return;
        }
        let index = (envelope.to.get() - 1) as usize;
        match self.nodes[index].engine.as_mut() {
            Some(engine) => {
                self.stats.delivered += 1;
                engine.handle_message(envelope.message);
            }
            None => self.stats.blocked += 1,
        }
    }

    fn flush_outbox(&mut self) {
        let outgoing: Vec<Outgoing<S::Command>> = self.outbox.lock().drain(..).collect();
        for Outgoing { from, to, message } in outgoing {
            if self.node_by_id(from).byzantine {
                self.stats.byzantine_dropped += 1;
                continue;
            }
            let targets: Vec<NodeId> = match to {
                Some(to) => vec![to],
                None => self.node_ids().into_iter().filter(|id| *id != from).collect(),
            };
            for to in targets {
                if self.rng.gen_bool(self.config.loss_rate) {
                    self.stats.lost += 1;
                    continue;
                }
                self.schedule(from, to, message.clone());
                if self.rng.gen_bool(self.config.duplicate_rate) {
                    self.stats.duplicated += 1;
                    self.schedule(from, to, message.clone());
                }
            }
        }
    }

    fn schedule(&mut self, from: NodeId, to: NodeId, message: ProtocolMessage<S::Command>) {
        let delay = self.rng.gen_range(1..=self.config.max_delay_ticks);
        self.sequence += 1;
        self.in_flight
            .insert((self.ticks + delay, self.sequence), Envelope { from, to, message });
    }
}

impl<S: StateMachine> Drop for SimCluster<S> {
    fn drop(&mut self) {
        debug!(ticks = self.ticks, stats = ?self.stats, "simulated cluster dropped");
    }
}

/// State of a [`LogMachine`]: every applied command, in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedLog {
    /// Applied commands
    pub entries: Vec<String>,
}

/// State machine that records the commit order
///
/// Each command responds with its position in the log, so gaps and
/// duplicate application are directly observable.
#[derive(Debug, Default)]
pub struct LogMachine {
    log: AppliedLog,
}

impl StateMachine for LogMachine {
    type Command = String;
    type Response = usize;
    type State = AppliedLog;

    fn apply(&mut self, commands: &[String]) -> Vec<usize> {
        commands
            .iter()
            .map(|command| {
                self.log.entries.push(command.clone());
                self.log.entries.len() - 1
            })
            .collect()
    }

    fn create_snapshot(&self) -> AppliedLog {
        self.log.clone()
    }

    fn restore_from_snapshot(&mut self, state: AppliedLog) {
        self.log = state;
    }

    fn current_state(&self) -> &AppliedLog {
        &self.log
    }
}
