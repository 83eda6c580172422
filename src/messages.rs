//! Message families
//!
//! Two closed families flow through the crate:
//!
//! - [`ProtocolMessage`]: what nodes exchange over the transport while
//!   running the phase protocol and snapshot sync.
//! - [`ClusterEvent`]: in-process notifications dispatched by the
//!   [`MessageRouter`](crate::router::MessageRouter) between the network
//!   boundary, admin commands, topology, leader tracking and the engine.
//!
//! Each family has a tag enum listing every variant so wiring code can check
//! that no variant is left without a handler.

use crate::batch::Batch;
use crate::router::{Routable, SealedFamily};
use crate::storage::SavedState;
use crate::types::{NodeId, NodeInfo, Phase};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ternary vote alphabet of randomized binary consensus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    /// Do not commit a batch in this phase
    V0,
    /// Commit the phase's majority batch
    V1,
    /// Undecided
    VQuestion,
}

impl StateValue {
    pub(crate) fn index(self) -> usize {
        match self {
            StateValue::V0 => 0,
            StateValue::V1 => 1,
            StateValue::VQuestion => 2,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::V0 => write!(f, "V0"),
            StateValue::V1 => write!(f, "V1"),
            StateValue::VQuestion => write!(f, "V?"),
        }
    }
}

/// Messages exchanged between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolMessage<C> {
    /// Disseminates a freshly submitted batch to every pending queue
    NewBatch {
        /// Originating node
        sender: NodeId,
        /// The batch
        batch: Batch<C>,
    },
    /// The sender's candidate for a phase
    Propose {
        /// Proposing node
        sender: NodeId,
        /// Target phase
        phase: Phase,
        /// Candidate batch, possibly the empty sentinel
        batch: Batch<C>,
    },
    /// First-round vote of an iteration
    VoteRound1 {
        /// Voting node
        sender: NodeId,
        /// Target phase
        phase: Phase,
        /// Iteration within the phase
        iteration: u32,
        /// Vote
        value: StateValue,
        /// Majority batch, present for V1
        batch: Option<Batch<C>>,
    },
    /// Second-round vote of an iteration
    VoteRound2 {
        /// Voting node
        sender: NodeId,
        /// Target phase
        phase: Phase,
        /// Iteration within the phase
        iteration: u32,
        /// Vote
        value: StateValue,
        /// Majority batch, present for V1
        batch: Option<Batch<C>>,
    },
    /// Outcome of a phase
    Decision {
        /// Node that announces the outcome
        sender: NodeId,
        /// Decided phase
        phase: Phase,
        /// V1 commits `batch`, V0 commits nothing
        value: StateValue,
        /// Committed batch, the empty sentinel for V0
        batch: Batch<C>,
    },
    /// Asks peers for their latest checkpoint
    SyncRequest {
        /// Lagging node
        sender: NodeId,
    },
    /// Answer to a [`ProtocolMessage::SyncRequest`]
    SyncResponse {
        /// Responding node
        sender: NodeId,
        /// Responder's current checkpoint
        state: SavedState<C>,
    },
}

/// Tag of a [`ProtocolMessage`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// [`ProtocolMessage::NewBatch`]
    NewBatch,
    /// [`ProtocolMessage::Propose`]
    Propose,
    /// [`ProtocolMessage::VoteRound1`]
    VoteRound1,
    /// [`ProtocolMessage::VoteRound2`]
    VoteRound2,
    /// [`ProtocolMessage::Decision`]
    Decision,
    /// [`ProtocolMessage::SyncRequest`]
    SyncRequest,
    /// [`ProtocolMessage::SyncResponse`]
    SyncResponse,
}

impl<C> ProtocolMessage<C> {
    /// Node that sent the message
    pub fn sender(&self) -> NodeId {
        match self {
            ProtocolMessage::NewBatch { sender, .. }
            | ProtocolMessage::Propose { sender, .. }
            | ProtocolMessage::VoteRound1 { sender, .. }
            | ProtocolMessage::VoteRound2 { sender, .. }
            | ProtocolMessage::Decision { sender, .. }
            | ProtocolMessage::SyncRequest { sender }
            | ProtocolMessage::SyncResponse { sender, .. } => *sender,
        }
    }

    /// Phase the message refers to, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            ProtocolMessage::Propose { phase, .. }
            | ProtocolMessage::VoteRound1 { phase, .. }
            | ProtocolMessage::VoteRound2 { phase, .. }
            | ProtocolMessage::Decision { phase, .. } => Some(*phase),
            ProtocolMessage::NewBatch { .. }
            | ProtocolMessage::SyncRequest { .. }
            | ProtocolMessage::SyncResponse { .. } => None,
        }
    }
}

impl<C> Routable for ProtocolMessage<C> {
    type Kind = ProtocolKind;

    fn kind(&self) -> ProtocolKind {
        match self {
            ProtocolMessage::NewBatch { .. } => ProtocolKind::NewBatch,
            ProtocolMessage::Propose { .. } => ProtocolKind::Propose,
            ProtocolMessage::VoteRound1 { .. } => ProtocolKind::VoteRound1,
            ProtocolMessage::VoteRound2 { .. } => ProtocolKind::VoteRound2,
            ProtocolMessage::Decision { .. } => ProtocolKind::Decision,
            ProtocolMessage::SyncRequest { .. } => ProtocolKind::SyncRequest,
            ProtocolMessage::SyncResponse { .. } => ProtocolKind::SyncResponse,
        }
    }
}

impl<C> SealedFamily for ProtocolMessage<C> {
    fn variants() -> &'static [ProtocolKind] {
        &[
            ProtocolKind::NewBatch,
            ProtocolKind::Propose,
            ProtocolKind::VoteRound1,
            ProtocolKind::VoteRound2,
            ProtocolKind::Decision,
            ProtocolKind::SyncRequest,
            ProtocolKind::SyncResponse,
        ]
    }
}

/// In-process notifications between cluster components
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    // === Admin commands ===
    /// Add a member to the topology
    AddNode(NodeInfo),
    /// Remove a member from the topology
    RemoveNode(NodeId),

    // === Network boundary ===
    /// A connection to the peer is up
    ConnectionEstablished(NodeId),
    /// A connection attempt to the peer failed or the link dropped
    ConnectionFailed(NodeId),
    /// Peers the transport currently holds connections to
    ConnectedNodesList(Vec<NodeId>),

    // === Topology notifications ===
    /// A member joined the topology
    NodeAdded(NodeId),
    /// A member left the topology
    NodeRemoved(NodeId),
    /// A member exhausted its reconnection attempts
    NodeDisabled(NodeId),
    /// A disabled member connected again
    NodeReactivated(NodeId),
    /// Liveness guard re-enabled every disabled member
    AllNodesReset(Vec<NodeId>),

    // === Quorum and leadership ===
    /// Enough members are reachable to decide phases
    QuorumEstablished,
    /// Too few members are reachable to decide phases
    QuorumDisappeared,
    /// The designated leader changed
    LeaderChanged {
        /// New leader, `None` while quorum is absent
        leader: Option<NodeId>,
        /// Whether the local node is the leader
        is_local: bool,
    },
}

/// Tag of a [`ClusterEvent`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventKind {
    AddNode,
    RemoveNode,
    ConnectionEstablished,
    ConnectionFailed,
    ConnectedNodesList,
    NodeAdded,
    NodeRemoved,
    NodeDisabled,
    NodeReactivated,
    AllNodesReset,
    QuorumEstablished,
    QuorumDisappeared,
    LeaderChanged,
}

impl Routable for ClusterEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            ClusterEvent::AddNode(_) => EventKind::AddNode,
            ClusterEvent::RemoveNode(_) => EventKind::RemoveNode,
            ClusterEvent::ConnectionEstablished(_) => EventKind::ConnectionEstablished,
            ClusterEvent::ConnectionFailed(_) => EventKind::ConnectionFailed,
            ClusterEvent::ConnectedNodesList(_) => EventKind::ConnectedNodesList,
            ClusterEvent::NodeAdded(_) => EventKind::NodeAdded,
            ClusterEvent::NodeRemoved(_) => EventKind::NodeRemoved,
            ClusterEvent::NodeDisabled(_) => EventKind::NodeDisabled,
            ClusterEvent::NodeReactivated(_) => EventKind::NodeReactivated,
            ClusterEvent::AllNodesReset(_) => EventKind::AllNodesReset,
            ClusterEvent::QuorumEstablished => EventKind::QuorumEstablished,
            ClusterEvent::QuorumDisappeared => EventKind::QuorumDisappeared,
            ClusterEvent::LeaderChanged { .. } => EventKind::LeaderChanged,
        }
    }
}

impl SealedFamily for ClusterEvent {
    fn variants() -> &'static [EventKind] {
        &[
            EventKind::AddNode,
            EventKind::RemoveNode,
            EventKind::ConnectionEstablished,
            EventKind::ConnectionFailed,
            EventKind::ConnectedNodesList,
            EventKind::NodeAdded,
            EventKind::NodeRemoved,
            EventKind::NodeDisabled,
            EventKind::NodeReactivated,
            EventKind::AllNodesReset,
            EventKind::QuorumEstablished,
            EventKind::QuorumDisappeared,
            EventKind::LeaderChanged,
        ]
    }
}
