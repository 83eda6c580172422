//! Cluster membership and peer health
//!
//! [`TopologyManager`] owns the per-node health map. Every transition is
//! applied under the map's per-key lock, and notifications are routed only
//! after the lock is released so that handlers can read the topology back.
//!
//! ```text
//!            failure (< max_attempts)            failure (>= max_attempts)
//! HEALTHY ───────────────────────────▶ SUSPECTED ───────────────────────────▶ DISABLED
//!    ▲                                     │                                      │
//!    └──────────── connection established ─┴──────────────────────────────────────┘
//! ```
//!
//! When the number of disabled nodes reaches the cluster's tolerable failure
//! count, every disabled node is reset to healthy so that a cascade of
//! failures cannot keep the cluster below quorum forever.

pub mod backoff;
pub mod quorum;

use crate::messages::{ClusterEvent, EventKind};
use crate::router::MessageRouter;
use crate::types::{NodeId, NodeInfo};
use backoff::BackoffConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quorum::Quorum;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Requests the transport layer makes on behalf of the topology
///
/// Calls must not block; the outcome is reported back through
/// [`TopologyManager::on_connection_established`] and
/// [`TopologyManager::on_connection_failed`].
pub trait ConnectionControl: Send + Sync {
    /// Start connecting to a peer
    fn connect(&self, node: &NodeInfo);
    /// Close the connection to a peer
    fn disconnect(&self, node: NodeId);
    /// Peers currently connected
    fn connected_nodes(&self) -> Vec<NodeId>;
}

/// Health of a member as seen from the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeHealth {
    /// Reachable, or not yet known to be unreachable
    Healthy,
    /// Recent connection failures; retried after backoff
    Suspected,
    /// Reconnection attempts exhausted
    Disabled,
}

/// Per-member record owned by the topology manager
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Static member description
    pub info: NodeInfo,
    /// Current health
    pub health: NodeHealth,
    /// Consecutive failed connection attempts
    pub failed_attempts: u32,
    /// Time of the last connection attempt or failure
    pub last_attempt: Option<Instant>,
    /// Earliest time of the next reconnection attempt
    pub next_attempt_after: Option<Instant>,
    /// Whether the transport currently reports a live connection
    pub connected: bool,
}

impl NodeState {
    fn new(info: NodeInfo, connected: bool) -> Self {
        Self {
            info,
            health: NodeHealth::Healthy,
            failed_attempts: 0,
            last_attempt: None,
            next_attempt_after: None,
            connected,
        }
    }

    fn retry_due(&self, now: Instant) -> bool {
        self.health != NodeHealth::Disabled
            && !self.connected
            && self.next_attempt_after.map_or(true, |at| at <= now)
    }
}

/// Tracks membership, health and reachability of the cluster
pub struct TopologyManager {
    self_id: NodeId,
    nodes: DashMap<NodeId, NodeState>,
    backoff: BackoffConfig,
    control: Arc<dyn ConnectionControl>,
    router: Arc<MessageRouter<ClusterEvent>>,
    quorum_present: AtomicBool,
}

impl TopologyManager {
    /// Create a manager whose topology initially holds only the local node
    pub fn new(
        self_info: NodeInfo,
        backoff: BackoffConfig,
        control: Arc<dyn ConnectionControl>,
        router: Arc<MessageRouter<ClusterEvent>>,
    ) -> Self {
        let self_id = self_info.id;
        let nodes = DashMap::new();
        nodes.insert(self_id, NodeState::new(self_info, true));
        Self {
            self_id,
            nodes,
            backoff,
            control,
            router,
            quorum_present: AtomicBool::new(false),
        }
    }

    /// Register routes for admin commands and network callbacks
    ///
    /// Handlers stamp events with `Instant::now()`; callers that need a
    /// controlled clock use the `on_*` methods directly.
    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.router.add_routes(
            &[
                EventKind::AddNode,
                EventKind::RemoveNode,
                EventKind::ConnectionEstablished,
                EventKind::ConnectionFailed,
                EventKind::ConnectedNodesList,
            ],
            move |event| {
                if let Some(topology) = weak.upgrade() {
                    topology.handle_event(event, Instant::now());
                }
            },
        );
    }

    /// Apply an admin or network event
    pub fn handle_event(&self, event: &ClusterEvent, now: Instant) {
        match event {
            ClusterEvent::AddNode(info) => {
                self.add_node(info.clone());
            }
            ClusterEvent::RemoveNode(id) => {
                self.remove_node(*id);
            }
            ClusterEvent::ConnectionEstablished(id) => self.on_connection_established(*id),
            ClusterEvent::ConnectionFailed(id) => self.on_connection_failed(*id, now),
            ClusterEvent::ConnectedNodesList(ids) => self.on_connected_nodes_list(ids, now),
            other => trace!(kind = ?other, "topology ignores event"),
        }
    }

    /// Local node id
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Add a member; returns false if it was already present
    ///
    /// The connection is requested exactly once, by the call that inserted
    /// the member.
    pub fn add_node(&self, info: NodeInfo) -> bool {
        let id = info.id;
        match self.nodes.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(NodeState::new(info.clone(), id == self.self_id));
            }
        }
        if id != self.self_id {
            self.control.connect(&info);
        }
        info!(node = %id, size = self.cluster_size(), "node added to topology");
        self.publish(ClusterEvent::NodeAdded(id));
        self.evaluate_quorum();
        true
    }

    /// Remove a member; returns false if it was not present
    pub fn remove_node(&self, id: NodeId) -> bool {
        if id == self.self_id {
            warn!(node = %id, "refusing to remove the local node from its own topology");
            return false;
        }
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        self.control.disconnect(id);
        info!(node = %id, size = self.cluster_size(), "node removed from topology");
        self.publish(ClusterEvent::NodeRemoved(id));
        self.evaluate_quorum();
        true
    }

    /// Static description of a member
    pub fn get(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.get(&id).map(|state| state.info.clone())
    }

    /// Health record of a member
    pub fn get_state(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.get(&id).map(|state| state.clone())
    }

    /// All member ids, sorted
    pub fn topology(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Number of members
    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    /// Quorum thresholds for the current membership
    pub fn quorum(&self) -> Quorum {
        Quorum::new(self.cluster_size())
    }

    /// Members that are not disabled, sorted
    pub fn active_topology(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|entry| entry.health != NodeHealth::Disabled)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Members that are connected and not disabled, sorted
    ///
    /// The local node is always connected to itself.
    pub fn connected_topology(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|entry| entry.connected && entry.health != NodeHealth::Disabled)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Whether a quorum of members is currently reachable
    pub fn has_quorum(&self) -> bool {
        self.quorum_present.load(Ordering::Acquire)
    }

    /// Transport reports a live connection to `id`
    pub fn on_connection_established(&self, id: NodeId) {
        let reactivated = match self.nodes.get_mut(&id) {
            Some(mut state) => {
                let was_disabled = state.health == NodeHealth::Disabled;
                state.health = NodeHealth::Healthy;
                state.failed_attempts = 0;
                state.next_attempt_after = None;
                state.connected = true;
                was_disabled
            }
            None => {
                trace!(node = %id, "connection from non-member ignored");
                return;
            }
        };
        debug!(node = %id, "connection established");
        if reactivated {
            info!(node = %id, "disabled node reactivated");
            self.publish(ClusterEvent::NodeReactivated(id));
        }
        self.evaluate_quorum();
    }

    /// Transport reports a failed attempt or a dropped link to `id`
    pub fn on_connection_failed(&self, id: NodeId, now: Instant) {
        if id == self.self_id {
            return;
        }
        let disabled = match self.nodes.get_mut(&id) {
            Some(mut state) => {
                state.connected = false;
                state.failed_attempts = state.failed_attempts.saturating_add(1);
                state.last_attempt = Some(now);
                if self.backoff.should_disable(state.failed_attempts) {
                    state.next_attempt_after = None;
                    let newly = state.health != NodeHealth::Disabled;
                    state.health = NodeHealth::Disabled;
                    newly
                } else {
                    let delay = self.backoff.strategy.next_timeout(state.failed_attempts);
                    state.health = NodeHealth::Suspected;
                    state.next_attempt_after = Some(now + delay);
                    debug!(
                        node = %id,
                        attempts = state.failed_attempts,
                        retry_in = ?delay,
                        "connection failed, node suspected"
                    );
                    false
                }
            }
            None => return,
        };

        if disabled {
            warn!(node = %id, "node disabled after exhausting reconnection attempts");
            self.publish(ClusterEvent::NodeDisabled(id));
            self.apply_liveness_guard();
        }
        self.evaluate_quorum();
    }

    /// Transport reports its current connections
    ///
    /// Members missing from the list are reconnected when their backoff
    /// allows it.
    pub fn on_connected_nodes_list(&self, connected: &[NodeId], now: Instant) {
        for id in connected {
            let newly_connected = self
                .nodes
                .get(id)
                .map_or(false, |state| !state.connected);
            if newly_connected {
                self.on_connection_established(*id);
            }
        }

        let mut to_connect = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            if *entry.key() == self.self_id {
                continue;
            }
            if !connected.contains(entry.key()) {
                entry.connected = false;
            }
            if entry.retry_due(now) {
                entry.last_attempt = Some(now);
                to_connect.push(entry.info.clone());
            }
        }

        for info in &to_connect {
            debug!(node = %info.id, "reconnecting to member");
            self.control.connect(info);
        }
        self.evaluate_quorum();
    }

    /// Periodic reconciliation against the transport's connection list
    pub fn reconcile(&self, now: Instant) {
        let connected = self.control.connected_nodes();
        self.on_connected_nodes_list(&connected, now);
    }

    fn apply_liveness_guard(&self) {
        let max_failures = self.quorum().max_failures();
        let disabled: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|entry| entry.health == NodeHealth::Disabled)
            .map(|entry| *entry.key())
            .collect();
        if disabled.is_empty() || disabled.len() < max_failures {
            return;
        }

        for id in &disabled {
            if let Some(mut state) = self.nodes.get_mut(id) {
                state.health = NodeHealth::Healthy;
                state.failed_attempts = 0;
                state.next_attempt_after = None;
            }
        }
        let mut reset = disabled;
        reset.sort();
        warn!(nodes = ?reset, "disabled node count reached failure tolerance, resetting all");
        self.publish(ClusterEvent::AllNodesReset(reset));
    }

    fn evaluate_quorum(&self) {
        let reachable = self.nodes.iter().filter(|entry| entry.connected).count();
        let present = self.quorum().is_quorum(reachable);
        let previous = self.quorum_present.swap(present, Ordering::AcqRel);
        if previous == present {
            return;
        }
        if present {
            info!(reachable, size = self.cluster_size(), "quorum established");
            self.publish(ClusterEvent::QuorumEstablished);
        } else {
            warn!(reachable, size = self.cluster_size(), "quorum lost");
            self.publish(ClusterEvent::QuorumDisappeared);
        }
    }

    fn publish(&self, event: ClusterEvent) {
        self.router.route(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::BackoffStrategy;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingControl {
        connects: Mutex<Vec<NodeId>>,
        disconnects: Mutex<Vec<NodeId>>,
        connected: Mutex<Vec<NodeId>>,
    }

    impl ConnectionControl for RecordingControl {
        fn connect(&self, node: &NodeInfo) {
            self.connects.lock().push(node.id);
        }
        fn disconnect(&self, node: NodeId) {
            self.disconnects.lock().push(node);
        }
        fn connected_nodes(&self) -> Vec<NodeId> {
            self.connected.lock().clone()
        }
    }

    struct Fixture {
        topology: Arc<TopologyManager>,
        control: Arc<RecordingControl>,
        events: Arc<Mutex<Vec<ClusterEvent>>>,
    }

    fn fixture(members: u64, max_attempts: u32) -> Fixture {
        let control = Arc::new(RecordingControl::default());
        let router = Arc::new(MessageRouter::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        router.add_routes(
            &[
                EventKind::NodeAdded,
                EventKind::NodeRemoved,
                EventKind::NodeDisabled,
                EventKind::NodeReactivated,
                EventKind::AllNodesReset,
                EventKind::QuorumEstablished,
                EventKind::QuorumDisappeared,
            ],
            move |event: &ClusterEvent| sink.lock().push(event.clone()),
        );
        let backoff = BackoffConfig::new(
            max_attempts,
            BackoffStrategy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                factor: 2.0,
                jitter: 0.0,
            },
        )
        .unwrap();
        let topology = Arc::new(TopologyManager::new(
            NodeInfo::new(1, "local"),
            backoff,
            control.clone(),
            router,
        ));
        for id in 2..=members {
            topology.add_node(NodeInfo::new(id, format!("peer-{id}")));
        }
        events.lock().clear();
        Fixture {
            topology,
            control,
            events,
        }
    }

    #[test]
    fn test_add_remove_idempotent() {
        let f = fixture(3, 3);
        assert_eq!(*f.control.connects.lock(), vec![NodeId::new(2), NodeId::new(3)]);

        assert!(!f.topology.add_node(NodeInfo::new(2, "again")));
        assert_eq!(f.control.connects.lock().len(), 2);

        assert!(f.topology.remove_node(NodeId::new(3)));
        assert!(!f.topology.remove_node(NodeId::new(3)));
        assert_eq!(*f.control.disconnects.lock(), vec![NodeId::new(3)]);
        assert_eq!(f.topology.topology(), vec![NodeId::new(1), NodeId::new(2)]);
        assert_eq!(*f.events.lock(), vec![ClusterEvent::NodeRemoved(NodeId::new(3))]);
    }

    #[test]
    fn test_failure_backoff_then_disable() {
        let f = fixture(5, 3);
        let now = Instant::now();
        let peer = NodeId::new(4);

        f.topology.on_connection_failed(peer, now);
        let state = f.topology.get_state(peer).unwrap();
        assert_eq!(state.health, NodeHealth::Suspected);
        assert_eq!(state.failed_attempts, 1);
        assert_eq!(state.next_attempt_after, Some(now + Duration::from_millis(100)));

        f.topology.on_connection_failed(peer, now);
        assert_eq!(
            f.topology.get_state(peer).unwrap().next_attempt_after,
            Some(now + Duration::from_millis(200))
        );

        f.topology.on_connection_failed(peer, now);
        assert_eq!(f.topology.get_state(peer).unwrap().health, NodeHealth::Disabled);
        assert!(f.events.lock().contains(&ClusterEvent::NodeDisabled(peer)));
        assert!(!f.topology.active_topology().contains(&peer));

        f.topology.on_connection_established(peer);
        assert_eq!(f.topology.get_state(peer).unwrap().health, NodeHealth::Healthy);
        assert!(f.events.lock().contains(&ClusterEvent::NodeReactivated(peer)));
    }

    #[test]
    fn test_liveness_guard_resets_all_disabled() {
        let f = fixture(5, 1);
        let now = Instant::now();

        f.topology.on_connection_failed(NodeId::new(2), now);
        assert_eq!(f.topology.active_topology().len(), 4);

        f.topology.on_connection_failed(NodeId::new(3), now);
        let events = f.events.lock().clone();
        assert!(events.contains(&ClusterEvent::AllNodesReset(vec![NodeId::new(2), NodeId::new(3)])));
        assert_eq!(f.topology.active_topology().len(), 5);
        for id in f.topology.topology() {
            assert_ne!(f.topology.get_state(id).unwrap().health, NodeHealth::Disabled);
        }
    }

    #[test]
    fn test_quorum_transitions() {
        let f = fixture(3, 5);
        assert!(!f.topology.has_quorum());

        f.topology.on_connection_established(NodeId::new(2));
        assert!(f.topology.has_quorum());
        assert_eq!(*f.events.lock(), vec![ClusterEvent::QuorumEstablished]);

        f.topology.on_connection_failed(NodeId::new(2), Instant::now());
        assert!(!f.topology.has_quorum());
        assert_eq!(f.events.lock().last(), Some(&ClusterEvent::QuorumDisappeared));
    }

    #[test]
    fn test_connected_topology_excludes_suspected() {
        let f = fixture(3, 5);
        f.topology.on_connection_established(NodeId::new(2));
        f.topology.on_connection_established(NodeId::new(3));
        assert_eq!(f.topology.connected_topology().len(), 3);

        f.topology.on_connection_failed(NodeId::new(2), Instant::now());
        assert_eq!(
            f.topology.get_state(NodeId::new(2)).unwrap().health,
            NodeHealth::Suspected
        );
        assert!(f.topology.active_topology().contains(&NodeId::new(2)));
        assert_eq!(
            f.topology.connected_topology(),
            vec![NodeId::new(1), NodeId::new(3)]
        );
    }

    #[test]
    fn test_reconcile_respects_backoff() {
        let f = fixture(3, 5);
        let start = Instant::now();
        f.control.connects.lock().clear();
        *f.control.connected.lock() = vec![NodeId::new(2)];

        f.topology.on_connection_failed(NodeId::new(3), start);
        f.topology.reconcile(start);
        assert!(f.control.connects.lock().is_empty());
        assert!(f.topology.get_state(NodeId::new(2)).unwrap().connected);

        f.topology.reconcile(start + Duration::from_millis(150));
        assert_eq!(*f.control.connects.lock(), vec![NodeId::new(3)]);
    }
}
