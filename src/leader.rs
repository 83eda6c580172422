//! Deterministic leader designation
//!
//! The leader is the smallest id among members that are connected and not
//! disabled, and only exists while the topology reports quorum. Suspected
//! members are skipped until their connection comes back. It is recomputed
//! from the topology on every membership, connection or quorum event; the
//! last emitted value is remembered
//! solely to suppress duplicate [`ClusterEvent::LeaderChanged`]
//! notifications. The leader carries no consensus role.

use crate::messages::{ClusterEvent, EventKind};
use crate::router::MessageRouter;
use crate::topology::TopologyManager;
use crate::types::NodeId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::info;

const TRIGGERS: &[EventKind] = &[
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
];

/// Reactive leader tracker
pub struct LeaderManager {
    topology: Arc<TopologyManager>,
    router: Arc<MessageRouter<ClusterEvent>>,
    announced: Mutex<Option<NodeId>>,
}

impl LeaderManager {
    /// Create a manager and subscribe it to topology events
    ///
    /// Must run after [`TopologyManager::attach`] so that connection events
    /// reach the topology before the leader is recomputed.
    pub fn attach(
        topology: Arc<TopologyManager>,
        router: Arc<MessageRouter<ClusterEvent>>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            topology,
            router: router.clone(),
            announced: Mutex::new(None),
        });
        let weak: Weak<Self> = Arc::downgrade(&manager);
        router.add_routes(TRIGGERS, move |_| {
            if let Some(manager) = weak.upgrade() {
                manager.refresh();
            }
        });
        manager
    }

    /// Current leader, `None` without quorum
    pub fn leader(&self) -> Option<NodeId> {
        compute_leader(
            self.topology.has_quorum(),
            &self.topology.connected_topology(),
        )
    }

    /// Whether the local node is the current leader
    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.topology.self_id())
    }

    /// Recompute and announce the leader if it changed
    pub fn refresh(&self) {
        let leader = self.leader();
        {
            let mut announced = self.announced.lock();
            if *announced == leader {
                return;
            }
            *announced = leader;
        }
        let is_local = leader == Some(self.topology.self_id());
        match leader {
            Some(id) => info!(leader = %id, is_local, "leader changed"),
            None => info!("leader absent"),
        }
        self.router
            .route(&ClusterEvent::LeaderChanged { leader, is_local });
    }
}

/// Smallest id of `connected`, when quorum is present
pub fn compute_leader(has_quorum: bool, connected: &[NodeId]) -> Option<NodeId> {
    if !has_quorum {
        return None;
    }
    connected.iter().min().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::backoff::BackoffConfig;
    use crate::topology::ConnectionControl;
    use crate::types::NodeInfo;

    struct NoopControl;

    impl ConnectionControl for NoopControl {
        fn connect(&self, _: &NodeInfo) {}
        fn disconnect(&self, _: NodeId) {}
        fn connected_nodes(&self) -> Vec<NodeId> {
            Vec::new()
        }
    }

    fn setup(
        self_id: u64,
        members: &[u64],
    ) -> (
        Arc<TopologyManager>,
        Arc<LeaderManager>,
        Arc<Mutex<Vec<Option<NodeId>>>>,
    ) {
        let router = Arc::new(MessageRouter::new());
        let topology = Arc::new(TopologyManager::new(
            NodeInfo::new(self_id, "local"),
            BackoffConfig::default(),
            Arc::new(NoopControl),
            router.clone(),
        ));
        topology.attach();
        let leader = LeaderManager::attach(topology.clone(), router.clone());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        router.add_route(EventKind::LeaderChanged, move |event: &ClusterEvent| {
            if let ClusterEvent::LeaderChanged { leader, .. } = event {
                sink.lock().push(*leader);
            }
        });
        for id in members {
            topology.add_node(NodeInfo::new(*id, format!("n{id}")));
        }
        (topology, leader, changes)
    }

    #[test]
    fn test_compute_leader_is_minimum() {
        let ids = [NodeId::new(7), NodeId::new(3), NodeId::new(9)];
        assert_eq!(compute_leader(true, &ids), Some(NodeId::new(3)));
        assert_eq!(compute_leader(false, &ids), None);
        assert_eq!(compute_leader(true, &[]), None);
    }

    #[test]
    fn test_leader_follows_quorum_and_membership() {
        let (topology, leader, changes) = setup(2, &[1, 3]);
        assert_eq!(leader.leader(), None);

        topology.on_connection_established(NodeId::new(1));
        assert_eq!(leader.leader(), Some(NodeId::new(1)));
        assert!(!leader.is_leader());

        // Removing the leader hands over to the next smallest id
        topology.on_connection_established(NodeId::new(3));
        topology.remove_node(NodeId::new(1));
        assert_eq!(leader.leader(), Some(NodeId::new(2)));
        assert!(leader.is_leader());

        assert_eq!(
            *changes.lock(),
            vec![Some(NodeId::new(1)), Some(NodeId::new(2))]
        );
    }

    #[test]
    fn test_no_leader_without_quorum_regardless_of_membership() {
        let (topology, leader, changes) = setup(1, &[2, 3]);
        topology.on_connection_established(NodeId::new(2));
        assert_eq!(leader.leader(), Some(NodeId::new(1)));

        topology.on_connection_failed(NodeId::new(2), std::time::Instant::now());
        assert_eq!(leader.leader(), None);

        topology.add_node(NodeInfo::new(0, "n0"));
        assert_eq!(leader.leader(), None);
        assert_eq!(changes.lock().last(), Some(&None));
    }

    #[test]
    fn test_unreachable_minimum_is_not_leader() {
        let (topology, leader, _) = setup(3, &[1, 2, 4, 5]);
        for id in [1, 2, 4, 5] {
            topology.on_connection_established(NodeId::new(id));
        }
        assert_eq!(leader.leader(), Some(NodeId::new(1)));

        // Cut off 1 and 2; they stay members but are only suspected
        let now = std::time::Instant::now();
        topology.on_connection_failed(NodeId::new(1), now);
        topology.on_connection_failed(NodeId::new(2), now);
        assert!(topology.active_topology().contains(&NodeId::new(1)));
        assert!(topology.has_quorum());
        assert_eq!(leader.leader(), Some(NodeId::new(3)));
        assert!(leader.is_leader());

        topology.on_connection_established(NodeId::new(1));
        assert_eq!(leader.leader(), Some(NodeId::new(1)));
    }

    #[test]
    fn test_connection_events_refresh_leader() {
        let (_topology, leader, changes) = setup(2, &[1, 3]);
        let router = leader.router.clone();
        router.route(&ClusterEvent::ConnectionEstablished(NodeId::new(3)));
        router.route(&ClusterEvent::ConnectionEstablished(NodeId::new(1)));
        assert_eq!(changes.lock().last(), Some(&Some(NodeId::new(1))));

        router.route(&ClusterEvent::ConnectionFailed(NodeId::new(1)));
        assert_eq!(changes.lock().last(), Some(&Some(NodeId::new(2))));
        assert!(leader.is_leader());
    }
}
