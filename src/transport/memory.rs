//! In-process transport
//!
//! [`MemoryHub`] connects nodes living in one process through unbounded
//! channels. Links can be cut and restored to model partitions; every
//! change is reported to the affected nodes' routers as
//! [`ClusterEvent::ConnectionFailed`] or
//! [`ClusterEvent::ConnectionEstablished`], exactly as a network transport
//! would report it.

use super::ClusterNetwork;
use crate::messages::{ClusterEvent, ProtocolMessage};
use crate::router::MessageRouter;
use crate::topology::ConnectionControl;
use crate::types::{NodeId, NodeInfo};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace};

struct Endpoint<C> {
    inbox: UnboundedSender<ProtocolMessage<C>>,
    router: Weak<MessageRouter<ClusterEvent>>,
}

/// Shared switchboard of the in-process cluster
pub struct MemoryHub<C> {
    endpoints: DashMap<NodeId, Endpoint<C>>,
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

impl<C: Clone + Send + 'static> MemoryHub<C> {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            blocked: RwLock::new(HashSet::new()),
        })
    }

    /// Attach a node; returns its network handle and inbox
    ///
    /// Peers already on the hub learn that the new node is reachable.
    pub fn join(
        self: &Arc<Self>,
        node_id: NodeId,
        router: &Arc<MessageRouter<ClusterEvent>>,
    ) -> (MemoryNetwork<C>, UnboundedReceiver<ProtocolMessage<C>>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(
            node_id,
            Endpoint {
                inbox,
                router: Arc::downgrade(router),
            },
        );
        info!(node = %node_id, "joined in-memory hub");
        for peer in self.peers_of(node_id) {
            if self.linked(node_id, peer) {
                self.notify(peer, ClusterEvent::ConnectionEstablished(node_id));
            }
        }
        (
            MemoryNetwork {
                node_id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Detach a node; its peers see the link fail
    pub fn leave(&self, node_id: NodeId) {
        if self.endpoints.remove(&node_id).is_none() {
            return;
        }
        info!(node = %node_id, "left in-memory hub");
        for peer in self.peers_of(node_id) {
            self.notify(peer, ClusterEvent::ConnectionFailed(node_id));
        }
    }

    /// Cut every link between nodes of different groups
    ///
    /// Nodes not named in any group keep all of their links.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut cut = Vec::new();
        {
            let mut blocked = self.blocked.write();
            for (i, left) in groups.iter().enumerate() {
                for right in &groups[i + 1..] {
                    for a in left.iter() {
                        for b in right.iter() {
                            if a != b && blocked.insert(link(*a, *b)) {
                                cut.push((*a, *b));
                            }
                        }
                    }
                }
            }
        }
        info!(links = cut.len(), "partition applied");
        for (a, b) in cut {
            self.notify(a, ClusterEvent::ConnectionFailed(b));
            self.notify(b, ClusterEvent::ConnectionFailed(a));
        }
    }

    /// Cut every link of one node
    pub fn isolate(&self, node_id: NodeId) {
        let others = self.peers_of(node_id);
        self.partition(&[std::slice::from_ref(&node_id), others.as_slice()]);
    }

    /// Restore every link
    pub fn heal(&self) {
        let restored: Vec<(NodeId, NodeId)> = self.blocked.write().drain().collect();
        info!(links = restored.len(), "partition healed");
        for (a, b) in restored {
            if self.endpoints.contains_key(&a) && self.endpoints.contains_key(&b) {
                self.notify(a, ClusterEvent::ConnectionEstablished(b));
                self.notify(b, ClusterEvent::ConnectionEstablished(a));
            }
        }
    }

    /// Whether messages flow between two nodes
    pub fn linked(&self, a: NodeId, b: NodeId) -> bool {
        !self.blocked.read().contains(&link(a, b))
    }

    fn peers_of(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .endpoints
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| *id != node_id)
            .collect();
        peers.sort();
        peers
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: ProtocolMessage<C>) {
        if !self.linked(from, to) {
            trace!(%from, %to, "link cut, message dropped");
            return;
        }
        let inbox = match self.endpoints.get(&to) {
            Some(endpoint) => endpoint.inbox.clone(),
            None => {
                trace!(%from, %to, "unknown destination, message dropped");
                return;
            }
        };
        if inbox.send(message).is_err() {
            debug!(%from, %to, "destination inbox closed");
        }
    }

    fn notify(&self, at: NodeId, event: ClusterEvent) {
        let router = self.endpoints.get(&at).and_then(|e| e.router.upgrade());
        if let Some(router) = router {
            router.route(&event);
        }
    }
}

/// One node's handle on a [`MemoryHub`]
pub struct MemoryNetwork<C> {
    node_id: NodeId,
    hub: Arc<MemoryHub<C>>,
}

impl<C> Clone for MemoryNetwork<C> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id,
            hub: self.hub.clone(),
        }
    }
}

impl<C: Clone + Send + 'static> MemoryNetwork<C> {
    /// Local node id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The shared hub
    pub fn hub(&self) -> &Arc<MemoryHub<C>> {
        &self.hub
    }
}

impl<C: Clone + Send + 'static> ClusterNetwork<C> for MemoryNetwork<C> {
    fn send(&self, to: NodeId, message: ProtocolMessage<C>) {
        self.hub.deliver(self.node_id, to, message);
    }

    fn broadcast(&self, message: ProtocolMessage<C>) {
        for peer in self.hub.peers_of(self.node_id) {
            self.hub.deliver(self.node_id, peer, message.clone());
        }
    }
}

impl<C: Clone + Send + 'static> ConnectionControl for MemoryNetwork<C> {
    fn connect(&self, node: &NodeInfo) {
        let reachable =
            self.hub.endpoints.contains_key(&node.id) && self.hub.linked(self.node_id, node.id);
        let event = if reachable {
            ClusterEvent::ConnectionEstablished(node.id)
        } else {
            ClusterEvent::ConnectionFailed(node.id)
        };
        self.hub.notify(self.node_id, event);
    }

    fn disconnect(&self, node: NodeId) {
        trace!(local = %self.node_id, peer = %node, "in-memory links close implicitly");
    }

    fn connected_nodes(&self) -> Vec<NodeId> {
        self.hub
            .peers_of(self.node_id)
            .into_iter()
            .filter(|peer| self.hub.linked(self.node_id, *peer))
            .collect()
    }
}
