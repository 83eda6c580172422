//! Network boundary of the engine
//!
//! The engine hands outgoing messages to a [`ClusterNetwork`] and never
//! waits on a peer. Implementations may lose, delay, duplicate or reorder
//! messages; the protocol recovers through retransmission and sync.

pub mod memory;

pub use memory::{MemoryHub, MemoryNetwork};

use crate::messages::ProtocolMessage;
use crate::types::NodeId;

/// Non-blocking message delivery to cluster peers
pub trait ClusterNetwork<C>: Send {
    /// Deliver to one peer
    fn send(&self, to: NodeId, message: ProtocolMessage<C>);

    /// Deliver to every reachable peer except the local node
    fn broadcast(&self, message: ProtocolMessage<C>);
}
