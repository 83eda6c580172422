//! Core identifiers and small value types
//!
//! This module defines the node, phase and correlation identifiers used
//! throughout the crate, plus the Lamport-style clock that stamps batches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique, totally ordered identifier of a cluster node
///
/// Ordering is significant: leader designation picks the smallest connected id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a node id from its numeric value
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric value of the id
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(NodeId)
    }
}

/// Static description of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier
    pub id: NodeId,
    /// Transport address; opaque to the consensus layer
    pub address: String,
}

impl NodeInfo {
    /// Create node info
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}@{}", self.id, self.address)
    }
}

impl FromStr for NodeInfo {
    type Err = String;

    /// Parses `id@address`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, address) = s
            .split_once('@')
            .ok_or_else(|| format!("expected <id>@<address>, got '{s}'"))?;
        let id = id.parse::<NodeId>().map_err(|e| format!("invalid node id '{id}': {e}"))?;
        Ok(NodeInfo::new(id, address.trim()))
    }
}

/// One slot of the replicated log
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Phase(u64);

impl Phase {
    /// The first phase of a fresh log
    pub const ZERO: Phase = Phase(0);

    /// Create a phase from its number
    pub const fn new(phase: u64) -> Self {
        Self(phase)
    }

    /// Phase number
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The phase after this one
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Number of phases between `earlier` and `self`, zero if `earlier` is later
    pub const fn distance_from(self, earlier: Phase) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Phase `n` slots before this one, clamped at zero
    pub const fn saturating_back(self, n: u64) -> Self {
        Self(self.0.saturating_sub(n))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase-{}", self.0)
    }
}

/// Identifies one client proposal so its submitter can be notified on commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random correlation id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lamport-style logical clock used to stamp batches
///
/// Local stamps are strictly increasing and never below any stamp observed
/// from a peer.
#[derive(Debug, Clone, Default)]
pub struct LogicalClock {
    last: u64,
}

impl LogicalClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next local timestamp
    pub fn tick(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    /// Account for a timestamp seen on a remote batch
    pub fn observe(&mut self, remote: u64) {
        self.last = self.last.max(remote);
    }

    /// Last issued or observed timestamp
    pub fn current(&self) -> u64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering() {
        let mut ids = vec![NodeId::new(5), NodeId::new(1), NodeId::new(3)];
        ids.sort();
        assert_eq!(ids, vec![NodeId::new(1), NodeId::new(3), NodeId::new(5)]);
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId::new(42));
        assert_eq!(NodeId::new(9).to_string(), "9");
    }

    #[test]
    fn test_node_info_parse() {
        let info: NodeInfo = "3@127.0.0.1:7003".parse().unwrap();
        assert_eq!(info.id, NodeId::new(3));
        assert_eq!(info.address, "127.0.0.1:7003");
        assert!("no-separator".parse::<NodeInfo>().is_err());
        assert!("x@host".parse::<NodeInfo>().is_err());
    }

    #[test]
    fn test_phase_arithmetic() {
        let p = Phase::new(10);
        assert_eq!(p.next(), Phase::new(11));
        assert_eq!(p.distance_from(Phase::new(4)), 6);
        assert_eq!(Phase::new(4).distance_from(p), 0);
        assert_eq!(Phase::new(3).saturating_back(5), Phase::ZERO);
    }

    #[test]
    fn test_logical_clock() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(), 1);
        clock.observe(10);
        assert_eq!(clock.tick(), 11);
        clock.observe(3);
        assert_eq!(clock.current(), 11);
    }

    #[test]
    fn test_serialization() {
        let info = NodeInfo::new(7, "10.0.0.7:9000");
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"id":7,"address":"10.0.0.7:9000"}"#);
        let back: NodeInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);

        let bytes = bincode::serialize(&Phase::new(99)).unwrap();
        let phase: Phase = bincode::deserialize(&bytes).unwrap();
        assert_eq!(phase, Phase::new(99));
    }
}
