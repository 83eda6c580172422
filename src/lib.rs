//! # rabia-consensus
//!
//! A crash-fault-tolerant state machine replication library built on the
//! Rabia randomized consensus protocol:
//! - **Leaderless agreement**: every phase decides one batch of commands, or
//!   nothing, through two voting rounds and a deterministic shared coin
//! - **Batch deduplication**: identical submissions commit once and every
//!   submitter is notified
//! - **Checkpoint persistence**: in-memory or `redb`-backed stores
//! - **Topology tracking**: connection backoff, quorum detection and a
//!   deterministic leader for auxiliary work
//!
//! ## Features
//!
//! - Sans-IO [`engine::RabiaEngine`] driven by messages and clock ticks
//! - Async [`node::RabiaNode`] runtime on tokio
//! - Pluggable [`StateMachine`] interface with a key-value example
//! - Seeded cluster simulator behind the `test-helpers` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use rabia_consensus::{ConfigBuilder, ConfigError, ProtocolConfig};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = ConfigBuilder::new()
//!         .node_id(1)
//!         .add_member(1, "127.0.0.1:7001")
//!         .add_member(2, "127.0.0.1:7002")
//!         .add_member(3, "127.0.0.1:7003")
//!         .data_dir("/tmp/rabia-node-1")
//!         .protocol(ProtocolConfig::default().with_tick_interval(Duration::from_millis(10)))
//!         .log_level("info")
//!         .build()?;
//!
//!     println!("Configuration created: node_id={:?}", config.node.id);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

// Core modules
pub mod config;
pub mod error;
pub mod types;

// Protocol
pub mod batch;
pub mod bounded;
pub mod engine;
pub mod messages;
pub mod state_machine;

// Cluster plumbing
pub mod leader;
pub mod router;
pub mod topology;
pub mod transport;

// Runtime
pub mod metrics;
pub mod node;
pub mod observability;
pub mod storage;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;

// Public API exports
pub use crate::batch::{Batch, BatchId};
pub use crate::config::{Config, ConfigBuilder, ConfigError, ConfigResult, ProtocolConfig};
pub use crate::engine::{EngineMode, EngineStatus, RabiaEngine};
pub use crate::error::{RabiaError as Error, Result};
pub use crate::messages::{ClusterEvent, ProtocolMessage, StateValue};
pub use crate::node::RabiaNode;
pub use crate::types::{CorrelationId, NodeId, NodeInfo, Phase};

// State machine components
pub use crate::state_machine::kv::{KeyValueStore, KvCommand, KvResponse, KvState};
pub use crate::state_machine::StateMachine;

// Storage and transport
pub use crate::storage::{MemoryStore, PersistenceStore, RedbStore};
pub use crate::transport::{ClusterNetwork, MemoryHub, MemoryNetwork};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, ConfigBuilder, ConfigError, ConfigResult, ProtocolConfig};
    pub use crate::engine::{EngineMode, EngineStatus, RabiaEngine};
    pub use crate::error::{RabiaError as Error, Result};
    pub use crate::node::RabiaNode;
    pub use crate::types::{CorrelationId, NodeId, NodeInfo, Phase};

    pub use crate::state_machine::kv::{KeyValueStore, KvCommand, KvResponse, KvState};
    pub use crate::state_machine::StateMachine;

    pub use crate::storage::{MemoryStore, PersistenceStore, RedbStore};
    pub use crate::transport::{ClusterNetwork, MemoryHub};
}
