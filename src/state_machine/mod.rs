//! Application state machine boundary
//!
//! Committed batches are handed to a [`StateMachine`] in commit order. The
//! implementation must be deterministic: the same commands applied in the
//! same order yield the same responses and the same state on every node.
//! Snapshots move the whole state between nodes during sync and are written
//! into every persistence checkpoint.

pub mod kv;

use crate::error::{RabiaError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Replicated application logic
pub trait StateMachine: Send + 'static {
    /// Command carried in batches
    type Command: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;
    /// Result of applying one command
    type Response: Clone + Debug + Send + 'static;
    /// Complete state, as captured by a snapshot
    type State: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Apply committed commands in order, one response per command
    fn apply(&mut self, commands: &[Self::Command]) -> Vec<Self::Response>;

    /// Capture the current state
    fn create_snapshot(&self) -> Self::State;

    /// Replace the current state
    fn restore_from_snapshot(&mut self, state: Self::State);

    /// Read-only view of the current state
    fn current_state(&self) -> &Self::State;

    /// Encoded snapshot
    fn snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.create_snapshot())
            .map_err(|e| RabiaError::serialization_error("state snapshot", e))
    }

    /// Restore from an encoded snapshot
    fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        let state: Self::State = bincode::deserialize(bytes)
            .map_err(|e| RabiaError::snapshot_error("restore", e))?;
        self.restore_from_snapshot(state);
        Ok(())
    }
}
