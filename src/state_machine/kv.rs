//! Replicated key-value store
//!
//! A small reference [`StateMachine`] used by the tests and the simulator.
//! Keys are kept in a `BTreeMap` so that snapshots of equal stores encode to
//! equal bytes.

use super::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Commands that can be applied to the key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    /// Set a key to a value
    Set {
        /// The key to set
        key: String,
        /// The value to set for the key
        value: String,
    },
    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },
    /// Read a key through the log
    Get {
        /// The key to read
        key: String,
    },
    /// Clear all keys
    Clear,
}

impl KvCommand {
    /// Shorthand for [`KvCommand::Set`]
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Response type for KV commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    /// Value before a set or delete, or the value read by a get
    Value(Option<String>),
    /// Number of keys removed by a clear
    Cleared(usize),
}

/// State of the key-value store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvState {
    /// The key-value storage
    pub data: BTreeMap<String, String>,
    /// Number of commands applied, including reads
    pub operation_count: u64,
    /// Incremented on each mutation
    pub version: u64,
}

impl KvState {
    /// Number of keys
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value of a key
    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }
}

/// Simple key-value store implementation
#[derive(Debug, Default)]
pub struct KeyValueStore {
    state: KvState,
}

impl KeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_one(&mut self, command: &KvCommand) -> KvResponse {
        self.state.operation_count += 1;
        match command {
            KvCommand::Set { key, value } => {
                self.state.version += 1;
                KvResponse::Value(self.state.data.insert(key.clone(), value.clone()))
            }
            KvCommand::Delete { key } => {
                let old = self.state.data.remove(key);
                if old.is_some() {
                    self.state.version += 1;
                }
                KvResponse::Value(old)
            }
            KvCommand::Get { key } => KvResponse::Value(self.state.data.get(key).cloned()),
            KvCommand::Clear => {
                let removed = self.state.data.len();
                self.state.data.clear();
                self.state.version += 1;
                KvResponse::Cleared(removed)
            }
        }
    }
}

impl StateMachine for KeyValueStore {
    type Command = KvCommand;
    type Response = KvResponse;
    type State = KvState;

    fn apply(&mut self, commands: &[KvCommand]) -> Vec<KvResponse> {
        debug!(count = commands.len(), "applying kv commands");
        commands.iter().map(|command| self.apply_one(command)).collect()
    }

    fn create_snapshot(&self) -> KvState {
        self.state.clone()
    }

    fn restore_from_snapshot(&mut self, state: KvState) {
        debug!(keys = state.len(), version = state.version, "restoring kv state");
        self.state = state;
    }

    fn current_state(&self) -> &KvState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_store_basic_operations() {
        let mut kv = KeyValueStore::new();

        let responses = kv.apply(&[
            KvCommand::set("key1", "value1"),
            KvCommand::set("key1", "updated"),
            KvCommand::Get {
                key: "key1".to_string(),
            },
        ]);
        assert_eq!(
            responses,
            vec![
                KvResponse::Value(None),
                KvResponse::Value(Some("value1".to_string())),
                KvResponse::Value(Some("updated".to_string())),
            ]
        );
        assert_eq!(kv.current_state().operation_count, 3);
        assert_eq!(kv.current_state().version, 2);

        kv.apply(&[KvCommand::Delete {
            key: "key1".to_string(),
        }]);
        assert!(kv.current_state().is_empty());
    }

    #[test]
    fn test_delete_nonexistent_key() {
        let mut kv = KeyValueStore::new();
        let responses = kv.apply(&[KvCommand::Delete {
            key: "missing".to_string(),
        }]);
        assert_eq!(responses, vec![KvResponse::Value(None)]);
        assert_eq!(kv.current_state().version, 0);
        assert_eq!(kv.current_state().operation_count, 1);
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut kv1 = KeyValueStore::new();
        kv1.apply(&[KvCommand::set("a", "1"), KvCommand::set("b", "2")]);
        let bytes = kv1.snapshot().unwrap();

        let mut kv2 = KeyValueStore::new();
        kv2.restore(&bytes).unwrap();
        assert_eq!(kv2.current_state(), kv1.current_state());
        assert_eq!(kv2.snapshot().unwrap(), bytes);

        assert!(kv2.restore(&[0xff, 0x01]).is_err());
    }

    #[test]
    fn test_clear_reports_removed_keys() {
        let mut kv = KeyValueStore::new();
        kv.apply(&[KvCommand::set("a", "1"), KvCommand::set("b", "2")]);
        assert_eq!(kv.apply(&[KvCommand::Clear]), vec![KvResponse::Cleared(2)]);
        assert!(kv.current_state().is_empty());
    }
}
