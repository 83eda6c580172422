//! redb-backed checkpoint store
//!
//! The checkpoint is a single bincode-encoded row, replaced atomically by
//! each save.

use super::{PersistenceStore, SavedState};
use crate::error::{RabiaError as Error, Result};
use ::redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const CHECKPOINT_TABLE: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("checkpoint");
const CHECKPOINT_KEY: &str = "latest";

/// Checkpoint store in a redb database file
#[derive(Clone)]
pub struct RedbStore {
    database: Arc<Database>,
}

impl RedbStore {
    /// Open or create the database at `path`, creating parent directories
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Io {
                operation: "create data directory".to_string(),
                source: e,
            })?;
        }

        let database = Database::create(path)
            .map_err(|e| Error::storage_error("create database", e))?;

        let write_txn = database
            .begin_write()
            .map_err(|e| Error::storage_error("begin write transaction", e))?;
        {
            let _ = write_txn
                .open_table(CHECKPOINT_TABLE)
                .map_err(|e| Error::storage_error("open checkpoint table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::storage_error("commit table initialization", e))?;

        debug!(path = %path.display(), "opened checkpoint database");
        Ok(Self {
            database: Arc::new(database),
        })
    }
}

impl<C> PersistenceStore<C> for RedbStore
where
    C: Serialize + DeserializeOwned,
{
    fn save(&self, state: &SavedState<C>) -> Result<()> {
        let data = bincode::serialize(state)
            .map_err(|e| Error::serialization_error("checkpoint", e))?;

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| Error::storage_error("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(CHECKPOINT_TABLE)
                .map_err(|e| Error::storage_error("open checkpoint table", e))?;
            table
                .insert(CHECKPOINT_KEY, &data[..])
                .map_err(|e| Error::storage_error("insert checkpoint", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::storage_error("commit checkpoint", e))?;

        debug!(
            phase = %state.last_phase,
            pending = state.pending.len(),
            bytes = data.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<SavedState<C>>> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| Error::storage_error("begin read transaction", e))?;
        let table = read_txn
            .open_table(CHECKPOINT_TABLE)
            .map_err(|e| Error::storage_error("open checkpoint table", e))?;

        match table
            .get(CHECKPOINT_KEY)
            .map_err(|e| Error::storage_error("get checkpoint", e))?
        {
            Some(data) => {
                let state = bincode::deserialize(data.value())
                    .map_err(|e| Error::serialization_error("checkpoint", e))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::types::Phase;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load_replaces_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path().join("nested").join("rabia.redb")).unwrap();

        let loaded: Option<SavedState<String>> = store.load().unwrap();
        assert!(loaded.is_none());

        let mut state = SavedState::initial(vec![1, 2, 3]);
        state.last_phase = Phase::new(5);
        state.pending.push(Batch::new(vec!["cmd".to_string()], 7).unwrap());
        store.save(&state).unwrap();

        state.last_phase = Phase::new(6);
        state.pending.clear();
        store.save(&state).unwrap();

        let loaded: SavedState<String> = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_phase, Phase::new(6));
        assert!(loaded.pending.is_empty());
        assert_eq!(loaded.state, vec![1, 2, 3]);
    }
}
