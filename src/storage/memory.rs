//! In-memory checkpoint store

use super::{PersistenceStore, SavedState};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Checkpoint store that lives as long as its handles
///
/// Clones share the same slot, which lets a test keep a handle across a
/// simulated node restart.
#[derive(Debug)]
pub struct MemoryStore<C> {
    slot: Arc<Mutex<Option<SavedState<C>>>>,
}

impl<C> MemoryStore<C> {
    /// Empty store
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<C> Clone for MemoryStore<C> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<C> Default for MemoryStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone + Send> PersistenceStore<C> for MemoryStore<C> {
    fn save(&self, state: &SavedState<C>) -> Result<()> {
        *self.slot.lock() = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<SavedState<C>>> {
        Ok(self.slot.lock().clone())
    }
}
