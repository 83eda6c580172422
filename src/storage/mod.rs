//! Durable checkpoints
//!
//! A [`SavedState`] captures everything a node needs to resume: the
//! application snapshot, the phase it was working on, its pending batches
//! the recent committed history used to reject stale duplicates, and the
//! node's own proposal and votes in the phase it has not finished. The
//! engine writes one after every commit, before every proposal or vote it
//! sends, and when quorum is lost. The same structure is shipped to lagging
//! peers during sync, without the open phase.

pub mod memory;
pub mod redb;

pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;

use crate::batch::{Batch, BatchId};
use crate::config::{Config, StorageBackend};
use crate::engine::phase::Round;
use crate::error::Result;
use crate::messages::StateValue;
use crate::types::Phase;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Checkpoint of a node's replicated state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedState<C> {
    /// Encoded application snapshot
    pub state: Vec<u8>,
    /// Phase the node is working on; every earlier phase is reflected in `state`
    pub last_phase: Phase,
    /// Batches accepted but not yet committed
    pub pending: Vec<Batch<C>>,
    /// Recently committed batch ids with their timestamps
    pub committed: Vec<(BatchId, u64)>,
    /// Own participation in `last_phase`, restored verbatim on restart
    pub open_phase: Option<OpenPhase<C>>,
}

/// Messages this node already sent in an unfinished phase
///
/// A restarted node must repeat exactly these; proposing or voting anew in
/// the same phase could contradict what peers have counted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPhase<C> {
    /// Phase the messages belong to
    pub phase: Phase,
    /// Iteration the node had reached
    pub iteration: u32,
    /// Batch the node proposed
    pub proposal: Batch<C>,
    /// Votes the node cast
    pub votes: Vec<CastVote<C>>,
}

/// One vote cast by the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVote<C> {
    /// Iteration within the phase
    pub iteration: u32,
    /// Voting round
    pub round: Round,
    /// Value voted
    pub value: StateValue,
    /// Batch attached to a V1 vote
    pub batch: Option<Batch<C>>,
}

impl<C> SavedState<C> {
    /// Checkpoint of a node that has decided nothing yet
    pub fn initial(state: Vec<u8>) -> Self {
        Self {
            state,
            last_phase: Phase::ZERO,
            pending: Vec::new(),
            committed: Vec::new(),
            open_phase: None,
        }
    }
}

/// Save/load contract for checkpoints
///
/// Implementations must keep working while the node is cut off from the
/// cluster; they are local by nature.
pub trait PersistenceStore<C>: Send + Sync {
    /// Replace the stored checkpoint
    fn save(&self, state: &SavedState<C>) -> Result<()>;

    /// Latest stored checkpoint, if any
    fn load(&self) -> Result<Option<SavedState<C>>>;
}

impl<C, T: PersistenceStore<C> + ?Sized> PersistenceStore<C> for Box<T> {
    fn save(&self, state: &SavedState<C>) -> Result<()> {
        (**self).save(state)
    }

    fn load(&self) -> Result<Option<SavedState<C>>> {
        (**self).load()
    }
}

/// Open the backend selected by the configuration
///
/// The redb file lives at `node.data_dir / storage.file_name`.
pub fn open_store<C>(config: &Config) -> Result<Box<dyn PersistenceStore<C>>>
where
    C: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    match config.storage.backend {
        StorageBackend::Memory => Ok(Box::new(MemoryStore::new())),
        StorageBackend::Redb => {
            let path = config.node.data_dir.join(&config.storage.file_name);
            Ok(Box::new(RedbStore::open(path)?))
        }
    }
}
