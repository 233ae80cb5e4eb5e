//! Storage for namesake.
//!
//! [`ConsistencyStore`] owns all persisted state and exposes one
//! transactional write path. Durability is delegated to a [`Journal`].

mod memory;
mod state;
mod store;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::MemoryJournal;
pub use state::{
    CommitBatch, DependentCount, DependentRecord, DependentTable, Mutation, RowId, StoreSnapshot,
    StoreState,
};
pub use store::{ConsistencyStore, StoreStats, Transaction};
pub use traits::{CheckpointReport, Journal, StorageError};
