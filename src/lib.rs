//! # namesake - identity resolution and rename migration
//!
//! namesake keeps records that are keyed by a mutable display name (a
//! Minecraft username) attached to the stable identity behind that name (a
//! Mojang UUID). When the directory reports that an identity now goes by a
//! different name, every dependent row is re-keyed in one transaction and
//! both names stay resolvable to the same identity.
//!
//! ## Core Concepts
//!
//! - **Identity**: a stable key and the name it currently goes by
//! - **History ledger**: every name ever observed for every identity
//! - **Dependent record**: an opaque row filed under a display name
//! - **Directory**: the external authority on current names, consulted through
//!   an ordered chain of providers
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use namesake::directory::{DirectoryChain, MemoryDirectory, RetryPolicy};
//! use namesake::{ConsistencyStore, DisplayName, IdentityKey, IdentityResolver, NamesakeConfig};
//!
//! let store = Arc::new(ConsistencyStore::in_memory());
//! store.register_table("general_stats")?;
//!
//! let directory = Arc::new(MemoryDirectory::new("local"));
//! let id = IdentityKey::random();
//! directory.insert(id, DisplayName::new("DaJJay")?);
//!
//! let chain = DirectoryChain::new(RetryPolicy::no_retry(), Duration::from_secs(1))
//!     .with_provider(directory.clone());
//! let resolver = IdentityResolver::new(Arc::clone(&store), chain, &NamesakeConfig::default())?;
//!
//! resolver.resolve("DaJJay")?;
//! store.insert_record("general_stats", &DisplayName::new("DaJJay")?, serde_json::json!({ "wins": 3 }))?;
//!
//! directory.rename(id, DisplayName::new("Jyyroh")?);
//! resolver.apply_rename_if_needed("DaJJay")?;
//! assert_eq!(store.count_dependents("Jyyroh")?.total, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod clock;
pub mod error;
pub mod history;
pub mod identity;

// Storage and directory
pub mod config;
pub mod directory;
pub mod storage;

// Resolution and migration
pub mod backfill;
pub mod locks;
pub mod migration;
pub mod resolver;

pub use backfill::{backfill, backfill_known, BackfillFailure, BackfillReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DirectoryConfig, NamesakeConfig, PersistentConfig};
pub use directory::{DirectoryChain, DirectoryOutcome, DirectoryProfile, DirectoryProvider};
pub use error::{
    DirectoryUnavailable, MigrationError, NamesakeError, NamesakeResult, ProviderError, ValidationError,
};
pub use history::{HistoryEntry, HistoryLedger};
pub use identity::{fold_name, DisplayName, Identity, IdentityKey};
pub use locks::{IdentityGuard, IdentityLocks};
pub use migration::{MigrationEngine, MigrationOutcome, MigrationReport};
pub use resolver::{
    HistoryQuery, IdentityResolver, RenameCheck, Resolution, ResolutionSource, ResolvedIdentity,
};
pub use storage::{ConsistencyStore, StorageError, StoreStats};

#[cfg(feature = "persistent")]
pub use storage::persistent::{open_database, PersistentDatabase};
