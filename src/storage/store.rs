//! The consistency store: identities, history and dependent tables behind
//! one transactional write path.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};

use crate::history::HistoryEntry;
use crate::identity::{fold_name, DisplayName, Identity, IdentityKey};

use super::memory::MemoryJournal;
use super::state::{
    CommitBatch, DependentCount, DependentRecord, Mutation, RowId, StoreSnapshot, StoreState, Undo,
};
use super::traits::{CheckpointReport, Journal, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// Handle passed to [`ConsistencyStore::with_transaction`] closures.
///
/// Writes are applied immediately and are visible to later reads through the
/// same handle; they become visible to other callers only if the closure
/// returns `Ok` and the journal accepts the batch.
pub struct Transaction<'a> {
    state: &'a mut StoreState,
    redo: Vec<Mutation>,
    undo: Vec<Undo>,
}

impl<'a> Transaction<'a> {
    fn new(state: &'a mut StoreState) -> Self {
        Self {
            state,
            redo: Vec::new(),
            undo: Vec::new(),
        }
    }

    fn record(&mut self, mutation: Mutation) -> Result<bool, StorageError> {
        match self.state.apply(&mutation)? {
            Some(undo) => {
                self.redo.push(mutation);
                self.undo.push(undo);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Identity row for `id`.
    #[must_use]
    pub fn identity(&self, id: IdentityKey) -> Option<Identity> {
        self.state.identity(id).cloned()
    }

    /// Identity whose active name is `name`.
    #[must_use]
    pub fn identity_by_name(&self, name: &str) -> Option<Identity> {
        self.state.identity_by_name(name).cloned()
    }

    /// Returns true if `id` has ever been observed with `name`.
    #[must_use]
    pub fn history_contains(&self, id: IdentityKey, name: &str) -> bool {
        self.state.history().contains(id, name)
    }

    /// The history entry for `(id, name)`.
    #[must_use]
    pub fn history_entry(&self, id: IdentityKey, name: &str) -> Option<HistoryEntry> {
        self.state.history().entry(id, name).cloned()
    }

    /// Timestamp of the latest history entry for `id`.
    #[must_use]
    pub fn latest_observation(&self, id: IdentityKey) -> Option<DateTime<Utc>> {
        self.state.history().latest_observation(id)
    }

    /// Dependent rows filed under `name`.
    #[must_use]
    pub fn count_dependents(&self, name: &str) -> DependentCount {
        self.state.count_dependents(name)
    }

    /// Registers a dependent table. Registering twice is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn register_table(&mut self, table: &str) -> Result<(), StorageError> {
        self.record(Mutation::RegisterTable {
            table: table.to_string(),
        })
        .map(|_| ())
    }

    /// Inserts a row into `table` under `name`, returning its row id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if `table` is not registered.
    pub fn insert_record(
        &mut self,
        table: &str,
        name: &DisplayName,
        data: serde_json::Value,
    ) -> Result<RowId, StorageError> {
        let row_id = self.state.next_row_id();
        self.record(Mutation::InsertRecord {
            table: table.to_string(),
            record: DependentRecord {
                row_id,
                name: name.clone(),
                data,
            },
        })?;
        Ok(row_id)
    }

    /// Re-keys every row of `table` filed under `from` to `to`.
    ///
    /// Returns the number of rows moved. Rows already filed under `to` are
    /// left alone, so collisions keep both rows.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if `table` is not registered.
    pub fn rewrite_key(
        &mut self,
        table: &str,
        from: &str,
        to: &DisplayName,
    ) -> Result<usize, StorageError> {
        let moved = match self.state.table(table) {
            Some(rows) if fold_name(from) != to.folded() => rows.count(from),
            Some(_) => 0,
            None => return Err(StorageError::UnknownTable(table.to_string())),
        };
        self.record(Mutation::RewriteKey {
            table: table.to_string(),
            from: fold_name(from),
            to: to.clone(),
        })?;
        Ok(moved)
    }

    /// Applies [`rewrite_key`](Self::rewrite_key) to every registered table.
    ///
    /// Returns non-zero per-table counts.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn rewrite_all_tables(
        &mut self,
        from: &str,
        to: &DisplayName,
    ) -> Result<BTreeMap<String, usize>, StorageError> {
        let tables: Vec<String> = self.state.table_names().cloned().collect();
        let mut moved = BTreeMap::new();
        for table in tables {
            let n = self.rewrite_key(&table, from, to)?;
            if n > 0 {
                moved.insert(table, n);
            }
        }
        Ok(moved)
    }

    /// Creates or replaces an identity row.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NameConflict`] if the name is the active name
    /// of a different identity.
    pub fn upsert_identity(&mut self, identity: Identity) -> Result<(), StorageError> {
        self.record(Mutation::UpsertIdentity(identity)).map(|_| ())
    }

    /// Records that `id` was observed with `name` at `observed_at`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn append_history(
        &mut self,
        id: IdentityKey,
        name: &DisplayName,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.record(Mutation::AppendHistory {
            id,
            name: name.clone(),
            observed_at,
        })
        .map(|_| ())
    }

    fn into_parts(self) -> (Vec<Mutation>, Vec<Undo>) {
        (self.redo, self.undo)
    }
}

/// Authoritative store for identities, history and dependent tables.
///
/// Shared behind `Arc` by the resolver, the migration engine and backfill.
/// Reads take a shared lock; [`with_transaction`](Self::with_transaction)
/// takes the exclusive lock for the duration of the closure.
pub struct ConsistencyStore {
    state: RwLock<StoreState>,
    journal: Box<dyn Journal>,
}

impl std::fmt::Debug for ConsistencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyStore").finish_non_exhaustive()
    }
}

impl ConsistencyStore {
    /// Creates an empty store without durability.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_journal(Box::new(MemoryJournal::new()), StoreState::default())
    }

    /// Creates a store over recovered `state` that commits to `journal`.
    #[must_use]
    pub fn with_journal(journal: Box<dyn Journal>, state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
            journal,
        }
    }

    fn read(&self, context: &'static str) -> Result<RwLockReadGuard<'_, StoreState>, StorageError> {
        self.state.read().map_err(|_| lock_err(context))
    }

    /// Runs `f` as one all-or-nothing transaction.
    ///
    /// If `f` returns `Err`, or the journal rejects the batch, every write
    /// made through the handle is undone and the store is left exactly as it
    /// was. Transactions that change nothing are not journaled.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or the journal's error converted into `E`.
    pub fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    {
        let mut state = self.state.write().map_err(|_| lock_err("transaction"))?;
        let mut tx = Transaction::new(&mut *state);
        let result = f(&mut tx);
        let (redo, undo) = tx.into_parts();

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                state.rollback(undo);
                return Err(e);
            }
        };
        if redo.is_empty() {
            return Ok(value);
        }

        let batch = CommitBatch { mutations: redo };
        if let Err(e) = self.journal.commit(&batch) {
            tracing::warn!(error = %e, mutations = batch.mutations.len(), "journal rejected batch; rolled back");
            state.rollback(undo);
            return Err(e.into());
        }

        if self.journal.wants_checkpoint() {
            // The batch is already durable in the journal.
            if let Err(e) = self.journal.checkpoint(&state.snapshot()) {
                tracing::warn!(error = %e, "automatic checkpoint failed");
            }
        }
        Ok(value)
    }

    /// Folds the journal into a snapshot of the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn checkpoint(&self) -> Result<CheckpointReport, StorageError> {
        let state = self.state.write().map_err(|_| lock_err("checkpoint"))?;
        self.journal.checkpoint(&state.snapshot())
    }

    /// Captures the full state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StorageError> {
        Ok(self.read("snapshot")?.snapshot())
    }

    /// Registers a dependent table in its own transaction.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn register_table(&self, table: &str) -> Result<(), StorageError> {
        self.with_transaction(|tx| tx.register_table(table))
    }

    /// Inserts a dependent row in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if `table` is not registered.
    pub fn insert_record(
        &self,
        table: &str,
        name: &DisplayName,
        data: serde_json::Value,
    ) -> Result<RowId, StorageError> {
        self.with_transaction(|tx| tx.insert_record(table, name, data))
    }

    /// Identity row for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn identity(&self, id: IdentityKey) -> Result<Option<Identity>, StorageError> {
        Ok(self.read("identity")?.identity(id).cloned())
    }

    /// Identity whose active name is `name` (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn identity_by_name(&self, name: &str) -> Result<Option<Identity>, StorageError> {
        Ok(self.read("identity_by_name")?.identity_by_name(name).cloned())
    }

    /// Identity that has ever been observed with `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn resolve_any_name(&self, name: &str) -> Result<Option<IdentityKey>, StorageError> {
        Ok(self.read("resolve_any_name")?.history().resolve_any_name(name))
    }

    /// Every name observed for `id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn history(&self, id: IdentityKey) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self.read("history")?.history().all_names(id))
    }

    /// Dependent rows filed under `name`, total and per table.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count_dependents(&self, name: &str) -> Result<DependentCount, StorageError> {
        Ok(self.read("count_dependents")?.count_dependents(name))
    }

    /// Rows of `table` filed under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if `table` is not registered.
    pub fn records(&self, table: &str, name: &str) -> Result<Vec<DependentRecord>, StorageError> {
        let state = self.read("records")?;
        let rows = state
            .table(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        Ok(rows.records(name))
    }

    /// Registered table names, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn tables(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.read("tables")?.table_names().cloned().collect())
    }

    /// Distinct names known to the store, for backfill.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn known_names(&self) -> Result<Vec<DisplayName>, StorageError> {
        Ok(self.read("known_names")?.known_names())
    }

    /// Summary counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let state = self.read("stats")?;
        Ok(StoreStats {
            identities: state.identity_count(),
            history_entries: state.history().len(),
            tables: state.table_names().count(),
            records: state.record_count(),
        })
    }
}

/// Summary counts for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    /// Identity rows.
    pub identities: usize,
    /// History entries.
    pub history_entries: usize,
    /// Registered dependent tables.
    pub tables: usize,
    /// Dependent rows across all tables.
    pub records: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    fn name(s: &str) -> DisplayName {
        DisplayName::new(s).unwrap()
    }

    #[derive(Default)]
    struct SwitchJournal {
        fail: Arc<AtomicBool>,
    }

    impl Journal for SwitchJournal {
        fn commit(&self, _batch: &CommitBatch) -> Result<(), StorageError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Journal("injected".into()));
            }
            Ok(())
        }
    }

    fn seeded(journal: Box<dyn Journal>) -> (ConsistencyStore, IdentityKey) {
        let store = ConsistencyStore::with_journal(journal, StoreState::default());
        let id = IdentityKey::random();
        store
            .with_transaction(|tx| -> Result<(), StorageError> {
                tx.register_table("general_stats")?;
                tx.register_table("user_links")?;
                tx.insert_record("general_stats", &name("DaJJay"), json!({ "kills": 3 }))?;
                tx.insert_record("user_links", &name("dajjay"), json!({ "discord": 1 }))?;
                tx.upsert_identity(Identity::new(id, name("DaJJay"), Utc::now()))?;
                tx.append_history(id, &name("DaJJay"), Utc::now())
            })
            .unwrap();
        (store, id)
    }

    #[test]
    fn closure_error_rolls_back_everything() {
        let (store, id) = seeded(Box::new(MemoryJournal::new()));
        let before = serde_json::to_value(store.snapshot().unwrap()).unwrap();

        let result: Result<(), StorageError> = store.with_transaction(|tx| {
            let moved = tx.rewrite_all_tables("dajjay", &name("Jyyroh"))?;
            assert_eq!(moved.values().sum::<usize>(), 2);
            tx.upsert_identity(Identity::new(id, name("Jyyroh"), Utc::now()))?;
            assert!(tx.identity_by_name("jyyroh").is_some());
            Err(StorageError::Backend("abort".into()))
        });
        assert!(result.is_err());

        let after = serde_json::to_value(store.snapshot().unwrap()).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.count_dependents("DaJJay").unwrap().total, 2);
    }

    #[test]
    fn journal_failure_rolls_back() {
        let fail = Arc::new(AtomicBool::new(false));
        let (store, id) = seeded(Box::new(SwitchJournal { fail: fail.clone() }));

        fail.store(true, Ordering::SeqCst);
        let err = store
            .with_transaction(|tx| {
                tx.rewrite_all_tables("DaJJay", &name("Jyyroh"))?;
                tx.upsert_identity(Identity::new(id, name("Jyyroh"), Utc::now()))
            })
            .unwrap_err();
        assert!(err.is_transient());

        assert_eq!(store.count_dependents("jyyroh").unwrap().total, 0);
        assert_eq!(store.identity(id).unwrap().unwrap().current_name.as_str(), "DaJJay");
    }

    #[test]
    fn empty_transactions_are_not_journaled() {
        let journal = MemoryJournal::new();
        let commits = journal.commit_counter();
        let (store, _) = seeded(Box::new(journal));
        assert_eq!(commits.load(Ordering::SeqCst), 1);

        store.register_table("general_stats").unwrap();
        store
            .with_transaction(|tx| tx.rewrite_all_tables("ghost", &name("Other")))
            .unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reads_and_stats() {
        let (store, id) = seeded(Box::new(MemoryJournal::new()));

        let count = store.count_dependents("DAJJAY").unwrap();
        assert_eq!(count.total, 2);
        assert_eq!(count.per_table.get("general_stats"), Some(&1));

        assert_eq!(store.records("user_links", "DaJJay").unwrap().len(), 1);
        assert!(matches!(
            store.records("nope", "DaJJay"),
            Err(StorageError::UnknownTable(_))
        ));
        assert_eq!(store.resolve_any_name("dajjay").unwrap(), Some(id));
        assert_eq!(store.history(id).unwrap().len(), 1);
        assert_eq!(store.tables().unwrap(), ["general_stats", "user_links"]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.identities, 1);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.tables, 2);
    }

    #[test]
    fn insert_into_unknown_table_fails() {
        let store = ConsistencyStore::in_memory();
        let err = store
            .insert_record("missing", &name("a"), json!(null))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownTable(_)));
    }
}
