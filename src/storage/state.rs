//! The store's in-memory state and the mutations that change it.
//!
//! Every change is expressed as a [`Mutation`]. Applying a mutation returns
//! the [`Undo`] that reverses it, which is what lets a transaction apply its
//! writes eagerly and still roll back exactly. The same mutations, batched,
//! are what journals persist and replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::{AppendOutcome, HistoryEntry, HistoryLedger};
use crate::identity::{fold_name, DisplayName, Identity, IdentityKey};

use super::traits::StorageError;

/// Store-assigned surrogate key of a dependent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row in a dependent table, keyed by display name.
///
/// The payload is opaque to this crate; only `name` is ever rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentRecord {
    /// Surrogate key, stable across renames.
    pub row_id: RowId,
    /// The name this row is filed under.
    pub name: DisplayName,
    /// Opaque payload.
    pub data: serde_json::Value,
}

/// One dependent table with a case-folded name index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<DependentRecord>", into = "Vec<DependentRecord>")]
pub struct DependentTable {
    rows: BTreeMap<RowId, DependentRecord>,
    by_name: HashMap<String, BTreeSet<RowId>>,
}

impl DependentTable {
    fn insert(&mut self, record: DependentRecord) {
        self.by_name
            .entry(record.name.folded())
            .or_default()
            .insert(record.row_id);
        self.rows.insert(record.row_id, record);
    }

    fn remove(&mut self, row_id: RowId) {
        if let Some(record) = self.rows.remove(&row_id) {
            self.unindex(&record.name.folded(), row_id);
        }
    }

    fn unindex(&mut self, folded: &str, row_id: RowId) {
        if let Some(ids) = self.by_name.get_mut(folded) {
            ids.remove(&row_id);
            if ids.is_empty() {
                self.by_name.remove(folded);
            }
        }
    }

    fn rename_row(&mut self, row_id: RowId, to: &DisplayName) -> Option<DisplayName> {
        let record = self.rows.get_mut(&row_id)?;
        let previous = std::mem::replace(&mut record.name, to.clone());
        let from = previous.folded();
        self.unindex(&from, row_id);
        self.by_name.entry(to.folded()).or_default().insert(row_id);
        Some(previous)
    }

    /// Number of rows filed under `name` (case-insensitive).
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.by_name.get(&fold_name(name)).map_or(0, BTreeSet::len)
    }

    /// Rows filed under `name`, in row id order.
    #[must_use]
    pub fn records(&self, name: &str) -> Vec<DependentRecord> {
        self.by_name
            .get(&fold_name(name))
            .into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id).cloned())
            .collect()
    }

    /// Total rows in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn names(&self) -> impl Iterator<Item = &DisplayName> {
        self.by_name
            .values()
            .filter_map(|ids| ids.iter().next())
            .filter_map(|id| self.rows.get(id))
            .map(|record| &record.name)
    }
}

impl From<Vec<DependentRecord>> for DependentTable {
    fn from(records: Vec<DependentRecord>) -> Self {
        let mut table = Self::default();
        for record in records {
            table.insert(record);
        }
        table
    }
}

impl From<DependentTable> for Vec<DependentRecord> {
    fn from(table: DependentTable) -> Self {
        table.rows.into_values().collect()
    }
}

/// A single redo-able change to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Registers a dependent table.
    RegisterTable {
        table: String,
    },
    /// Inserts a dependent row.
    InsertRecord {
        table: String,
        record: DependentRecord,
    },
    /// Re-keys every row of `table` filed under folded name `from` to `to`.
    RewriteKey {
        table: String,
        from: String,
        to: DisplayName,
    },
    /// Creates or replaces an identity row.
    UpsertIdentity(Identity),
    /// Records a history observation.
    AppendHistory {
        id: IdentityKey,
        name: DisplayName,
        observed_at: DateTime<Utc>,
    },
}

/// Reverses one applied [`Mutation`].
#[derive(Debug, Clone)]
pub(crate) enum Undo {
    DropTable {
        table: String,
    },
    RemoveRecord {
        table: String,
        row_id: RowId,
        next_row_id: u64,
    },
    RestoreNames {
        table: String,
        renamed: Vec<(RowId, DisplayName)>,
    },
    RestoreIdentity {
        id: IdentityKey,
        previous: Option<Identity>,
    },
    RestoreHistory {
        id: IdentityKey,
        folded: String,
        previous: Option<HistoryEntry>,
    },
}

/// The mutations of one committed transaction, persisted as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitBatch {
    /// Mutations in application order.
    pub mutations: Vec<Mutation>,
}

impl CommitBatch {
    /// Returns true if the batch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Dependent-row counts for a name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependentCount {
    /// Rows across all tables.
    pub total: usize,
    /// Non-zero counts keyed by table.
    pub per_table: BTreeMap<String, usize>,
}

/// Serializable image of the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Identity rows.
    pub identities: Vec<Identity>,
    /// The history ledger.
    pub history: HistoryLedger,
    /// Dependent tables by name.
    pub tables: BTreeMap<String, DependentTable>,
    /// Next row id to hand out.
    pub next_row_id: u64,
}

/// Authoritative in-memory state.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    identities: HashMap<IdentityKey, Identity>,
    active: HashMap<String, IdentityKey>,
    history: HistoryLedger,
    tables: BTreeMap<String, DependentTable>,
    next_row_id: u64,
}

impl StoreState {
    /// Rebuilds state (and the active-name index) from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if two identities in the snapshot
    /// share an active name.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StorageError> {
        let mut state = Self {
            history: snapshot.history,
            tables: snapshot.tables,
            next_row_id: snapshot.next_row_id,
            ..Self::default()
        };
        for identity in snapshot.identities {
            let folded = identity.current_name.folded();
            if let Some(holder) = state.active.insert(folded, identity.id) {
                return Err(StorageError::Corrupted(format!(
                    "snapshot assigns '{}' to both {} and {}",
                    identity.current_name, holder, identity.id
                )));
            }
            state.identities.insert(identity.id, identity);
        }
        let max_row = state
            .tables
            .values()
            .filter_map(|t| t.rows.keys().next_back())
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(0);
        state.next_row_id = state.next_row_id.max(max_row);
        Ok(state)
    }

    /// Captures the full state.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut identities: Vec<Identity> = self.identities.values().cloned().collect();
        identities.sort_by_key(|i| i.id);
        StoreSnapshot {
            identities,
            history: self.history.clone(),
            tables: self.tables.clone(),
            next_row_id: self.next_row_id,
        }
    }

    /// Re-applies a committed batch during recovery.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the batch does not apply to
    /// this state, which means the journal and snapshot disagree.
    pub fn replay(&mut self, batch: &CommitBatch) -> Result<(), StorageError> {
        let mut undo = Vec::with_capacity(batch.mutations.len());
        for mutation in &batch.mutations {
            match self.apply(mutation) {
                Ok(Some(u)) => undo.push(u),
                Ok(None) => {}
                Err(e) => {
                    self.rollback(undo);
                    return Err(StorageError::Corrupted(format!("journal replay failed: {e}")));
                }
            }
        }
        Ok(())
    }

    /// Applies one mutation; `None` means it changed nothing.
    pub(crate) fn apply(&mut self, mutation: &Mutation) -> Result<Option<Undo>, StorageError> {
        match mutation {
            Mutation::RegisterTable { table } => {
                if self.tables.contains_key(table) {
                    return Ok(None);
                }
                self.tables.insert(table.clone(), DependentTable::default());
                Ok(Some(Undo::DropTable {
                    table: table.clone(),
                }))
            }
            Mutation::InsertRecord { table, record } => {
                let rows = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| StorageError::UnknownTable(table.clone()))?;
                if rows.rows.contains_key(&record.row_id) {
                    return Err(StorageError::Backend(format!(
                        "duplicate row id {} in table {table}",
                        record.row_id
                    )));
                }
                let next_row_id = self.next_row_id;
                rows.insert(record.clone());
                self.next_row_id = self.next_row_id.max(record.row_id.0 + 1);
                Ok(Some(Undo::RemoveRecord {
                    table: table.clone(),
                    row_id: record.row_id,
                    next_row_id,
                }))
            }
            Mutation::RewriteKey { table, from, to } => {
                let rows = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| StorageError::UnknownTable(table.clone()))?;
                if *from == to.folded() {
                    return Ok(None);
                }
                let ids: Vec<RowId> = rows
                    .by_name
                    .get(from)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default();
                if ids.is_empty() {
                    return Ok(None);
                }
                let renamed = ids
                    .into_iter()
                    .filter_map(|id| rows.rename_row(id, to).map(|prev| (id, prev)))
                    .collect();
                Ok(Some(Undo::RestoreNames {
                    table: table.clone(),
                    renamed,
                }))
            }
            Mutation::UpsertIdentity(identity) => {
                let folded = identity.current_name.folded();
                if let Some(holder) = self.active.get(&folded) {
                    if *holder != identity.id {
                        return Err(StorageError::NameConflict {
                            name: identity.current_name.to_string(),
                            holder: *holder,
                        });
                    }
                }
                let previous = self.identities.get(&identity.id).cloned();
                if previous.as_ref() == Some(identity) {
                    return Ok(None);
                }
                self.unlink_active(identity.id);
                self.active.insert(folded, identity.id);
                self.identities.insert(identity.id, identity.clone());
                Ok(Some(Undo::RestoreIdentity {
                    id: identity.id,
                    previous,
                }))
            }
            Mutation::AppendHistory {
                id,
                name,
                observed_at,
            } => match self.history.append(*id, name, *observed_at) {
                AppendOutcome::Unchanged => Ok(None),
                AppendOutcome::Inserted => Ok(Some(Undo::RestoreHistory {
                    id: *id,
                    folded: name.folded(),
                    previous: None,
                })),
                AppendOutcome::Refreshed { previous } => Ok(Some(Undo::RestoreHistory {
                    id: *id,
                    folded: name.folded(),
                    previous: Some(previous),
                })),
            },
        }
    }

    /// Reverses applied mutations, newest first.
    pub(crate) fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::DropTable { table } => {
                    self.tables.remove(&table);
                }
                Undo::RemoveRecord {
                    table,
                    row_id,
                    next_row_id,
                } => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        rows.remove(row_id);
                    }
                    self.next_row_id = next_row_id;
                }
                Undo::RestoreNames { table, renamed } => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        for (row_id, name) in renamed {
                            rows.rename_row(row_id, &name);
                        }
                    }
                }
                Undo::RestoreIdentity { id, previous } => {
                    self.unlink_active(id);
                    match previous {
                        Some(identity) => {
                            self.active.insert(identity.current_name.folded(), id);
                            self.identities.insert(id, identity);
                        }
                        None => {
                            self.identities.remove(&id);
                        }
                    }
                }
                Undo::RestoreHistory {
                    id,
                    folded,
                    previous,
                } => self.history.restore(id, &folded, previous),
            }
        }
    }

    fn unlink_active(&mut self, id: IdentityKey) {
        if let Some(current) = self.identities.get(&id) {
            let folded = current.current_name.folded();
            if self.active.get(&folded) == Some(&id) {
                self.active.remove(&folded);
            }
        }
    }

    /// The row id the next inserted record will receive.
    #[must_use]
    pub fn next_row_id(&self) -> RowId {
        RowId(self.next_row_id)
    }

    /// Looks up an identity by key.
    #[must_use]
    pub fn identity(&self, id: IdentityKey) -> Option<&Identity> {
        self.identities.get(&id)
    }

    /// Looks up the identity whose active name is `name`.
    #[must_use]
    pub fn identity_by_name(&self, name: &str) -> Option<&Identity> {
        self.active
            .get(&fold_name(name))
            .and_then(|id| self.identities.get(id))
    }

    /// The history ledger.
    #[must_use]
    pub fn history(&self) -> &HistoryLedger {
        &self.history
    }

    /// Registered table names, sorted.
    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }

    /// A dependent table by name.
    #[must_use]
    pub fn table(&self, table: &str) -> Option<&DependentTable> {
        self.tables.get(table)
    }

    /// Dependent rows filed under `name`, total and per table.
    #[must_use]
    pub fn count_dependents(&self, name: &str) -> DependentCount {
        let mut count = DependentCount::default();
        for (table, rows) in &self.tables {
            let n = rows.count(name);
            if n > 0 {
                count.total += n;
                count.per_table.insert(table.clone(), n);
            }
        }
        count
    }

    /// Distinct names across identities, history and dependent tables.
    ///
    /// Deduplicated by case-fold and sorted by folded name. Identity casing
    /// wins over history casing, which wins over dependent-row casing.
    #[must_use]
    pub fn known_names(&self) -> Vec<DisplayName> {
        let mut names: BTreeMap<String, DisplayName> = BTreeMap::new();
        for table in self.tables.values() {
            for name in table.names() {
                names.entry(name.folded()).or_insert_with(|| name.clone());
            }
        }
        for entry in self.history.entries() {
            names.insert(entry.name.folded(), entry.name.clone());
        }
        for identity in self.identities.values() {
            names.insert(identity.current_name.folded(), identity.current_name.clone());
        }
        names.into_values().collect()
    }

    /// Number of identity rows.
    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Total dependent rows across all tables.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.tables.values().map(DependentTable::len).sum()
    }
}
