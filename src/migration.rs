//! Rename migration: moving every dependent row from an identity's old
//! name(s) to its new one in a single store transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::MigrationError;
use crate::identity::{DisplayName, Identity, IdentityKey};
use crate::locks::{IdentityGuard, IdentityLocks};
use crate::storage::{ConsistencyStore, StorageError, Transaction};

/// Whether a migration changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// The identity was renamed (and rows moved, if it had any).
    Applied,
    /// The store already reflected the rename.
    NoOp,
}

/// What a migration did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// The renamed identity.
    pub identity: IdentityKey,
    /// Names rows were moved away from.
    pub from: Vec<DisplayName>,
    /// The identity's name afterwards.
    pub to: DisplayName,
    /// Rows moved, per table. Tables with no moved rows are omitted.
    pub rows_migrated: BTreeMap<String, usize>,
    /// Whether anything changed.
    pub outcome: MigrationOutcome,
}

impl MigrationReport {
    fn no_op(identity: IdentityKey, to: &DisplayName) -> Self {
        Self {
            identity,
            from: Vec::new(),
            to: to.clone(),
            rows_migrated: BTreeMap::new(),
            outcome: MigrationOutcome::NoOp,
        }
    }

    /// Rows moved across all tables.
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.rows_migrated.values().sum()
    }

    /// Returns true if the store changed.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.outcome == MigrationOutcome::Applied
    }
}

enum TxAbort {
    Migration(MigrationError),
    Storage(StorageError),
}

impl From<StorageError> for TxAbort {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<MigrationError> for TxAbort {
    fn from(e: MigrationError) -> Self {
        Self::Migration(e)
    }
}

/// Applies renames to the store.
///
/// Shares its [`IdentityLocks`] with the resolver and backfill so that at
/// most one migration per identity runs at a time.
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    store: Arc<ConsistencyStore>,
    locks: Arc<IdentityLocks>,
    clock: Arc<dyn Clock>,
}

impl MigrationEngine {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<ConsistencyStore>, locks: Arc<IdentityLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { store, locks, clock }
    }

    /// The store migrations write to.
    #[must_use]
    pub fn store(&self) -> &Arc<ConsistencyStore> {
        &self.store
    }

    /// The shared lock table.
    #[must_use]
    pub fn locks(&self) -> &Arc<IdentityLocks> {
        &self.locks
    }

    /// Renames `identity` from `old` to `new`, moving every dependent row.
    ///
    /// Blocks while another caller holds the identity. Repeating a migration
    /// that already happened is a no-op.
    ///
    /// # Errors
    ///
    /// - [`MigrationError::UnknownIdentity`] if `identity` is not linked
    /// - [`MigrationError::Conflict`] if `new` is another identity's active
    ///   name; nothing is written
    /// - [`MigrationError::Failed`] if the transaction could not commit;
    ///   nothing is written
    pub fn apply_rename(
        &self,
        identity: IdentityKey,
        old: &DisplayName,
        new: &DisplayName,
    ) -> Result<MigrationReport, MigrationError> {
        let guard = self.locks.lock(identity);
        self.apply_rename_locked(&guard, identity, old, new)
    }

    /// Same as [`apply_rename`](Self::apply_rename) for a caller that
    /// already holds the identity's lock.
    ///
    /// # Errors
    ///
    /// As [`apply_rename`](Self::apply_rename), plus
    /// [`MigrationError::LockMismatch`] if `guard` holds another identity.
    pub fn apply_rename_locked(
        &self,
        guard: &IdentityGuard<'_>,
        identity: IdentityKey,
        old: &DisplayName,
        new: &DisplayName,
    ) -> Result<MigrationReport, MigrationError> {
        if guard.key() != identity {
            return Err(MigrationError::LockMismatch {
                expected: identity,
                held: guard.key(),
            });
        }
        if old.eq_folded(new.as_str()) {
            tracing::debug!(identity = %identity, name = %new, "rename to the same name; nothing to do");
            return Ok(MigrationReport::no_op(identity, new));
        }

        let result = self
            .store
            .with_transaction(|tx| self.migrate(tx, identity, old, new));

        match result {
            Ok(report) => {
                if report.is_applied() {
                    tracing::info!(
                        identity = %identity,
                        from = ?report.from.iter().map(DisplayName::as_str).collect::<Vec<_>>(),
                        to = %report.to,
                        rows = report.total_rows(),
                        "rename migrated"
                    );
                } else {
                    tracing::debug!(identity = %identity, to = %new, "rename already applied");
                }
                Ok(report)
            }
            Err(TxAbort::Migration(e)) => {
                tracing::warn!(identity = %identity, error = %e, "rename rejected");
                Err(e)
            }
            Err(TxAbort::Storage(source)) => {
                tracing::warn!(identity = %identity, error = %source, "rename rolled back");
                Err(MigrationError::Failed { identity, source })
            }
        }
    }

    fn migrate(
        &self,
        tx: &mut Transaction<'_>,
        id: IdentityKey,
        old: &DisplayName,
        new: &DisplayName,
    ) -> Result<MigrationReport, TxAbort> {
        let stored = tx
            .identity(id)
            .ok_or(MigrationError::UnknownIdentity { identity: id })?;
        let current = &stored.current_name;

        let mut sources = Vec::new();
        if !current.eq_folded(new.as_str()) {
            sources.push(current.clone());
        }
        let old_is_ours = tx
            .identity_by_name(old.as_str())
            .map_or(true, |holder| holder.id == id);
        if !old.eq_folded(current.as_str())
            && old_is_ours
            && tx.history_contains(id, old.as_str())
            && tx.count_dependents(old.as_str()).total > 0
        {
            sources.push(old.clone());
        }
        if sources.is_empty() {
            return Ok(MigrationReport::no_op(id, new));
        }

        if let Some(holder) = tx.identity_by_name(new.as_str()) {
            if holder.id != id {
                return Err(MigrationError::Conflict {
                    name: new.clone(),
                    holder: holder.id,
                    requester: id,
                }
                .into());
            }
        }

        let mut rows_migrated: BTreeMap<String, usize> = BTreeMap::new();
        for source in &sources {
            for (table, moved) in tx.rewrite_all_tables(source.as_str(), new)? {
                *rows_migrated.entry(table).or_default() += moved;
            }
        }

        if !tx.history_contains(id, current.as_str()) {
            tx.append_history(id, current, stored.last_verified)?;
        }
        // The new name must sort after everything already observed, even
        // when the clock has not moved since the last observation.
        let now = self.clock.now();
        let observed_at = tx
            .latest_observation(id)
            .map_or(now, |latest| now.max(latest + chrono::Duration::nanoseconds(1)));
        tx.upsert_identity(Identity::new(id, new.clone(), now))?;
        tx.append_history(id, new, observed_at)?;

        Ok(MigrationReport {
            identity: id,
            from: sources,
            to: new.clone(),
            rows_migrated,
            outcome: MigrationOutcome::Applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::clock::ManualClock;

    fn name(s: &str) -> DisplayName {
        DisplayName::new(s).unwrap()
    }

    struct Fixture {
        engine: MigrationEngine,
        clock: Arc<ManualClock>,
        store: Arc<ConsistencyStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ConsistencyStore::in_memory());
        store.register_table("general_stats").unwrap();
        store.register_table("tracked_users").unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = MigrationEngine::new(
            Arc::clone(&store),
            Arc::new(IdentityLocks::new()),
            clock.clone(),
        );
        Fixture { engine, clock, store }
    }

    fn link(f: &Fixture, id: IdentityKey, current: &str) {
        let at = f.clock.now();
        f.store
            .with_transaction(|tx| -> Result<(), StorageError> {
                tx.upsert_identity(Identity::new(id, name(current), at))?;
                tx.append_history(id, &name(current), at)
            })
            .unwrap();
        f.clock.advance(Duration::seconds(1));
    }

    #[test]
    fn moves_rows_and_records_history() {
        let f = fixture();
        let id = IdentityKey::random();
        link(&f, id, "DaJJay");
        f.store.insert_record("general_stats", &name("DaJJay"), json!({"wins": 1})).unwrap();
        f.store.insert_record("tracked_users", &name("dajjay"), json!({})).unwrap();

        let report = f.engine.apply_rename(id, &name("DaJJay"), &name("Jyyroh")).unwrap();
        assert!(report.is_applied());
        assert_eq!(report.total_rows(), 2);
        assert_eq!(report.from, vec![name("DaJJay")]);

        assert_eq!(f.store.count_dependents("DaJJay").unwrap().total, 0);
        assert_eq!(f.store.count_dependents("Jyyroh").unwrap().total, 2);
        let names: Vec<_> = f.store.history(id).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![name("DaJJay"), name("Jyyroh")]);
    }

    #[test]
    fn second_application_is_a_no_op() {
        let f = fixture();
        let id = IdentityKey::random();
        link(&f, id, "DaJJay");
        f.store.insert_record("general_stats", &name("DaJJay"), json!(null)).unwrap();

        f.engine.apply_rename(id, &name("DaJJay"), &name("Jyyroh")).unwrap();
        let again = f.engine.apply_rename(id, &name("DaJJay"), &name("Jyyroh")).unwrap();
        assert_eq!(again.outcome, MigrationOutcome::NoOp);
        assert_eq!(f.store.count_dependents("Jyyroh").unwrap().total, 1);
    }

    #[test]
    fn same_name_after_fold_is_a_no_op() {
        let f = fixture();
        let id = IdentityKey::random();
        let report = f.engine.apply_rename(id, &name("DaJJay"), &name("dajjay")).unwrap();
        assert_eq!(report.outcome, MigrationOutcome::NoOp);
    }

    #[test]
    fn unknown_identity_is_rejected() {
        let f = fixture();
        let err = f
            .engine
            .apply_rename(IdentityKey::random(), &name("a"), &name("b"))
            .unwrap_err();
        assert!(matches!(err, MigrationError::UnknownIdentity { .. }));
    }

    #[test]
    fn active_name_of_another_identity_conflicts() {
        let f = fixture();
        let (u1, u2) = (IdentityKey::random(), IdentityKey::random());
        link(&f, u1, "Jyyroh");
        link(&f, u2, "Other");
        f.store.insert_record("general_stats", &name("Other"), json!(null)).unwrap();
        let before = serde_json::to_value(f.store.snapshot().unwrap()).unwrap();

        let err = f.engine.apply_rename(u2, &name("Other"), &name("jyyroh")).unwrap_err();
        assert!(matches!(err, MigrationError::Conflict { holder, requester, .. } if holder == u1 && requester == u2));
        assert_eq!(serde_json::to_value(f.store.snapshot().unwrap()).unwrap(), before);
    }

    #[test]
    fn historical_name_of_another_identity_is_not_a_conflict() {
        let f = fixture();
        let (u1, u2) = (IdentityKey::random(), IdentityKey::random());
        link(&f, u1, "Recycled");
        f.engine.apply_rename(u1, &name("Recycled"), &name("Moved")).unwrap();
        link(&f, u2, "Before");

        let report = f.engine.apply_rename(u2, &name("Before"), &name("Recycled")).unwrap();
        assert!(report.is_applied());
        assert_eq!(f.store.identity_by_name("recycled").unwrap().unwrap().id, u2);
    }

    #[test]
    fn sweeps_rows_left_under_a_historical_name() {
        let f = fixture();
        let id = IdentityKey::random();
        link(&f, id, "First");
        f.engine.apply_rename(id, &name("First"), &name("Second")).unwrap();
        // A collaborator kept writing under the old name.
        f.store.insert_record("general_stats", &name("first"), json!(null)).unwrap();

        let report = f.engine.apply_rename(id, &name("First"), &name("Second")).unwrap();
        assert!(report.is_applied());
        assert_eq!(report.from, vec![name("First")]);
        assert_eq!(f.store.count_dependents("Second").unwrap().total, 1);
    }

    #[test]
    fn history_order_holds_when_clock_stands_still() {
        let f = fixture();
        let id = IdentityKey::random();
        let at = f.clock.now();
        f.store
            .with_transaction(|tx| -> Result<(), StorageError> {
                tx.upsert_identity(Identity::new(id, name("Zed"), at))?;
                tx.append_history(id, &name("Zed"), at)
            })
            .unwrap();

        f.engine.apply_rename(id, &name("Zed"), &name("Abe")).unwrap();
        f.engine.apply_rename(id, &name("Abe"), &name("Aaa")).unwrap();
        assert_eq!(f.clock.now(), at);

        let names: Vec<_> = f.store.history(id).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![name("Zed"), name("Abe"), name("Aaa")]);
        assert_eq!(f.store.resolve_any_name("Aaa").unwrap(), Some(id));
    }

    #[test]
    fn guard_for_another_identity_is_rejected() {
        let f = fixture();
        let (a, b) = (IdentityKey::random(), IdentityKey::random());
        let guard = f.engine.locks().lock(a);
        let err = f
            .engine
            .apply_rename_locked(&guard, b, &name("x"), &name("y"))
            .unwrap_err();
        assert!(matches!(err, MigrationError::LockMismatch { .. }));
    }
}
