//! Property tests for row conservation and history growth.

use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use serde_json::json;

use namesake::{
    Clock, ConsistencyStore, DisplayName, Identity, IdentityKey, IdentityLocks, ManualClock,
    MigrationEngine, StorageError,
};

const TABLES: &[&str] = &["general_stats", "sheep_stats", "user_meta"];
const POOL: &[&str] = &["Alpha", "Bravo", "Charlie", "Delta", "Echo"];

fn name(s: &str) -> DisplayName {
    DisplayName::new(s).unwrap()
}

/// Re-cases `base` according to `mask`, one bit per character.
fn recase(base: &str, mask: u32) -> String {
    base.chars()
        .enumerate()
        .map(|(i, c)| {
            if mask & (1 << (i % 32)) == 0 {
                c.to_ascii_lowercase()
            } else {
                c.to_ascii_uppercase()
            }
        })
        .collect()
}

fn setup() -> (Arc<ConsistencyStore>, MigrationEngine, Arc<ManualClock>) {
    let store = Arc::new(ConsistencyStore::in_memory());
    for table in TABLES {
        store.register_table(table).unwrap();
    }
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = MigrationEngine::new(Arc::clone(&store), Arc::new(IdentityLocks::new()), clock.clone());
    (store, engine, clock)
}

fn link(store: &ConsistencyStore, id: IdentityKey, current: &str, at: chrono::DateTime<Utc>) {
    store
        .with_transaction(|tx| -> Result<(), StorageError> {
            tx.upsert_identity(Identity::new(id, name(current), at))?;
            tx.append_history(id, &name(current), at)
        })
        .unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn rename_conserves_rows(
        old_rows in prop::collection::vec((0..TABLES.len(), any::<u32>()), 0..12),
        new_rows in prop::collection::vec((0..TABLES.len(), any::<u32>()), 0..6),
        bystander_rows in prop::collection::vec(0..TABLES.len(), 0..6),
    ) {
        let (store, engine, clock) = setup();
        let id = IdentityKey::random();
        link(&store, id, "DaJJay", clock.now());
        clock.advance(Duration::seconds(1));

        for (table, mask) in &old_rows {
            store.insert_record(TABLES[*table], &name(&recase("DaJJay", *mask)), json!(null)).unwrap();
        }
        for (table, mask) in &new_rows {
            store.insert_record(TABLES[*table], &name(&recase("Jyyroh", *mask)), json!(null)).unwrap();
        }
        for table in &bystander_rows {
            store.insert_record(TABLES[*table], &name("Bystander"), json!(null)).unwrap();
        }

        let old_before = store.count_dependents("DaJJay").unwrap().total;
        let new_before = store.count_dependents("Jyyroh").unwrap().total;
        let report = engine.apply_rename(id, &name("DaJJay"), &name("Jyyroh")).unwrap();

        prop_assert_eq!(report.total_rows(), old_before);
        prop_assert_eq!(store.count_dependents("DaJJay").unwrap().total, 0);
        prop_assert_eq!(store.count_dependents("Jyyroh").unwrap().total, old_before + new_before);
        prop_assert_eq!(store.count_dependents("Bystander").unwrap().total, bystander_rows.len());
    }

    #[test]
    fn history_never_shrinks(renames in prop::collection::vec(0..POOL.len(), 1..20)) {
        let (store, engine, clock) = setup();
        let id = IdentityKey::random();
        link(&store, id, POOL[0], clock.now());
        store.insert_record(TABLES[0], &name(POOL[0]), json!(null)).unwrap();

        let mut seen = std::collections::BTreeSet::from([POOL[0]]);
        let mut previous = store.history(id).unwrap().len();
        for next in renames {
            clock.advance(Duration::seconds(1));
            let current = store.identity(id).unwrap().unwrap().current_name;
            engine.apply_rename(id, &current, &name(POOL[next])).unwrap();
            seen.insert(POOL[next]);

            let history = store.history(id).unwrap();
            prop_assert!(history.len() >= previous);
            prop_assert_eq!(history.len(), seen.len());
            prop_assert!(history.windows(2).all(|w| w[0].observed_at <= w[1].observed_at));
            prop_assert_eq!(store.resolve_any_name(POOL[next]).unwrap(), Some(id));
            previous = history.len();
        }
        prop_assert_eq!(store.stats().unwrap().records, 1);
    }
}
