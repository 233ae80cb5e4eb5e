//! Append-only ledger of every name observed for every identity.
//!
//! The ledger is keyed by `(identity, folded name)`. Observing a name that is
//! already recorded only moves its timestamp forward, so the number of
//! entries for an identity never shrinks. The name index lets any
//! historically observed name resolve back to its owner after any number of
//! renames.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{fold_name, DisplayName, IdentityKey};

/// One observation of a name for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Owning identity.
    pub id: IdentityKey,
    /// The observed name, in the casing it was last seen with.
    pub name: DisplayName,
    /// Latest time this name was observed for `id`.
    pub observed_at: DateTime<Utc>,
}

/// What an append did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new `(identity, name)` pair was recorded.
    Inserted,
    /// The pair existed; its timestamp or casing changed.
    Refreshed {
        /// The entry as it was before the append.
        previous: HistoryEntry,
    },
    /// The pair existed with a later-or-equal timestamp and identical casing.
    Unchanged,
}

impl AppendOutcome {
    /// The prior entry, if the append replaced one.
    #[must_use]
    pub fn previous(&self) -> Option<&HistoryEntry> {
        match self {
            Self::Refreshed { previous } => Some(previous),
            Self::Inserted | Self::Unchanged => None,
        }
    }
}

/// The history ledger.
///
/// Serializes as a flat list of entries; indexes are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<HistoryEntry>", into = "Vec<HistoryEntry>")]
pub struct HistoryLedger {
    by_identity: HashMap<IdentityKey, BTreeMap<String, HistoryEntry>>,
    by_name: HashMap<String, BTreeSet<IdentityKey>>,
}

impl HistoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `id` was seen with `name` at `at`.
    ///
    /// Upsert on `(id, folded name)`: a re-observation keeps the later of the
    /// two timestamps and adopts the new casing.
    pub fn append(&mut self, id: IdentityKey, name: &DisplayName, at: DateTime<Utc>) -> AppendOutcome {
        let key = name.folded();
        let entries = self.by_identity.entry(id).or_default();

        let outcome = match entries.get_mut(&key) {
            None => {
                entries.insert(
                    key.clone(),
                    HistoryEntry {
                        id,
                        name: name.clone(),
                        observed_at: at,
                    },
                );
                AppendOutcome::Inserted
            }
            Some(existing) => {
                let later = existing.observed_at.max(at);
                if later == existing.observed_at && existing.name == *name {
                    AppendOutcome::Unchanged
                } else {
                    let previous = existing.clone();
                    existing.observed_at = later;
                    existing.name = name.clone();
                    AppendOutcome::Refreshed { previous }
                }
            }
        };

        self.by_name.entry(key).or_default().insert(id);
        outcome
    }

    /// Puts `(id, folded)` back to `previous`, removing it when `None`.
    ///
    /// Only used to undo an [`append`](Self::append) inside a transaction
    /// that is being rolled back; the ledger is otherwise append-only.
    pub(crate) fn restore(&mut self, id: IdentityKey, folded: &str, previous: Option<HistoryEntry>) {
        match previous {
            Some(entry) => {
                self.by_identity
                    .entry(id)
                    .or_default()
                    .insert(folded.to_string(), entry);
                self.by_name.entry(folded.to_string()).or_default().insert(id);
            }
            None => {
                if let Some(entries) = self.by_identity.get_mut(&id) {
                    entries.remove(folded);
                    if entries.is_empty() {
                        self.by_identity.remove(&id);
                    }
                }
                if let Some(owners) = self.by_name.get_mut(folded) {
                    owners.remove(&id);
                    if owners.is_empty() {
                        self.by_name.remove(folded);
                    }
                }
            }
        }
    }

    /// All names ever observed for `id`, oldest observation first.
    ///
    /// Ties on timestamp are broken by folded name so repeated calls over the
    /// same state return identical sequences.
    #[must_use]
    pub fn all_names(&self, id: IdentityKey) -> Vec<HistoryEntry> {
        let mut out: Vec<HistoryEntry> = self
            .by_identity
            .get(&id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.name.folded().cmp(&b.name.folded()))
        });
        out
    }

    /// Names observed for `id`, in [`all_names`](Self::all_names) order.
    #[must_use]
    pub fn names_for(&self, id: IdentityKey) -> Vec<DisplayName> {
        self.all_names(id).into_iter().map(|e| e.name).collect()
    }

    /// The identity that owns `name` in history, if any.
    ///
    /// Names get recycled: when several identities have held the same name,
    /// the one that was observed with it most recently wins.
    #[must_use]
    pub fn resolve_any_name(&self, name: &str) -> Option<IdentityKey> {
        let key = fold_name(name);
        let owners = self.by_name.get(&key)?;
        owners
            .iter()
            .filter_map(|id| {
                self.by_identity
                    .get(id)
                    .and_then(|entries| entries.get(&key))
                    .map(|entry| (entry.observed_at, *id))
            })
            .max()
            .map(|(_, id)| id)
    }

    /// Returns true if `id` has ever been observed with `name`.
    #[must_use]
    pub fn contains(&self, id: IdentityKey, name: &str) -> bool {
        self.by_identity
            .get(&id)
            .is_some_and(|entries| entries.contains_key(&fold_name(name)))
    }

    /// The entry for `(id, name)`, if recorded.
    #[must_use]
    pub fn entry(&self, id: IdentityKey, name: &str) -> Option<&HistoryEntry> {
        self.by_identity.get(&id)?.get(&fold_name(name))
    }

    /// Timestamp of the most recent observation for `id`.
    #[must_use]
    pub fn latest_observation(&self, id: IdentityKey) -> Option<DateTime<Utc>> {
        self.by_identity
            .get(&id)?
            .values()
            .map(|entry| entry.observed_at)
            .max()
    }

    /// Every entry, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.by_identity.values().flat_map(BTreeMap::values)
    }

    /// Number of distinct names recorded for `id`.
    #[must_use]
    pub fn len_for(&self, id: IdentityKey) -> usize {
        self.by_identity.get(&id).map_or(0, BTreeMap::len)
    }

    /// Total number of entries across all identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_identity.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<HistoryEntry>> for HistoryLedger {
    fn from(entries: Vec<HistoryEntry>) -> Self {
        let mut ledger = Self::new();
        for entry in entries {
            ledger.append(entry.id, &entry.name, entry.observed_at);
        }
        ledger
    }
}

impl From<HistoryLedger> for Vec<HistoryEntry> {
    fn from(ledger: HistoryLedger) -> Self {
        let mut out: Vec<HistoryEntry> = ledger
            .by_identity
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect();
        out.sort_by(|a, b| {
            a.id.cmp(&b.id)
                .then_with(|| a.observed_at.cmp(&b.observed_at))
                .then_with(|| a.name.folded().cmp(&b.name.folded()))
        });
        out
    }
}
