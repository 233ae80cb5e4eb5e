//! Name → identity resolution.
//!
//! The resolver answers "who is this name?" from the store while the stored
//! mapping is fresh, and from the directory chain otherwise. A directory
//! answer whose name differs from the stored one is a rename, and is handed
//! to the [`MigrationEngine`] before the caller sees the result.

use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::NamesakeConfig;
use crate::directory::{DirectoryChain, DirectoryOutcome, DirectoryProfile};
use crate::error::{DirectoryUnavailable, MigrationError, NamesakeError, NamesakeResult, ValidationError};
use crate::history::HistoryEntry;
use crate::identity::{DisplayName, Identity, IdentityKey};
use crate::locks::IdentityLocks;
use crate::migration::{MigrationEngine, MigrationReport};
use crate::storage::ConsistencyStore;

/// Where a resolution's answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// A fresh stored mapping; the directory was not consulted.
    Store,
    /// The directory confirmed or updated the mapping.
    Directory,
    /// The directory could not confirm; the stored mapping was used as is.
    StoreFallback,
}

/// A name resolved to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    /// The identity row after resolution.
    pub identity: Identity,
    /// The identity's current name. May differ from the requested name.
    pub resolved_name: DisplayName,
    /// True if the directory reported a different name than the store held.
    pub rename_detected: bool,
    /// The migration run for a detected rename.
    pub migration: Option<MigrationReport>,
    /// Where the answer came from.
    pub source: ResolutionSource,
    /// The provider that answered, for directory answers.
    pub provider: Option<String>,
    /// Why the directory was skipped, for fallback answers.
    pub warning: Option<DirectoryUnavailable>,
}

impl ResolvedIdentity {
    fn stored(identity: Identity, source: ResolutionSource, warning: Option<DirectoryUnavailable>) -> Self {
        Self {
            resolved_name: identity.current_name.clone(),
            identity,
            rename_detected: false,
            migration: None,
            source,
            provider: None,
            warning,
        }
    }

    /// The stable key.
    #[must_use]
    pub const fn id(&self) -> IdentityKey {
        self.identity.id
    }
}

/// Outcome of [`IdentityResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    /// The name belongs to a known identity.
    Resolved(ResolvedIdentity),
    /// Neither the store nor the directory knows the name.
    NotFound,
}

impl Resolution {
    /// The resolved identity, if any.
    #[must_use]
    pub const fn resolved(&self) -> Option<&ResolvedIdentity> {
        match self {
            Self::Resolved(r) => Some(r),
            Self::NotFound => None,
        }
    }

    /// Consumes the resolution, returning the resolved identity if any.
    #[must_use]
    pub fn into_resolved(self) -> Option<ResolvedIdentity> {
        match self {
            Self::Resolved(r) => Some(r),
            Self::NotFound => None,
        }
    }

    /// Returns true for [`Resolution::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Outcome of [`IdentityResolver::apply_rename_if_needed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameCheck {
    /// The verified resolution.
    pub resolution: Resolution,
    /// Rows swept from the requested (historical) name, if any.
    pub sweep: Option<MigrationReport>,
}

/// Argument to [`IdentityResolver::history_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryQuery {
    /// A stable key.
    Key(IdentityKey),
    /// Any name the identity has held.
    Name(DisplayName),
}

impl FromStr for HistoryQuery {
    type Err = ValidationError;

    /// UUIDs (dashed or 32-hex) parse as keys; anything else as a name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if IdentityKey::looks_like_key(s) {
            s.parse().map(Self::Key)
        } else {
            DisplayName::new(s).map(Self::Name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verify {
    IfStale,
    Always,
}

/// Resolves names to identities and keeps the store in step with the
/// directory.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    store: Arc<ConsistencyStore>,
    directory: DirectoryChain,
    engine: MigrationEngine,
    clock: Arc<dyn Clock>,
    freshness: chrono::Duration,
    name_pattern: Regex,
}

impl IdentityResolver {
    /// Creates a resolver with its own lock table and the system clock.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if `config` is invalid.
    pub fn new(
        store: Arc<ConsistencyStore>,
        directory: DirectoryChain,
        config: &NamesakeConfig,
    ) -> Result<Self, ValidationError> {
        let config = config.clone().validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let locks = Arc::new(IdentityLocks::new());
        Ok(Self {
            engine: MigrationEngine::new(Arc::clone(&store), locks, Arc::clone(&clock)),
            store,
            directory,
            clock,
            freshness: config.freshness(),
            name_pattern: config.compile_name_pattern()?,
        })
    }

    /// Replaces the clock used for freshness and history timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.engine = MigrationEngine::new(
            Arc::clone(&self.store),
            Arc::clone(self.engine.locks()),
            Arc::clone(&clock),
        );
        self.clock = clock;
        self
    }

    /// Shares `locks` with other components working on the same store.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<IdentityLocks>) -> Self {
        self.engine = MigrationEngine::new(Arc::clone(&self.store), locks, Arc::clone(&self.clock));
        self
    }

    /// The migration engine, sharing this resolver's locks and clock.
    #[must_use]
    pub const fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &Arc<ConsistencyStore> {
        &self.store
    }

    /// Checks `raw` against the display name rules and the configured pattern.
    ///
    /// # Errors
    ///
    /// Returns the first rule `raw` violates.
    pub fn validate_name(&self, raw: &str) -> Result<DisplayName, ValidationError> {
        let name = DisplayName::new(raw)?;
        if !self.name_pattern.is_match(name.as_str()) {
            return Err(ValidationError::NameRejectedByPolicy {
                name: name.into(),
                pattern: self.name_pattern.as_str().to_string(),
            });
        }
        Ok(name)
    }

    /// Resolves `name`, consulting the directory only when the stored mapping
    /// is missing or older than the freshness window.
    ///
    /// A directory outage is not an error: the stored mapping is returned with
    /// [`ResolutionSource::StoreFallback`], or [`Resolution::NotFound`] if
    /// there is none.
    ///
    /// # Errors
    ///
    /// - validation errors for malformed names
    /// - [`MigrationError::Conflict`] if the directory assigns the name's
    ///   holder a name another identity is active under
    /// - [`MigrationError::Failed`] and storage errors if a write failed
    pub fn resolve(&self, name: &str) -> NamesakeResult<Resolution> {
        self.run(name, Verify::IfStale).map(|check| check.resolution)
    }

    /// Verifies `name` against the directory regardless of freshness, then
    /// moves any rows still filed under it to the identity's current name.
    ///
    /// This is the per-request entry point for callers about to read or
    /// write rows keyed by `name`.
    ///
    /// # Errors
    ///
    /// As [`resolve`](Self::resolve).
    pub fn apply_rename_if_needed(&self, name: &str) -> NamesakeResult<RenameCheck> {
        self.run(name, Verify::Always)
    }

    /// Every name observed for an identity, oldest first.
    ///
    /// Names are resolved locally, through the current and historical name
    /// indexes. Unknown names and keys yield an empty list.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is unreadable.
    pub fn history_for(&self, query: &HistoryQuery) -> NamesakeResult<Vec<HistoryEntry>> {
        let key = match query {
            HistoryQuery::Key(key) => Some(*key),
            HistoryQuery::Name(name) => self.local_key(name)?,
        };
        match key {
            Some(key) => Ok(self.store.history(key)?),
            None => Ok(Vec::new()),
        }
    }

    fn local_key(&self, name: &DisplayName) -> NamesakeResult<Option<IdentityKey>> {
        if let Some(identity) = self.store.identity_by_name(name.as_str())? {
            return Ok(Some(identity.id));
        }
        Ok(self.store.resolve_any_name(name.as_str())?)
    }

    fn run(&self, raw: &str, verify: Verify) -> NamesakeResult<RenameCheck> {
        let requested = self.validate_name(raw)?;
        let local = self.local_key(&requested)?;

        if verify == Verify::IfStale {
            if let Some(key) = local {
                let _guard = self.engine.locks().lock(key);
                if let Some(identity) = self.store.identity(key)? {
                    if !identity.is_stale(self.clock.now(), self.freshness) {
                        tracing::debug!(name = %requested, identity = %key, "fresh stored mapping");
                        return Ok(RenameCheck {
                            resolution: Resolution::Resolved(ResolvedIdentity::stored(
                                identity,
                                ResolutionSource::Store,
                                None,
                            )),
                            sweep: None,
                        });
                    }
                }
            }
        }

        let sweep_from = (verify == Verify::Always).then_some(&requested);
        match self.directory.lookup(requested.as_str()) {
            DirectoryOutcome::Found { profile, provider } => self.reconcile(profile, provider, sweep_from),
            DirectoryOutcome::NotFound => {
                let Some(key) = local else {
                    tracing::debug!(name = %requested, "name unknown to store and directory");
                    return Ok(not_found());
                };
                // The name may be one this identity has since given up.
                match self.directory.lookup_by_key(key) {
                    DirectoryOutcome::Found { profile, provider } if profile.id == key => {
                        self.reconcile(profile, provider, sweep_from)
                    }
                    DirectoryOutcome::Unavailable(e) => self.fallback(key, Some(e)),
                    _ => self.fallback(key, None),
                }
            }
            DirectoryOutcome::Unavailable(e) => match local {
                Some(key) => self.fallback(key, Some(e)),
                None => {
                    tracing::warn!(name = %requested, error = %e, "directory unavailable and name not stored");
                    Ok(not_found())
                }
            },
        }
    }

    /// Brings the store in line with what the directory reported.
    fn reconcile(
        &self,
        profile: DirectoryProfile,
        provider: String,
        sweep_from: Option<&DisplayName>,
    ) -> NamesakeResult<RenameCheck> {
        let id = profile.id;
        let guard = self.engine.locks().lock(id);
        let stored = self.store.identity(id)?;

        let (migration, rename_detected) = match stored {
            Some(stored) if !stored.current_name.eq_folded(profile.name.as_str()) => {
                tracing::info!(identity = %id, old = %stored.current_name, new = %profile.name, "rename detected");
                let report = self
                    .engine
                    .apply_rename_locked(&guard, id, &stored.current_name, &profile.name)?;
                (Some(report), true)
            }
            Some(_) => {
                self.record_verified(&profile)?;
                (None, false)
            }
            None => {
                self.record_verified(&profile)?;
                tracing::info!(identity = %id, name = %profile.name, provider = %provider, "identity linked");
                (None, false)
            }
        };

        let sweep = match sweep_from {
            Some(old) if !old.eq_folded(profile.name.as_str()) => {
                let report = self.engine.apply_rename_locked(&guard, id, old, &profile.name)?;
                report.is_applied().then_some(report)
            }
            _ => None,
        };

        let identity = self
            .store
            .identity(id)?
            .ok_or_else(|| NamesakeError::internal(format!("identity {id} missing after reconcile")))?;
        Ok(RenameCheck {
            resolution: Resolution::Resolved(ResolvedIdentity {
                resolved_name: identity.current_name.clone(),
                identity,
                rename_detected,
                migration,
                source: ResolutionSource::Directory,
                provider: Some(provider),
                warning: None,
            }),
            sweep,
        })
    }

    /// Links or refreshes `profile` without moving rows.
    fn record_verified(&self, profile: &DirectoryProfile) -> NamesakeResult<()> {
        let now = self.clock.now();
        self.store.with_transaction(|tx| {
            if let Some(holder) = tx.identity_by_name(profile.name.as_str()) {
                if holder.id != profile.id {
                    return Err(NamesakeError::from(MigrationError::Conflict {
                        name: profile.name.clone(),
                        holder: holder.id,
                        requester: profile.id,
                    }));
                }
            }
            tx.upsert_identity(Identity::new(profile.id, profile.name.clone(), now))?;
            tx.append_history(profile.id, &profile.name, now)?;
            Ok(())
        })
    }

    fn fallback(&self, key: IdentityKey, warning: Option<DirectoryUnavailable>) -> NamesakeResult<RenameCheck> {
        let _guard = self.engine.locks().lock(key);
        let Some(identity) = self.store.identity(key)? else {
            return Ok(not_found());
        };
        if let Some(e) = &warning {
            tracing::warn!(identity = %key, name = %identity.current_name, error = %e, "using stored mapping");
        }
        Ok(RenameCheck {
            resolution: Resolution::Resolved(ResolvedIdentity::stored(
                identity,
                ResolutionSource::StoreFallback,
                warning,
            )),
            sweep: None,
        })
    }
}

fn not_found() -> RenameCheck {
    RenameCheck {
        resolution: Resolution::NotFound,
        sweep: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::directory::{MemoryDirectory, RetryPolicy};

    fn name(s: &str) -> DisplayName {
        DisplayName::new(s).unwrap()
    }

    struct Fixture {
        resolver: IdentityResolver,
        directory: Arc<MemoryDirectory>,
        clock: Arc<ManualClock>,
        store: Arc<ConsistencyStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ConsistencyStore::in_memory());
        store.register_table("general_stats").unwrap();
        let directory = Arc::new(MemoryDirectory::new("mem"));
        let chain = DirectoryChain::new(RetryPolicy::no_retry(), Duration::from_secs(2))
            .with_provider(directory.clone());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let resolver = IdentityResolver::new(Arc::clone(&store), chain, &NamesakeConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        Fixture {
            resolver,
            directory,
            clock,
            store,
        }
    }

    #[test]
    fn rejects_names_outside_the_pattern() {
        let f = fixture();
        let err = f.resolver.resolve("way_too_long_for_minecraft").unwrap_err();
        assert!(err.is_validation());
        assert!(f.resolver.resolve("  ").unwrap_err().is_validation());
    }

    #[test]
    fn first_hit_links_identity_with_directory_casing() {
        let f = fixture();
        let id = IdentityKey::random();
        f.directory.insert(id, name("DaJJay"));

        let resolved = f.resolver.resolve("dajjay").unwrap().into_resolved().unwrap();
        assert_eq!(resolved.id(), id);
        assert_eq!(resolved.resolved_name.as_str(), "DaJJay");
        assert_eq!(resolved.source, ResolutionSource::Directory);
        assert_eq!(resolved.provider.as_deref(), Some("mem"));
        assert_eq!(f.store.history(id).unwrap().len(), 1);
    }

    #[test]
    fn fresh_mapping_skips_the_directory() {
        let f = fixture();
        f.directory.insert(IdentityKey::random(), name("DaJJay"));
        f.resolver.resolve("DaJJay").unwrap();
        let calls = f.directory.calls();

        let again = f.resolver.resolve("DaJJay").unwrap().into_resolved().unwrap();
        assert_eq!(again.source, ResolutionSource::Store);
        assert_eq!(f.directory.calls(), calls);

        f.clock.advance(chrono::Duration::minutes(16));
        let stale = f.resolver.resolve("DaJJay").unwrap().into_resolved().unwrap();
        assert_eq!(stale.source, ResolutionSource::Directory);
    }

    #[test]
    fn casing_change_refreshes_without_rename() {
        let f = fixture();
        let id = IdentityKey::random();
        f.directory.insert(id, name("dajjay"));
        f.resolver.resolve("dajjay").unwrap();
        f.store.insert_record("general_stats", &name("dajjay"), json!(null)).unwrap();

        f.directory.rename(id, name("DaJJay"));
        f.clock.advance(chrono::Duration::hours(1));
        let resolved = f.resolver.resolve("DAJJAY").unwrap().into_resolved().unwrap();
        assert!(!resolved.rename_detected);
        assert!(resolved.migration.is_none());
        assert_eq!(resolved.identity.current_name.as_str(), "DaJJay");
        assert_eq!(f.store.history(id).unwrap().len(), 1);
        assert_eq!(f.store.count_dependents("DaJJay").unwrap().total, 1);
    }

    #[test]
    fn old_name_resolves_by_key_and_migrates() {
        let f = fixture();
        let id = IdentityKey::random();
        f.directory.insert(id, name("DaJJay"));
        f.resolver.resolve("DaJJay").unwrap();
        f.store.insert_record("general_stats", &name("DaJJay"), json!(null)).unwrap();

        f.directory.rename(id, name("Jyyroh"));
        f.clock.advance(chrono::Duration::hours(1));
        let resolved = f.resolver.resolve("DaJJay").unwrap().into_resolved().unwrap();
        assert!(resolved.rename_detected);
        assert_eq!(resolved.resolved_name.as_str(), "Jyyroh");
        assert_eq!(resolved.migration.unwrap().total_rows(), 1);
        assert_eq!(f.store.count_dependents("Jyyroh").unwrap().total, 1);
    }

    #[test]
    fn apply_rename_if_needed_sweeps_historical_rows() {
        let f = fixture();
        let id = IdentityKey::random();
        f.directory.insert(id, name("DaJJay"));
        f.resolver.resolve("DaJJay").unwrap();
        f.directory.rename(id, name("Jyyroh"));
        f.clock.advance(chrono::Duration::seconds(1));
        f.resolver.apply_rename_if_needed("Jyyroh").unwrap();

        f.store.insert_record("general_stats", &name("DaJJay"), json!(null)).unwrap();
        let check = f.resolver.apply_rename_if_needed("DaJJay").unwrap();
        let sweep = check.sweep.unwrap();
        assert_eq!(sweep.from, vec![name("DaJJay")]);
        assert_eq!(f.store.count_dependents("DaJJay").unwrap().total, 0);
        assert_eq!(f.store.count_dependents("Jyyroh").unwrap().total, 1);
    }

    #[test]
    fn outage_falls_back_to_stored_mapping() {
        let f = fixture();
        let id = IdentityKey::random();
        f.directory.insert(id, name("DaJJay"));
        f.resolver.resolve("DaJJay").unwrap();

        f.directory.set_offline(true);
        let resolved = f
            .resolver
            .apply_rename_if_needed("DaJJay")
            .unwrap()
            .resolution
            .into_resolved()
            .unwrap();
        assert_eq!(resolved.source, ResolutionSource::StoreFallback);
        assert!(resolved.warning.is_some());

        assert!(f.resolver.resolve("Unknown").unwrap().is_not_found());
    }

    #[test]
    fn history_query_parses_keys_and_names() {
        let key: HistoryQuery = "853c80ef-3c37-49fd-aa49-938b674adae6".parse().unwrap();
        assert!(matches!(key, HistoryQuery::Key(_)));
        let by_name: HistoryQuery = "DaJJay".parse().unwrap();
        assert_eq!(by_name, HistoryQuery::Name(name("DaJJay")));

        let f = fixture();
        assert!(f.resolver.history_for(&by_name).unwrap().is_empty());
    }
}
