//! Batch re-verification of many names.
//!
//! Each name goes through [`IdentityResolver::apply_rename_if_needed`], so
//! backfill takes the same per-identity locks as live traffic and can run
//! alongside it. Names are de-duplicated by case-fold before any work starts.

use std::collections::HashSet;
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use serde::Serialize;

use crate::error::{NamesakeResult, NamesakeError};
use crate::identity::fold_name;
use crate::resolver::{IdentityResolver, RenameCheck, Resolution, ResolutionSource};

/// A name that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillFailure {
    /// The name as given.
    pub name: String,
    /// Rendered error.
    pub error: String,
    /// Whether running the name again may succeed.
    pub retryable: bool,
}

/// Totals for one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Distinct names attempted.
    pub processed: usize,
    /// Names that resolved to an identity.
    pub resolved: usize,
    /// Resolutions that detected a rename.
    pub renamed: usize,
    /// Names unknown to both the store and the directory.
    pub not_found: usize,
    /// Resolutions served from the store because the directory was down.
    pub degraded: usize,
    /// Names rejected by validation.
    pub skipped: usize,
    /// Dependent rows moved, across renames and sweeps.
    pub migrated_rows: usize,
    /// Names that failed, sorted by name.
    pub failures: Vec<BackfillFailure>,
}

impl BackfillReport {
    fn record(&mut self, name: &str, outcome: NamesakeResult<RenameCheck>) {
        self.processed += 1;
        match outcome {
            Ok(check) => {
                if let Some(sweep) = &check.sweep {
                    self.migrated_rows += sweep.total_rows();
                }
                match check.resolution {
                    Resolution::Resolved(resolved) => {
                        self.resolved += 1;
                        if resolved.rename_detected {
                            self.renamed += 1;
                        }
                        if resolved.source == ResolutionSource::StoreFallback {
                            self.degraded += 1;
                        }
                        if let Some(migration) = &resolved.migration {
                            self.migrated_rows += migration.total_rows();
                        }
                    }
                    Resolution::NotFound => self.not_found += 1,
                }
            }
            Err(e) if e.is_validation() => {
                tracing::debug!(name, error = %e, "backfill skipped invalid name");
                self.skipped += 1;
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "backfill failed for name");
                self.failures.push(failure(name, &e));
            }
        }
    }

    /// Returns true if every name was processed without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn failure(name: &str, e: &NamesakeError) -> BackfillFailure {
    BackfillFailure {
        name: name.to_string(),
        error: e.to_string(),
        retryable: e.is_retryable(),
    }
}

fn dedupe<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|n| n.as_ref().trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(fold_name(n)))
        .collect()
}

/// Verifies every name in `names` with up to `workers` threads.
///
/// `workers <= 1` processes names one at a time on the calling thread.
/// Per-name failures are collected in the report rather than aborting the
/// run.
pub fn backfill<I, S>(resolver: &IdentityResolver, names: I, workers: usize) -> BackfillReport
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let queue = dedupe(names);
    let workers = workers.clamp(1, queue.len().max(1));
    tracing::info!(names = queue.len(), workers, "backfill started");

    let mut report = BackfillReport::default();
    if workers == 1 {
        for name in &queue {
            report.record(name, resolver.apply_rename_if_needed(name));
        }
    } else {
        run_pool(resolver, queue, workers, &mut report);
    }

    report.failures.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::info!(
        processed = report.processed,
        resolved = report.resolved,
        renamed = report.renamed,
        not_found = report.not_found,
        degraded = report.degraded,
        failures = report.failures.len(),
        "backfill finished"
    );
    report
}

/// Runs [`backfill`] over every name the store knows.
///
/// # Errors
///
/// Returns a storage error if the store cannot be read.
pub fn backfill_known(resolver: &IdentityResolver, workers: usize) -> NamesakeResult<BackfillReport> {
    let names = resolver.store().known_names()?;
    Ok(backfill(resolver, names, workers))
}

fn run_pool(resolver: &IdentityResolver, queue: Vec<String>, workers: usize, report: &mut BackfillReport) {
    let (job_tx, job_rx) = bounded::<String>(workers * 2);
    let (result_tx, result_rx) = unbounded::<(String, NamesakeResult<RenameCheck>)>();

    thread::scope(|scope| {
        let mut spawned = 0usize;
        for i in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("namesake-backfill-{i}"))
                .spawn_scoped(scope, move || {
                    for name in jobs {
                        let outcome = resolver.apply_rename_if_needed(&name);
                        if results.send((name, outcome)).is_err() {
                            break;
                        }
                    }
                });
            match handle {
                Ok(_) => spawned += 1,
                Err(e) => tracing::warn!(worker = i, error = %e, "failed to spawn backfill worker"),
            }
        }
        drop(job_rx);
        drop(result_tx);

        if spawned == 0 {
            for name in &queue {
                report.record(name, resolver.apply_rename_if_needed(name));
            }
            return;
        }

        for name in queue {
            if let Err(unsent) = job_tx.send(name) {
                // Every worker has exited.
                let name = unsent.into_inner();
                report.record(&name, resolver.apply_rename_if_needed(&name));
            }
        }
        drop(job_tx);

        for (name, outcome) in result_rx {
            report.record(&name, outcome);
        }
    });
}
