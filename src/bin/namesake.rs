//! namesake operator CLI
//!
//! Resolves names against Mojang and PlayerDB, migrates renamed users' rows,
//! and inspects the local database. Results are printed as JSON on stdout;
//! logs go to stderr and are filtered by `NAMESAKE_LOG` (default `info`).

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use namesake::directory::{MojangProvider, PlayerDbProvider};
use namesake::{
    backfill, backfill_known, open_database, DirectoryChain, HistoryQuery, IdentityResolver,
    NamesakeConfig,
};

/// Tables keyed by username that follow a user across renames.
const DEFAULT_TABLES: &[&str] = &[
    "general_stats",
    "sheep_stats",
    "ctw_stats",
    "ww_stats",
    "user_meta",
    "user_links",
    "default_users",
    "tracked_streaks",
    "tracked_users",
    "hotbar_layouts",
];

/// namesake CLI application
#[derive(Parser)]
#[command(name = "namesake")]
#[command(about = "Identity resolution and rename migration for username-keyed records", long_about = None)]
#[command(version)]
struct Cli {
    /// Database directory
    #[arg(long, default_value = "./namesake.db", global = true)]
    db: PathBuf,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the freshness window (seconds)
    #[arg(long, global = true)]
    freshness_secs: Option<u64>,

    /// Override the per-call directory timeout (milliseconds)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Resolve a name, consulting the directory when the stored mapping is stale
    Resolve {
        /// Username to resolve
        name: String,
    },

    /// Verify a name against the directory and migrate its rows if renamed
    Sync {
        /// Username to verify
        name: String,
    },

    /// Show every name observed for a user
    History {
        /// UUID or any name the user has held
        query: String,
    },

    /// Verify many names at once
    Backfill {
        /// File with one name per line; defaults to every name in the database
        #[arg(long)]
        file: Option<PathBuf>,

        /// Parallel workers (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Fold the WAL into a snapshot
    Compact,

    /// Show database counts
    Stats,
}

fn load_config(cli: &Cli) -> Result<NamesakeConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => NamesakeConfig::from_json_file(path)?,
        None => NamesakeConfig::default(),
    };
    if let Some(secs) = cli.freshness_secs {
        config.freshness_secs = secs;
    }
    if let Some(ms) = cli.timeout_ms {
        config.directory.call_timeout_ms = ms;
    }
    if let Commands::Backfill {
        workers: Some(workers),
        ..
    } = cli.command
    {
        config.backfill_workers = workers;
    }
    Ok(config.validate()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("NAMESAKE_LOG")
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;
    let db = open_database(&cli.db, &config.storage)?;
    let store = db.store();

    match cli.command {
        Commands::Compact => return print_json(&CompactOutput::from(db.compact()?)),
        Commands::Stats => return print_json(&store.stats()?),
        _ => {}
    }

    store.with_transaction(|tx| {
        for table in DEFAULT_TABLES {
            tx.register_table(table)?;
        }
        Ok::<_, namesake::StorageError>(())
    })?;

    let directory = DirectoryChain::from_config(&config.directory)
        .with_provider(Arc::new(MojangProvider::new(&config.directory)))
        .with_provider(Arc::new(PlayerDbProvider::new(&config.directory)));
    let resolver = IdentityResolver::new(Arc::clone(&store), directory, &config)?;

    match cli.command {
        Commands::Resolve { name } => print_json(&resolver.resolve(&name)?),
        Commands::Sync { name } => print_json(&resolver.apply_rename_if_needed(&name)?),
        Commands::History { query } => {
            let query: HistoryQuery = query.parse()?;
            print_json(&resolver.history_for(&query)?)
        }
        Commands::Backfill { file, .. } => {
            let report = match file {
                Some(path) => {
                    let raw = fs::read_to_string(&path)?;
                    backfill(&resolver, raw.lines(), config.backfill_workers)
                }
                None => backfill_known(&resolver, config.backfill_workers)?,
            };
            print_json(&report)
        }
        Commands::Compact | Commands::Stats => Ok(()),
    }
}

#[derive(Serialize)]
struct CompactOutput {
    entries_compacted: u64,
    snapshot: Option<String>,
    wal_size_before: u64,
    wal_size_after: u64,
}

impl From<namesake::storage::CheckpointReport> for CompactOutput {
    fn from(report: namesake::storage::CheckpointReport) -> Self {
        Self {
            entries_compacted: report.entries_compacted,
            snapshot: report.snapshot_path.map(|p| p.display().to_string()),
            wal_size_before: report.wal_size_before,
            wal_size_after: report.wal_size_after,
        }
    }
}
