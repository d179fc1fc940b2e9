use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scrobble_sync::database_ops::loader::{LoadStrategy, DEFAULT_BATCH_SIZE};
use scrobble_sync::database_ops::memory_store::MemoryStore;
use scrobble_sync::database_ops::pg_store::PgStore;
use scrobble_sync::database_ops::store::CatalogStore;
use scrobble_sync::lastfm::{LastFmClient, DEFAULT_BASE_URL};
use scrobble_sync::logging::init_tracing;
use scrobble_sync::orchestrator::{SyncConfig, SyncError, SyncMode, SyncOrchestrator, SyncSummary};
use scrobble_sync::progress::{Progress, ProgressFn, Stage};
use scrobble_sync::util::env::{self, env_opt, env_parse, env_req, preflight_check};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "scrobble-sync",
    version,
    about = "Sync a Last.fm listening history into Postgres"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Fetch plays newer than the latest stored one and load them
    Sync(RunArgs),
    /// Fetch and load the entire history
    Backfill(RunArgs),
    /// Print the latest stored play timestamp
    Watermark {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Print row counts and integrity counters for the catalog tables
    Counts {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Load strategy: per-record, batched or copy
    #[arg(long)]
    strategy: Option<String>,
    /// Rows per statement for the batched strategy
    #[arg(long)]
    batch_size: Option<usize>,
    /// Concurrent page requests per fetch group
    #[arg(long)]
    parallelism: Option<usize>,
    /// Load into an in-memory store instead of Postgres and print the summary
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => run_sync(SyncMode::Incremental, args).await,
        Commands::Backfill(args) => run_sync(SyncMode::Backfill, args).await,
        Commands::Watermark { db_url } => {
            let store = connect_store(db_url).await?;
            match store.latest_played_at().await? {
                Some(at) => println!("{} ({})", at.to_rfc3339(), at.timestamp()),
                None => println!("no plays stored"),
            }
            Ok(())
        }
        Commands::Counts { db_url } => {
            let store = connect_store(db_url).await?;
            let counts = store.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
    }
}

async fn connect_store(db_url: Option<String>) -> Result<PgStore> {
    let url = match db_url {
        Some(url) => url,
        None => env::db_url()?,
    };
    let max_connections: u32 = env_parse("DB_MAX_CONNS", 5u32);
    PgStore::connect(&url, max_connections)
        .await
        .context("connecting to postgres")
}

fn apply_overrides(config: &mut SyncConfig, args: &RunArgs) -> Result<()> {
    if let Some(raw) = &args.strategy {
        let strategy: LoadStrategy = raw.parse()?;
        // A bare strategy name keeps the batch size already configured.
        let configured = env_parse("LOAD_BATCH_SIZE", DEFAULT_BATCH_SIZE);
        let keep = |current: LoadStrategy| current.batch_size().unwrap_or(configured);
        config.incremental_strategy = strategy.with_batch_size(keep(config.incremental_strategy));
        config.backfill_strategy = strategy.with_batch_size(keep(config.backfill_strategy));
    }
    if let Some(size) = args.batch_size {
        config.incremental_strategy = config.incremental_strategy.with_batch_size(size);
        config.backfill_strategy = config.backfill_strategy.with_batch_size(size);
    }
    if let Some(parallelism) = args.parallelism {
        config.fetch.parallelism = parallelism;
    }
    Ok(())
}

fn log_progress() -> ProgressFn {
    Arc::new(|p: Progress| match p.stage {
        Stage::Fetch => info!(
            pages_done = p.done,
            pages_total = p.total,
            records = p.accumulated,
            "fetch progress"
        ),
        Stage::Load(kind) => info!(
            entity = %kind,
            done = p.done,
            total = p.total,
            written = p.accumulated,
            "load progress"
        ),
    })
}

fn print_summary(summary: &SyncSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

async fn run_sync(mode: SyncMode, args: RunArgs) -> Result<()> {
    preflight_check(
        "scrobble-sync",
        &["LASTFM_API_KEY", "LASTFM_USERNAME"],
        &[
            "LASTFM_USERNAME",
            "LASTFM_API_KEY",
            "LASTFM_BASE_URL",
            "DATABASE_URL",
            "INCREMENTAL_STRATEGY",
            "BACKFILL_STRATEGY",
            "LOAD_BATCH_SIZE",
            "FETCH_PARALLELISM",
            "FAST_INGEST",
        ],
    )?;

    let mut config = SyncConfig::from_env()?;
    apply_overrides(&mut config, &args)?;

    let client = LastFmClient::new(
        env_opt("LASTFM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        env_req("LASTFM_API_KEY")?,
        env_req("LASTFM_USERNAME")?,
        config.fetch.page_timeout,
    )?;
    info!(user = client.username(), ?mode, dry_run = args.dry_run, "starting");

    let store: Arc<dyn CatalogStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(connect_store(args.db_url.clone()).await?)
    };
    let sync = SyncOrchestrator::new(store, Arc::new(client), config);

    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling sync");
            trip.cancel();
        }
    });

    let progress = Some(log_progress());
    let result = match mode {
        SyncMode::Incremental => sync.incremental(progress, cancel).await,
        SyncMode::Backfill => sync.backfill(None, progress, cancel).await,
    };

    match result {
        Ok(summary) => print_summary(&summary),
        Err(e) => {
            if let Some(summary) = e.summary() {
                print_summary(summary)?;
            }
            match e {
                SyncError::Cancelled { .. } => {
                    warn!("sync cancelled");
                    std::process::exit(130);
                }
                other => Err(other.into()),
            }
        }
    }
}
