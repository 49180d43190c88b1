//! bibrec-migrator - Legacy record migration CLI
//!
//! Commands:
//! - `migrate file <PATH>`: split, convert, upsert and index a legacy export
//! - `migrate mirror`: re-drive staged or broken mirror rows
//! - `count-citations`: recompute `citation_count` over the whole corpus
//! - `mirror-status`: mirror row outcome counts and frequent errors
//!
//! Exit codes: 0 success, 1 unrecoverable error, 2 safety-check refusal.
//! Individual record failures never change the exit code.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bibrec_common::config::{RootFolderInitializer, RootFolderResolver, TomlConfig};
use bibrec_migrator::citations::CitationAggregator;
use bibrec_migrator::converter::MarcXmlConverter;
use bibrec_migrator::db::mirror::{self, MirrorSelection};
use bibrec_migrator::index::{IndexerBridge, SearchIndex, SqliteIndex};
use bibrec_migrator::pipeline::{
    write_broken_output, Dispatch, MigrationPipeline, RunOptions, RunOutcome, RunSummary, Source,
};
use bibrec_migrator::PipelineError;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for bibrec-migrator
#[derive(Parser, Debug)]
#[command(name = "bibrec-migrator")]
#[command(about = "Migrate legacy bibliographic records into the canonical store")]
#[command(version)]
struct Args {
    /// Bootstrap TOML configuration file
    #[arg(long, env = "BIBREC_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database (overrides BIBREC_ROOT_FOLDER and TOML)
    #[arg(long)]
    root_folder: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (overrides TOML)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a migration
    #[command(subcommand)]
    Migrate(MigrateCommand),

    /// Recompute citation counts over the full corpus
    CountCitations,

    /// Show mirror row outcomes
    MirrorStatus,
}

#[derive(Subcommand, Debug)]
enum MigrateCommand {
    /// Migrate a legacy export (plain, gzip, or tar archive)
    File {
        path: PathBuf,

        /// Run even if the configuration is not production-safe
        #[arg(long)]
        force: bool,

        /// Wait for every chunk and report the full summary
        #[arg(long)]
        wait: bool,

        /// Only stage mirror rows; do not touch the canonical store
        #[arg(long)]
        mirror_only: bool,
    },

    /// Re-migrate mirror rows (by default those not yet migrated successfully)
    Mirror {
        /// Re-migrate every mirror row
        #[arg(long, conflicts_with = "broken_output")]
        all: bool,

        /// After the run, write still-broken records to this file
        #[arg(long)]
        broken_output: Option<PathBuf>,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let bootstrap_level = args.log_level.as_deref().unwrap_or("info");
    let config = match load_config(args.config.as_deref(), bootstrap_level, std::io::stdout) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    // RUST_LOG wins, then --log-level, then [logging] level
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(log_filter(&level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        built = env!("BUILD_TIMESTAMP"),
        profile = env!("BUILD_PROFILE"),
        "Starting bibrec-migrator"
    );

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let refused = err
                .downcast_ref::<PipelineError>()
                .is_some_and(PipelineError::is_safety_refusal);
            error!("{:#}", err);
            if refused {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

async fn run(args: Args, config: TomlConfig) -> Result<()> {
    // Step 1: Resolve root folder (CLI, env, TOML, OS default)
    let root_folder = RootFolderResolver::new(args.root_folder.clone(), &config).resolve();

    // Step 2: Create root folder directory if missing
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    // Step 3: Open or create database
    let db_path = initializer.database_path(&config);
    info!("Database: {}", db_path.display());
    let pool = bibrec_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let index: Arc<dyn SearchIndex> = Arc::new(
        SqliteIndex::open(pool.clone())
            .await
            .context("Failed to open search index")?,
    );

    match args.command {
        Command::Migrate(command) => migrate(command, pool, index, &config).await,
        Command::CountCitations => {
            let aggregator =
                CitationAggregator::new(pool, IndexerBridge::new(index), config.citations.clone());
            let report = aggregator.run().await?;
            println!(
                "Citations: {} documents scanned, {} counts written, {} failed, {} references skipped, {} targets unresolved",
                report.scanned,
                report.written.indexed,
                report.written.failed,
                report.skipped_refs,
                report.unresolved_targets
            );
            Ok(())
        }
        Command::MirrorStatus => mirror_status(&pool).await,
    }
}

async fn migrate(
    command: MigrateCommand,
    pool: SqlitePool,
    index: Arc<dyn SearchIndex>,
    config: &TomlConfig,
) -> Result<()> {
    let (source, force, wait, broken_output) = match command {
        MigrateCommand::File {
            path,
            force,
            wait,
            mirror_only,
        } => (Source::File { path, mirror_only }, force, wait, None),
        MigrateCommand::Mirror {
            all,
            broken_output,
            force,
            wait,
        } => {
            let selection = if all {
                MirrorSelection::All
            } else {
                MirrorSelection::Unmigrated
            };
            (Source::Mirror(selection), force, wait, broken_output)
        }
    };

    let converter = Arc::new(MarcXmlConverter::new(config.records.base_url.clone()));
    let pipeline = MigrationPipeline::new(pool.clone(), converter, index, config);

    // Ctrl+C stops dispatch; chunks already running finish
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, no further chunks will be dispatched");
            cancel.cancel();
        }
    });

    let options = RunOptions {
        dispatch: if wait { Dispatch::Join } else { Dispatch::Detached },
        force,
    };

    match pipeline.run(source, options).await? {
        RunOutcome::Completed(summary) => print_summary(&summary),
        RunOutcome::Detached(handle) => {
            println!("Scheduled {} chunks", handle.scheduled_chunks());
            // The process cannot outlive its own tasks
            info!("Draining in-flight chunks before exit");
            handle.join().await?;
        }
    }

    if let Some(path) = broken_output {
        let written = write_broken_output(&pool, &path).await?;
        println!("Wrote {} broken records to {}", written, path.display());
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Migrated {} of {} records in {} chunks ({} failed, {} unparseable, {} staged only)",
        summary.migrated,
        summary.records,
        summary.chunks,
        summary.failed,
        summary.parse_failures,
        summary.staged
    );
    println!(
        "Indexed {} documents ({} stale, {} failed)",
        summary.index.indexed, summary.index.stale, summary.index.failed
    );
    if summary.cancelled {
        println!("Run was cancelled before the source was exhausted");
    }
}

/// Load configuration under a bootstrap subscriber
///
/// The configured subscriber depends on `[logging]`, so it cannot be
/// installed until loading is done.
fn load_config<W>(path: Option<&Path>, level: &str, writer: W) -> bibrec_common::Result<TomlConfig>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(log_filter(level))
        .with_writer(writer)
        .finish();
    tracing::subscriber::with_default(bootstrap, || TomlConfig::load(path))
}

fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

async fn mirror_status(pool: &SqlitePool) -> Result<()> {
    let counts = mirror::counts(pool).await?;
    println!(
        "Mirror: {} rows ({} valid, {} invalid, {} pending)",
        counts.total(),
        counts.valid,
        counts.invalid,
        counts.pending
    );

    for (message, n) in mirror::top_errors(pool, 10).await? {
        println!("{:>8}  {}", n, message);
    }

    Ok(())
}
