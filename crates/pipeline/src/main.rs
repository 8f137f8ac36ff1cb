//! spinsync - incremental music NFT ingestion
//!
//! This binary provides:
//! - The polling ingestion service
//! - A single run to fixpoint
//! - Status, error listing and manual resets for operators

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spinsync_pipeline::clients::{Clients, HttpMetadataSource, RpcChainSource};
use spinsync_pipeline::config::{Config, LoggingConfig};
use spinsync_pipeline::merge::MergeEngine;
use spinsync_pipeline::processors::default_processors;
use spinsync_pipeline::runner::{poll_loop, Runner};
use spinsync_pipeline::storage::{ErrorFilter, Storage};
use spinsync_pipeline::Table;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spinsync")]
#[command(version, about = "Incremental ingestion pipeline for music NFTs", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "spinsync.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on an interval until Ctrl+C
    Run,

    /// Run the pipeline once, until it catches up or hits a bound
    RunOnce,

    /// Show cursors, mempool and table counts
    Status,

    /// Initialize the database
    InitDb {
        /// Database URL
        #[arg(long, default_value = "sqlite://spinsync.db")]
        database_url: String,
    },

    /// List active error annotations
    Errors {
        /// Only this table (e.g. nfts, artists)
        #[arg(long)]
        table: Option<String>,
    },

    /// Reset one entity's error annotation and partial output
    Reset {
        /// Table of the entity
        table: String,
        /// Entity id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read.
    let logging = Config::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.debug, &logging)?;

    info!("spinsync starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&cli.config).await?,
        Commands::RunOnce => run_once(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb { database_url } => init_database(&database_url).await?,
        Commands::Errors { table } => list_errors(&cli.config, table.as_deref()).await?,
        Commands::Reset { table, id } => reset_entity(&cli.config, &table, &id).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("spinsync_pipeline=debug,spinsync=debug,sqlx=warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "spinsync_pipeline={level},spinsync={level}",
                level = logging.level
            ))
        })
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }

    Ok(())
}

async fn open_storage(config: &Config) -> Result<Storage> {
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await
    .context("Failed to connect to database")?
    .with_register_capacity(config.merge.max_register_bytes);

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    Ok(storage)
}

async fn build_clients(config: &Config, storage: Storage) -> Result<Clients> {
    let chain = RpcChainSource::new(&config.chain.rpc_url, config.chain.chain_id)
        .await
        .context("Failed to create RPC provider")?;
    let metadata = HttpMetadataSource::new(
        config.metadata.ipfs_gateway.clone(),
        config.metadata.max_bytes,
        config.metadata.timeout_secs,
    )?;

    Ok(Clients::new(storage, Arc::new(chain), Arc::new(metadata)))
}

fn build_runner(config: &Config, storage: &Storage) -> Runner {
    let merge = MergeEngine::new(storage.clone(), config.merge.source_priority.clone())
        .with_orphan_timeout(Duration::from_secs(config.merge.orphan_after_secs));
    Runner::new(merge, config.runner.limits())
}

/// Polling service, stopped by Ctrl+C after the current batch
async fn run_service(config_path: &str) -> Result<()> {
    info!("Starting pipeline with config: {}", config_path);

    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    info!("Configuration loaded successfully");
    info!("  Chain ID: {}", config.chain.chain_id);
    info!("  Database: {}", config.database.url);
    info!("  Factories: {}", config.seeds.nft_factories.len());

    let storage = open_storage(&config).await?;
    let clients = build_clients(&config, storage.clone()).await?;
    let processors = default_processors(&config);

    let cancel = CancellationToken::new();
    let runner = build_runner(&config, &storage).with_cancellation(cancel.clone());

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal, finishing current batch..."),
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
            cancel.cancel();
        }
    });

    info!("Pipeline is running. Press Ctrl+C to stop.");
    let result = poll_loop(
        &runner,
        &processors,
        &clients,
        Duration::from_secs(config.runner.poll_interval_secs),
        cancel,
    )
    .await;

    storage.close().await;
    result.context("Pipeline stopped with an error")
}

/// One run to fixpoint
async fn run_once(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;
    let clients = build_clients(&config, storage.clone()).await?;
    let processors = default_processors(&config);

    let report = build_runner(&config, &storage)
        .run_with_report(&processors, &clients)
        .await;
    storage.close().await;

    let report = report.context("Pipeline run failed")?;
    if report.completed {
        info!("Pipeline caught up after {} passes", report.passes);
    } else {
        warn!("Pipeline stopped before catching up, run again to continue");
    }

    Ok(())
}

/// Show pipeline status
async fn show_status(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;

    let stats = storage.stats().await?;
    let cursors = storage.list_cursors().await?;

    println!("\n=== spinsync Status ===\n");
    println!("Cursors:");
    if cursors.is_empty() {
        println!("  (none yet)");
    }
    for (processor, cursor) in &cursors {
        println!("  {}: {}", processor, cursor);
    }

    println!("\nMempool:");
    println!("  Pending writes: {}", stats.pending_writes);
    println!("  Quarantined writes: {}", stats.quarantined_writes);

    println!("\nCanonical state:");
    println!("  Registers: {}", stats.register_count);
    for (table, count) in &stats.records_per_table {
        println!("  {}: {}", table, count);
    }

    println!("\nActive errors: {}", stats.active_errors);
    println!();

    storage.close().await;

    Ok(())
}

/// Initialize the database
async fn init_database(database_url: &str) -> Result<()> {
    info!("Initializing database: {}", database_url);

    let storage = Storage::new(database_url, None, None)
        .await
        .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    storage
        .health_check()
        .await
        .context("Database health check failed")?;

    let stats = storage.stats().await?;
    info!("Database initialized successfully!");
    info!("  Cursors: {}", stats.cursor_count);
    info!("  Registers: {}", stats.register_count);

    storage.close().await;

    Ok(())
}

/// Print active error annotations
async fn list_errors(config_path: &str, table: Option<&str>) -> Result<()> {
    let table = table
        .map(|t| t.parse::<Table>())
        .transpose()
        .context("Unknown table")?;

    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;

    let errors = storage
        .list_errors(ErrorFilter {
            table,
            ..Default::default()
        })
        .await?;

    if errors.is_empty() {
        println!("No active errors.");
    }
    for error in &errors {
        println!(
            "{}/{} [{} {}] resets={} processor={}: {}",
            error.table,
            error.entity_id,
            error.kind.as_str(),
            error.status.as_str(),
            error.reset_count,
            error.processor,
            error.message
        );
    }

    storage.close().await;

    Ok(())
}

/// Manually reset one entity
async fn reset_entity(config_path: &str, table: &str, id: &str) -> Result<()> {
    let table: Table = table.parse().context("Unknown table")?;

    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;

    let reset = storage.reset_entity(table, id).await;
    storage.close().await;

    if reset? {
        println!("Reset {}/{}", table, id);
    } else {
        println!("{}/{} has no error annotation", table, id);
    }

    Ok(())
}
