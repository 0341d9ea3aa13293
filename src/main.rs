//! dynhashtag - adaptive topic following over live social-media streams
//!
//! Entry point for the `dynhashtag` command: live ingestion with periodic
//! retraining, one-off retraining, offline replays and store statistics.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dynhashtag_core::{
    config::{AppConfig, DatabaseMode},
    filter::{ClassifierHandoff, IngestionLoop, RetrainPipeline, RetrainScheduler},
    stream::{memory::MemoryStreamClient, sse::SseStreamClient, wire::decode_status},
    DocumentStore, LibsqlDocumentStore, MemoryDocumentStore, StreamClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dynhashtag")]
#[command(about = "Follow a drifting topic on a live document stream", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); defaults to ./dynhashtag.toml when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Set log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Database path (overrides database.path and switches to local mode)
    #[arg(long, global = true)]
    db_path: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the live stream and retrain every remodel interval
    Run,

    /// Run one retraining cycle now and print the expanded query
    Retrain,

    /// Replay a JSON-lines capture offline through ingestion and one retrain cycle
    Replay {
        /// File with one status payload per line
        file: PathBuf,
    },

    /// Show document counts in the store
    Stats,
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = &cli.db_path {
        config.database.mode = DatabaseMode::Local;
        config.database.path = Some(path.clone());
    }
    Ok(config)
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    let mode = config.database.connection_mode()?;
    let store = LibsqlDocumentStore::new_with_validation(mode, true)
        .await
        .context("failed to open document store")?;
    Ok(Arc::new(store))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let stream: Arc<dyn StreamClient> = Arc::new(SseStreamClient::new(&config.stream));
    let handoff = Arc::new(ClassifierHandoff::new());

    let scheduler = RetrainScheduler::new(
        RetrainPipeline::from_config(&config, store.clone(), stream.clone()),
        handoff.clone(),
        config.seed.query_set(),
        config.filter.remodel_interval(),
        config.filter.history_limit,
    );
    let ingest = IngestionLoop::from_config(&config, stream, store, handoff.subscribe());

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler_task = {
        let shutdown = shutdown_tx.subscribe();
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    let mut ingest_task = tokio::spawn(ingest.run(shutdown_tx.subscribe()));

    // Run until Ctrl-C or until ingestion stops on its own
    let result = tokio::select! {
        result = &mut ingest_task => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping gracefully...");
            let _ = shutdown_tx.send(());
            ingest_task.await
        }
    };
    let _ = shutdown_tx.send(());
    let _ = scheduler_task.await;

    let report = result.context("ingestion task panicked")??;
    println!("{}", serde_json::to_string_pretty(&report)?);
    for job in scheduler.jobs() {
        debug!("{} {} {:?}", job.id, job.generation, job.status);
    }
    Ok(())
}

async fn retrain(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let stream: Arc<dyn StreamClient> = Arc::new(SseStreamClient::new(&config.stream));
    let scheduler = RetrainScheduler::new(
        RetrainPipeline::from_config(&config, store, stream),
        Arc::new(ClassifierHandoff::new()),
        config.seed.query_set(),
        config.filter.remodel_interval(),
        config.filter.history_limit,
    );

    let outcome = scheduler.run_once().await?;
    println!("{}", outcome.snapshot.query);
    println!(
        "added keywords: {}",
        outcome.selection.keywords.join(", ")
    );
    Ok(())
}

async fn replay(mut config: AppConfig, file: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut records = Vec::new();
    let mut malformed = 0usize;
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        match decode_status(line) {
            Some(record) => records.push(record),
            None => malformed += 1,
        }
    }
    if malformed > 0 {
        warn!("Skipped {} malformed lines", malformed);
    }
    info!("Replaying {} documents from {}", records.len(), file.display());

    // Widen the positive window to cover the whole capture
    if let Some(oldest) = records.iter().map(|(doc, _)| doc.created_at).min() {
        let hours = (Utc::now() - oldest).num_hours().max(0) as u64 + 1;
        config.filter.remodel_hours = config.filter.remodel_hours.max(hours);
    }
    config.filter.sample_timeout_secs = config.filter.sample_timeout_secs.min(5);

    let store = Arc::new(MemoryDocumentStore::new());
    let stream = Arc::new(MemoryStreamClient::new(records.len() + 16));
    let handoff = Arc::new(ClassifierHandoff::new());

    let ingest = IngestionLoop::from_config(&config, stream.clone(), store.clone(), handoff.subscribe());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let ingest_task = tokio::spawn(ingest.run(shutdown_rx));

    stream.wait_for_opens(1).await;
    for (document, author) in &records {
        stream.publish(document.clone(), Some(author.clone()));
    }

    // Cold start keeps every document the seed filter lets through; wait
    // until they are all stored
    let seed = config.seed.query_set();
    let unique = {
        let mut ids: Vec<_> = records
            .iter()
            .filter(|(d, _)| seed.matches(d))
            .map(|(d, _)| d.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    };
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while store.count_documents().await.unwrap_or(0) < unique {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Not every replayed document was stored before retraining");
    }

    stream.queue_sample(records.iter().map(|(doc, _)| doc.clone()));
    let scheduler = RetrainScheduler::new(
        RetrainPipeline::from_config(&config, store.clone(), stream.clone()),
        handoff.clone(),
        config.seed.query_set(),
        config.filter.remodel_interval(),
        config.filter.history_limit,
    );
    let retrained = scheduler.run_once().await;

    if retrained.is_ok() {
        let reopened =
            tokio::time::timeout(Duration::from_secs(5), stream.wait_for_opens(2)).await;
        if reopened.is_err() {
            warn!("Ingestion did not pick up the new classifier");
        }
    }
    let _ = shutdown_tx.send(());
    let report = ingest_task.await.context("ingestion task panicked")??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match retrained {
        Ok(outcome) => println!("{}", outcome.snapshot.query),
        Err(e) => println!("retrain failed: {}", e),
    }
    Ok(())
}

async fn stats(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let total = store.count_documents().await?;
    let since = Utc::now() - chrono::Duration::hours(config.filter.remodel_hours as i64);
    let recent = store.documents_since(since).await?.len();

    println!("documents: {}", total);
    println!(
        "documents in the last {}h: {}",
        config.filter.remodel_hours, recent
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Use the requested level for our crates; keep the HTTP stack quiet
    let filter = EnvFilter::new(format!(
        "dynhashtag={level},dynhashtag_core={level},eventsource_client=warn,hyper=warn,libsql=warn",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("dynhashtag v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Retrain => retrain(config).await,
        Commands::Replay { file } => replay(config, &file).await,
        Commands::Stats => stats(config).await,
    }
}
