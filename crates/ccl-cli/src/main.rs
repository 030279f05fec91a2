use std::sync::Arc;

use anyhow::{Context, Result};
use ccl_core::RawRecordLocator;
use ccl_ingest::{
    BackfillRunner, EnrichmentStore, IngestConfig, IngestPipeline, IngestQueue, IngestWorkerPool,
    InMemoryQueue, Normalizer, PgEnrichmentStore, QueueMessage,
};
use ccl_parsers::ParserRegistry;
use ccl_storage::{BackoffPolicy, FsObjectStore, RawRecordStore};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ccl")]
#[command(about = "Commercial content enrichment ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the given raw-record keys through the worker pool.
    Ingest {
        /// Object keys of the form <observer_id>/rdo/<ts>.<observation_id>/output.json
        keys: Vec<String>,
    },
    /// Replay all historical raw records, resuming from checkpoints.
    Backfill {
        /// Drop persisted checkpoints before running.
        #[arg(long)]
        reset: bool,
        /// Restrict the run to one observer-id prefix.
        #[arg(long)]
        shard: Option<String>,
    },
    /// Apply the database schema.
    Migrate,
    /// Print the flattened projection for one observation as JSON.
    Project { observation_id: String },
}

fn raw_record_store(config: &IngestConfig) -> RawRecordStore {
    RawRecordStore::new(
        Arc::new(FsObjectStore::new(config.raw_store_dir.clone())),
        config.raw_bucket.clone(),
    )
}

async fn build_pipeline(
    config: &IngestConfig,
) -> Result<(Arc<IngestPipeline>, Arc<PgEnrichmentStore>)> {
    let store = Arc::new(
        PgEnrichmentStore::connect(&config.database_url)
            .await
            .context("connecting to the database")?,
    );
    let normalizer = Normalizer::new(ParserRegistry::with_builtin(), &config.media_uri_prefix);
    let pipeline = Arc::new(IngestPipeline::new(
        raw_record_store(config),
        normalizer,
        Arc::clone(&store) as Arc<dyn EnrichmentStore>,
    ));
    Ok((pipeline, store))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Ingest { keys } => {
            anyhow::ensure!(!keys.is_empty(), "no raw-record keys given");
            let (pipeline, _store) = build_pipeline(&config).await?;
            let queue = Arc::new(InMemoryQueue::new());
            for key in keys {
                queue
                    .push(QueueMessage::new(RawRecordLocator::new(
                        config.raw_bucket.clone(),
                        key,
                    )))
                    .await;
            }
            let pool = IngestWorkerPool::new(
                Arc::clone(&queue) as Arc<dyn IngestQueue>,
                pipeline,
                config.workers,
                config.max_attempts,
                BackoffPolicy::default(),
            );
            let summary = pool.run_until_drained().await?;
            println!(
                "ingest complete: processed={} requeued={} dead_lettered={}",
                summary.processed, summary.requeued, summary.dead_lettered
            );
            for letter in queue.dead_letters().await {
                eprintln!(
                    "dead-letter: key={} attempts={} detail={}",
                    letter.locator.key, letter.attempts, letter.detail
                );
            }
        }
        Commands::Backfill { reset, shard } => {
            let (pipeline, _store) = build_pipeline(&config).await?;
            let runner = BackfillRunner::new(
                raw_record_store(&config),
                pipeline,
                config.checkpoint_dir.clone(),
            );
            if reset {
                runner.reset().await?;
            }
            let report = runner.run(shard.as_deref()).await?;
            println!(
                "backfill {} complete: shards={} processed={} succeeded={} skipped={} failed={}",
                report.run_id,
                report.shards,
                report.processed,
                report.succeeded,
                report.skipped_complete,
                report.failed.len()
            );
            for failure in &report.failed {
                eprintln!("failed: key={} reason={}", failure.key, failure.reason);
            }
        }
        Commands::Migrate => {
            let store = PgEnrichmentStore::connect(&config.database_url)
                .await
                .context("connecting to the database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Project { observation_id } => {
            let store = PgEnrichmentStore::connect(&config.database_url)
                .await
                .context("connecting to the database")?;
            let graphs = store.graphs_for_observation(&observation_id).await?;
            let projection = ccl_ingest::build_projection(&observation_id, None, &graphs);
            println!("{}", serde_json::to_string_pretty(&projection)?);
        }
    }

    Ok(())
}
