use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use sheltermatch::config::{load_config, Config};
use sheltermatch::db::create_pool;
use sheltermatch::embedding::create_provider;
use sheltermatch::index::{IndexService, VectorIndex};
use sheltermatch::ingest::ingest_records;
use sheltermatch::matcher::run_match;
use sheltermatch::migrate::run_migrations;
use sheltermatch::models::{DogId, DogStatus, SourceSystem};
use sheltermatch::questionnaire::{create_extractor, interpret, Answer};
use sheltermatch::server::{serve, AppState};
use sheltermatch::store::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "smatch")]
#[command(about = "Knowledge base and matching core for shelter dog adoption")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "smatch.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations
    Init,
    /// Ingest raw records from a source export (JSON array)
    Ingest {
        /// Source system: petpoint, rescuegroups, or message_board
        source: String,
        /// Path to the JSON file of raw records
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Run a match from a questionnaire answers file (JSON array)
    Match {
        /// Path to the JSON answers file
        #[arg(short, long)]
        answers: PathBuf,
        /// Maximum number of results
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
    /// Show one canonical dog profile
    Show {
        /// Dog id, e.g. petpoint:A123
        id: String,
    },
    /// Set a dog's availability status
    Status {
        /// Dog id, e.g. petpoint:A123
        id: String,
        /// One of: available, pending, adopted, removed
        status: String,
    },
    /// Embed all profiles whose text changed since their last embedding
    Embed,
    /// Run the HTTP match server
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheltermatch=info,smatch=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;

    match cli.command {
        Commands::Init => {
            let pool = create_pool(&config.db.path).await?;
            run_migrations(&pool).await?;
            println!("Initialized database at {}", config.db.path.display());
        }
        Commands::Ingest { source, file } => {
            let source = SourceSystem::from_str(&source).map_err(anyhow::Error::msg)?;
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let records: Vec<serde_json::Value> =
                serde_json::from_str(&content).context("Expected a JSON array of records")?;

            let (store, service) = open_store(&config).await?;
            service.load(store.as_ref()).await?;
            let inline = if config.embedding.is_enabled() {
                Some(&service)
            } else {
                None
            };
            let report = ingest_records(
                store.as_ref(),
                inline,
                source,
                &records,
                config.matching.max_conflict_retries,
            )
            .await?;

            println!("Ingested {} records from {}", report.ingested, source);
            println!("  rejected:           {}", report.rejected);
            println!("  field warnings:     {}", report.field_warnings);
            println!("  embedded:           {}", report.embedded);
            println!("  embedding failures: {}", report.embedding_failures);
            for rejection in &report.rejections {
                println!("  ! {}", rejection);
            }
        }
        Commands::Match { answers, limit } => {
            let content = std::fs::read_to_string(&answers)
                .with_context(|| format!("Failed to read {}", answers.display()))?;
            let answers: Vec<Answer> =
                serde_json::from_str(&content).context("Expected a JSON array of answers")?;

            let (store, service) = open_store(&config).await?;
            service.load(store.as_ref()).await?;
            let extractor = create_extractor(&config.matching)?;
            let adopter = interpret(
                &answers,
                service.provider().as_ref(),
                extractor.as_ref(),
                &config.matching,
            )
            .await?;
            let response = run_match(
                store.as_ref(),
                &service.index,
                &config.matching,
                &adopter,
                limit,
            )
            .await?;

            if response.no_qualifying_candidates {
                println!("No dogs satisfy the hard constraints. Consider relaxing them.");
                return Ok(());
            }
            if response.degraded {
                println!("(embedding unavailable; ranking used structured data only)\n");
            }
            for (rank, result) in response.results.iter().enumerate() {
                println!("{}. {} (score {:.3})", rank + 1, result.dog_id, result.score);
                for signal in &result.explanation {
                    println!("     {} {:+.3}: {}", signal.signal, signal.contribution, signal.detail);
                }
            }
        }
        Commands::Show { id } => {
            let (store, _) = open_store(&config).await?;
            match store.get(&DogId(id.clone())).await? {
                Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                None => anyhow::bail!("unknown dog: {}", id),
            }
        }
        Commands::Status { id, status } => {
            let status = DogStatus::from_str(&status).map_err(anyhow::Error::msg)?;
            let (store, _) = open_store(&config).await?;
            match store.mark_status(&DogId(id.clone()), status).await? {
                Some(profile) => {
                    println!("{} -> {}", profile.dog_id, profile.status.as_str())
                }
                None => anyhow::bail!("unknown dog: {}", id),
            }
        }
        Commands::Embed => {
            let (store, service) = open_store(&config).await?;
            service.load(store.as_ref()).await?;
            let (embedded, skipped, failed) = service.embed_pending(store.as_ref()).await?;
            println!("Embedded {} profiles ({} up to date, {} failed)", embedded, skipped, failed);
        }
        Commands::Serve => {
            let (store, service) = open_store(&config).await?;
            let service = Arc::new(service);
            service.load(store.as_ref()).await?;
            let extractor = create_extractor(&config.matching)?;

            // Keep the index within the re-embed latency target while
            // ingestion runs alongside the server.
            if config.embedding.is_enabled() {
                let period =
                    std::time::Duration::from_secs(config.matching.reembed_target_secs.max(1));
                tokio::spawn(service.clone().run_backfill(store.clone(), period));
            }

            let state = Arc::new(AppState {
                store,
                index: service.index.clone(),
                provider: service.provider().clone(),
                extractor,
                config,
            });
            serve(state).await?;
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> Result<(Arc<dyn Store>, IndexService)> {
    let pool = create_pool(&config.db.path).await?;
    run_migrations(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool, config.trust.clone()));
    let index = Arc::new(VectorIndex::new(config.index.clone()));
    let provider = create_provider(&config.embedding)?;
    let service = IndexService::new(index, provider, config.embedding.clone());
    Ok((store, service))
}
