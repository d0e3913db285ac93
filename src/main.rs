use clap::{Parser, Subcommand};
use tracing::{error, info};

use afisha_pipeline::adapters::AdapterRegistry;
use afisha_pipeline::config::Config;
use afisha_pipeline::geocode::{GeocodeConfig, GeocodeService, NominatimBackend};
use afisha_pipeline::logging;
use afisha_pipeline::scheduler::Scheduler;
use afisha_pipeline::store::{EventStore, NewSource};
use afisha_pipeline::translation::{
    HttpTranslator, TranslationConfig, TranslationEngine,
};
use afisha_pipeline::types::{EventOrigin, SourceKind};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "afisha_pipeline")]
#[command(about = "Event ingestion, dedup, geocoding and translation-backfill pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: periodic ingestion and translation backfill
    Run,
    /// Run one ingestion sweep over all due sources and exit
    Ingest,
    /// Run one translation backfill pass over both queues and exit
    Translate {
        /// Records per batch (defaults to the configured batch size)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Manage registered sources
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a new source
    Add {
        /// Human-readable source name
        #[arg(long)]
        name: String,
        /// Source kind: pull_calendar, html_listing, forum_scrape, api_feed
        #[arg(long)]
        kind: String,
        /// Feed or listing URL
        #[arg(long)]
        url: String,
        /// Region tag used for local-time parsing (e.g. bali)
        #[arg(long, default_value = "bali")]
        region: String,
        /// Fetch interval in minutes
        #[arg(long, default_value_t = 60)]
        freq_minutes: i64,
        /// OAuth bearer token for api_feed sources
        #[arg(long)]
        oauth_token: Option<String>,
        /// Fallback API key for api_feed sources
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Re-enable a source (resets its failure counter)
    Enable { id: i64 },
    /// Disable a source
    Disable { id: i64 },
    /// List all registered sources
    List,
}

fn build_scheduler(config: &Config, store: Arc<EventStore>) -> anyhow::Result<Arc<Scheduler>> {
    let adapters = Arc::new(AdapterRegistry::new(config)?);
    let geocode_client = reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .user_agent(config.user_agent.clone())
        .build()?;
    let geocoder = Arc::new(GeocodeService::new(
        Arc::new(NominatimBackend::new(
            geocode_client,
            config.geocode_base_url.clone(),
        )),
        GeocodeConfig {
            ttl: config.geocode_ttl,
            max_entries: config.geocode_max_entries,
            queries_per_second: config.geocode_qps,
        },
    ));
    Ok(Arc::new(Scheduler::new(
        store,
        adapters,
        geocoder,
        config.sweep_batch_size,
        config.failure_ceiling,
    )))
}

fn build_translation_engine(
    config: &Config,
    store: Arc<EventStore>,
) -> anyhow::Result<Arc<TranslationEngine>> {
    let client = reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .user_agent(config.user_agent.clone())
        .build()?;
    let translator = Arc::new(HttpTranslator::new(client, config.translate_url.clone()));
    Ok(Arc::new(TranslationEngine::new(
        store,
        translator,
        TranslationConfig {
            batch_size: config.translate_batch_size,
            retry_ceiling: config.translate_retry_ceiling,
            ..TranslationConfig::default()
        },
    )))
}

async fn translate_once(
    engine: &TranslationEngine,
    batch_size: usize,
) -> anyhow::Result<()> {
    for queue in [EventOrigin::User, EventOrigin::Parser] {
        let stats = engine.sweep_with_batch_size(queue, batch_size).await?;
        println!("\n📊 Translation results for {} queue:", queue.as_str());
        println!("   Examined: {}", stats.examined);
        println!("   Translated: {}", stats.translated);
        println!("   Failed records: {}", stats.failed_records);
        if stats.paused {
            println!("   ⏸️  Queue is paused after a transport failure");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = logging::init_logging();

    let cli = Cli::parse();
    let config = Config::from_env();
    let store = Arc::new(EventStore::open(&config.database_path)?);

    match cli.command {
        Commands::Run => {
            println!("🚀 Starting pipeline...");
            println!("   Database: {}", config.database_path);
            println!("   Ingest every {:?}, translate every {:?}", config.ingest_interval, config.translate_interval);

            let scheduler = build_scheduler(&config, store.clone())?;
            let engine = build_translation_engine(&config, store)?;
            info!("pipeline started");

            let ingest_loop = tokio::spawn(scheduler.run(config.ingest_interval));
            let translate_loop = tokio::spawn(engine.run(config.translate_interval));
            let _ = tokio::try_join!(ingest_loop, translate_loop)?;
        }
        Commands::Ingest => {
            println!("🔄 Running one ingestion sweep...");
            let scheduler = build_scheduler(&config, store)?;
            match scheduler.sweep().await {
                Ok(summary) => {
                    println!("\n📊 Sweep results:");
                    println!("   Sources due: {}", summary.sources_due);
                    println!("   Fetched: {}", summary.fetched);
                    println!("   Not modified: {}", summary.not_modified);
                    println!("   Failed: {}", summary.failed);
                    println!("   Inserted: {}", summary.inserted);
                    println!("   Updated: {}", summary.updated);
                    println!("   Skipped records: {}", summary.skipped_records);
                    if summary.disabled > 0 {
                        println!("   ⚠️  Sources auto-disabled: {}", summary.disabled);
                    }
                }
                Err(e) => {
                    error!("Sweep failed: {}", e);
                    println!("❌ Sweep failed: {}", e);
                }
            }
        }
        Commands::Translate { batch_size } => {
            println!("🔄 Running translation backfill...");
            let engine = build_translation_engine(&config, store)?;
            let batch_size = batch_size.unwrap_or(config.translate_batch_size);
            translate_once(&engine, batch_size).await?;
        }
        Commands::Source { action } => match action {
            SourceAction::Add {
                name,
                kind,
                url,
                region,
                freq_minutes,
                oauth_token,
                api_key,
            } => {
                let Some(kind) = SourceKind::from_str(&kind) else {
                    println!("❌ Unknown source kind: {}", kind);
                    println!("   Available: pull_calendar, html_listing, forum_scrape, api_feed");
                    std::process::exit(1);
                };
                let id = store.add_source(&NewSource {
                    name: name.clone(),
                    kind,
                    url,
                    region,
                    freq_minutes,
                    oauth_token,
                    api_key,
                })?;
                println!("✅ Added source {} (id {})", name, id);
            }
            SourceAction::Enable { id } => {
                if store.set_source_enabled(id, true)? > 0 {
                    println!("✅ Source {} enabled", id);
                } else {
                    println!("⚠️  No source with id {}", id);
                }
            }
            SourceAction::Disable { id } => {
                if store.set_source_enabled(id, false)? > 0 {
                    println!("✅ Source {} disabled", id);
                } else {
                    println!("⚠️  No source with id {}", id);
                }
            }
            SourceAction::List => {
                let sources = store.list_sources()?;
                if sources.is_empty() {
                    println!("No sources registered yet");
                }
                for source in sources {
                    let state = if source.enabled { "enabled" } else { "disabled" };
                    println!(
                        "{:4}  {:<14} {:<8} {:<40} every {}m, {} failures, {}",
                        source.id,
                        source.kind.as_str(),
                        state,
                        source.url,
                        source.freq_minutes,
                        source.consecutive_failures,
                        source.name,
                    );
                }
            }
        },
    }
    Ok(())
}
