use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use marquee_client::{DoubanProvider, OpenAiKeywordGenerator, TmdbProvider, WikipediaProvider};
use marquee_core::{
    AppError, EngineConfig, HealthMonitor, InMemoryRetryRepository, KeywordGenerator,
    KeywordVariants, METADATA_SEARCH, MediaType, MetadataSearchHandler, NoKeywords, Orchestrator,
    PartialResultHandler, Provider, ProviderHealthCheck, ProviderSource, QueueOutcome,
    RetryRepository, RetryScheduler, SearchRequest, TaskRouter, search_task,
};
use marquee_db::{Database, DatabaseConfig};

/// How long the worker waits for in-flight retries on Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "marquee", version, about = "Resilient movie and TV metadata search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the provider chain for a title
    Search {
        /// Title to look up
        #[arg(short, long)]
        query: String,

        /// "movie" or "tv"
        #[arg(short = 't', long, default_value = "movie")]
        media_type: MediaType,

        /// Release year (movies) or first air year (series)
        #[arg(short, long)]
        year: Option<u16>,

        /// Result language, e.g. "en-US" or "zh-CN"
        #[arg(short, long, default_value = "en-US")]
        language: String,

        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Query only this provider (tmdb, douban, wikipedia)
        #[arg(short, long)]
        source: Option<ProviderSource>,

        /// Queue a background retry when nothing usable is found
        #[arg(long, default_value_t = false)]
        defer: bool,

        #[command(flatten)]
        llm: LlmArgs,
    },

    /// Run provider health checks and print the current status
    Health,

    /// Inspect and manage the retry queue (persistent when DATABASE_URL is set)
    Retry {
        #[command(subcommand)]
        action: RetryAction,
    },

    /// Run the retry scheduler and periodic health checks until Ctrl-C
    Worker {
        #[command(flatten)]
        llm: LlmArgs,
    },
}

#[derive(Subcommand)]
enum RetryAction {
    /// List queued items, soonest due first
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Make an item due now (runs it in place when no worker is active)
    Trigger {
        /// Retry item id
        id: Uuid,
    },

    /// Remove a queued task without running it
    Cancel {
        /// Task id as shown by `retry list`
        task_id: String,
    },

    /// Remove every queued item
    Clear,
}

#[derive(clap::Args, Clone)]
struct LlmArgs {
    /// API key for the keyword-expansion model; expansion is off without it
    #[arg(long, env = "MARQUEE_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    #[arg(long, env = "MARQUEE_LLM_MODEL")]
    llm_model: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(
        long,
        env = "MARQUEE_LLM_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    llm_base_url: String,
}

/// Keyword expansion backed by the LLM when a key is configured.
#[derive(Clone)]
enum Keywords {
    Llm(OpenAiKeywordGenerator),
    Off,
}

impl KeywordGenerator for Keywords {
    async fn generate_keywords(&self, title: &str) -> Result<KeywordVariants, AppError> {
        match self {
            Keywords::Llm(generator) => generator.generate_keywords(title).await,
            Keywords::Off => NoKeywords.generate_keywords(title).await,
        }
    }
}

impl LlmArgs {
    fn keywords(&self) -> Result<Keywords> {
        match self.llm_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(key) => {
                let generator = OpenAiKeywordGenerator::with_base_url(
                    key,
                    self.llm_model.as_deref(),
                    &self.llm_base_url,
                )
                .map_err(|e| anyhow::anyhow!(e))?;
                Ok(Keywords::Llm(generator))
            }
            None => Ok(Keywords::Off),
        }
    }
}

/// Everything a command needs, wired from the environment.
struct Engine {
    config: EngineConfig,
    health: Arc<HealthMonitor>,
    orchestrator: Arc<Orchestrator<Keywords>>,
    partial: PartialResultHandler,
}

impl Engine {
    fn build(keywords: Keywords) -> Result<Self> {
        let config = EngineConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        let timeout = config.orchestrator.provider_timeout;

        let tmdb_key = std::env::var("TMDB_API_KEY").ok();
        if tmdb_key.is_none() {
            tracing::warn!("TMDB_API_KEY not set, TMDb will be skipped");
        }

        let tmdb: Arc<dyn Provider> = Arc::new(
            TmdbProvider::with_timeout(tmdb_key.as_deref(), timeout)
                .map_err(|e| anyhow::anyhow!(e))?,
        );
        let douban: Arc<dyn Provider> =
            Arc::new(DoubanProvider::with_timeout(timeout).map_err(|e| anyhow::anyhow!(e))?);
        let wikipedia: Arc<dyn Provider> =
            Arc::new(WikipediaProvider::with_timeout(timeout).map_err(|e| anyhow::anyhow!(e))?);

        let mut orchestrator = Orchestrator::new(config.orchestrator.clone())
            .with_health(Arc::clone(&health))
            .with_keyword_generator(keywords);
        // Registration order is fallback order.
        for (provider, essential) in [(tmdb, true), (douban, false), (wikipedia, false)] {
            health.register_check(
                provider.name().to_string(),
                essential,
                Arc::new(ProviderHealthCheck::new(Arc::clone(&provider))),
            );
            orchestrator.register(provider);
        }

        let partial = PartialResultHandler::new(Arc::clone(&health), config.partial.clone());

        Ok(Self {
            config,
            health,
            orchestrator: Arc::new(orchestrator),
            partial,
        })
    }

    fn scheduler<R: RetryRepository>(&self, repo: R) -> Arc<RetryScheduler<R, TaskRouter>> {
        let handler = MetadataSearchHandler::new(Arc::clone(&self.orchestrator))
            .with_result_cache(self.partial.clone());
        let router = TaskRouter::new().with_handler(Arc::new(handler));
        Arc::new(
            RetryScheduler::new(repo, router, self.config.scheduler.clone())
                .with_health(Arc::clone(&self.health)),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("marquee=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Health => {
            let engine = Engine::build(Keywords::Off)?;
            cmd_health(&engine).await?;
        }
        Commands::Search {
            query,
            media_type,
            year,
            language,
            page,
            source,
            defer,
            llm,
        } => {
            let engine = Engine::build(llm.keywords()?)?;
            let mut request = SearchRequest::new(query, media_type)
                .with_language(language)
                .with_page(page);
            if let Some(year) = year {
                request = request.with_year(year);
            }

            if defer {
                match connect_queue().await? {
                    Queue::Postgres(db) => {
                        let scheduler = engine.scheduler(db.retry_repo());
                        cmd_search(&engine, &request, source, Some(scheduler)).await?
                    }
                    Queue::Memory(repo) => {
                        cmd_search(&engine, &request, source, Some(engine.scheduler(repo))).await?
                    }
                }
            } else {
                cmd_search::<InMemoryRetryRepository>(&engine, &request, source, None).await?;
            }
        }
        Commands::Retry { action } => {
            let engine = Engine::build(Keywords::Off)?;
            match connect_queue().await? {
                Queue::Postgres(db) => cmd_retry(engine.scheduler(db.retry_repo()), action).await?,
                Queue::Memory(repo) => cmd_retry(engine.scheduler(repo), action).await?,
            }
        }
        Commands::Worker { llm } => {
            let engine = Engine::build(llm.keywords()?)?;
            match connect_queue().await? {
                Queue::Postgres(db) => {
                    let scheduler = engine.scheduler(db.retry_repo());
                    cmd_worker(&engine, scheduler).await?
                }
                Queue::Memory(repo) => {
                    let scheduler = engine.scheduler(repo);
                    cmd_worker(&engine, scheduler).await?
                }
            }
        }
    }

    Ok(())
}

enum Queue {
    Postgres(Database),
    Memory(InMemoryRetryRepository),
}

/// PostgreSQL when DATABASE_URL is set, otherwise a process-local queue.
async fn connect_queue() -> Result<Queue> {
    if std::env::var("DATABASE_URL").is_err() {
        tracing::warn!("DATABASE_URL not set, retry queue will not survive this process");
        return Ok(Queue::Memory(InMemoryRetryRepository::new()));
    }

    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(Queue::Postgres(db))
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            trigger.cancel();
        }
    });
    token
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_search<R: RetryRepository>(
    engine: &Engine,
    request: &SearchRequest,
    source: Option<ProviderSource>,
    deferred: Option<Arc<RetryScheduler<R, TaskRouter>>>,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();

    let outcome = match source {
        Some(source) => engine.orchestrator.search_source(&cancel, request, source).await,
        None => engine.orchestrator.search(&cancel, request).await,
    }
    .map_err(|e| anyhow::anyhow!(e))?;

    let resolved = engine.partial.resolve(request, &outcome).await;

    if let Some(provider) = outcome.status.successful_provider() {
        tracing::info!(%provider, items = resolved.items.len(), "Search complete");
    }

    print_json(&serde_json::json!({
        "result": resolved,
        "status": outcome.status,
    }))?;

    if let Some(scheduler) = deferred
        && !outcome.found()
        && !outcome.status.cancelled
    {
        let (task_id, payload) = search_task(request).map_err(|e| anyhow::anyhow!(e))?;
        let reason = AppError::Transient("no provider produced a usable result".into());
        match scheduler
            .queue_retry(&task_id, METADATA_SEARCH, &payload, &reason)
            .await
            .map_err(|e| anyhow::anyhow!(e))?
        {
            QueueOutcome::Queued(id) => eprintln!("Queued retry {id} for '{}'", request.query),
            QueueOutcome::AlreadyQueued(id) => {
                eprintln!("Retry {id} for '{}' is already queued", request.query)
            }
        }
    }

    Ok(())
}

async fn cmd_health(engine: &Engine) -> Result<()> {
    engine.health.run_checks().await;

    print_json(&serde_json::json!({
        "health": engine.health.snapshot(),
        "providers": engine.orchestrator.provider_statuses(),
        "circuits": engine.orchestrator.circuit_stats(),
    }))
}

async fn cmd_retry<R: RetryRepository>(
    scheduler: Arc<RetryScheduler<R, TaskRouter>>,
    action: RetryAction,
) -> Result<()> {
    match action {
        RetryAction::List { limit } => {
            let items = scheduler.list(limit).await.map_err(|e| anyhow::anyhow!(e))?;
            let total = scheduler.pending_count().await.map_err(|e| anyhow::anyhow!(e))?;
            eprintln!("{} of {total} queued item(s)", items.len());
            print_json(&items)?;
        }
        RetryAction::Trigger { id } => {
            let outcome = scheduler
                .trigger_immediate(id)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("{outcome:?}");
        }
        RetryAction::Cancel { task_id } => {
            if scheduler
                .cancel_retry(&task_id)
                .await
                .map_err(|e| anyhow::anyhow!(e))?
            {
                println!("Cancelled {task_id}");
            } else {
                anyhow::bail!("No queued task with id '{task_id}'");
            }
        }
        RetryAction::Clear => {
            let removed = scheduler.clear_all().await.map_err(|e| anyhow::anyhow!(e))?;
            println!("Removed {removed} item(s)");
        }
    }
    Ok(())
}

async fn cmd_worker<R: RetryRepository>(
    engine: &Engine,
    scheduler: Arc<RetryScheduler<R, TaskRouter>>,
) -> Result<()> {
    let shutdown = CancellationToken::new();

    let health_task = engine.health.spawn_periodic(shutdown.clone());
    scheduler.start(shutdown.clone());

    let pending = scheduler.pending_count().await.map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(
        pending,
        interval_secs = engine.config.scheduler.poll_interval.as_secs(),
        "Worker running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, finishing in-flight work");

    // Let the current item finish before cancelling executions.
    scheduler.shutdown(SHUTDOWN_GRACE, &shutdown).await;
    shutdown.cancel();
    health_task.await.context("Health check task panicked")?;

    tracing::info!("Worker stopped");
    Ok(())
}
