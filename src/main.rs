//! datachat daemon entry point.

use clap::{Parser, Subcommand};
use datachat::api::{self, ApiState};
use datachat::chat::orchestrator::ChatSettings;
use datachat::chat::{ChatOrchestrator, MessageStore};
use datachat::config::Config;
use datachat::db::Db;
use datachat::limiter::RateLimiter;
use datachat::llm::CompletionClient;
use datachat::llm::manager::LlmManager;
use datachat::llm::openai::OpenAiCompatClient;
use datachat::pool::{ProcessSpawner, WorkerPool, WorkerSpawner};
use datachat::realtime::EventBus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "datachat", about = "Chat with tabular datasets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Start {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Verbose logging.
        #[arg(long)]
        debug: bool,
    },
    /// Run as a query worker. Spawned by the daemon's pool; not for direct
    /// use.
    Worker,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Worker => {
            init_tracing(false);
            datachat::worker::run()
        }
        Command::Start { config, debug } => {
            init_tracing(debug);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_daemon(config.as_deref()))
        }
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "datachat=debug,info"
    } else {
        "datachat=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_daemon(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    tracing::info!(
        bind_addr = %config.server.bind_addr,
        pool_size = config.pool.pool_size,
        "starting datachat"
    );

    let db = Db::connect(&config.server.data_dir).await?;
    let bus = EventBus::new();
    let limiter = RateLimiter::new(
        db.sqlite.clone(),
        config.limiter.token_limit,
        config.limiter.warning_percent,
    );

    let spawner: Arc<dyn WorkerSpawner> = match &config.pool.worker_path {
        Some(path) => Arc::new(ProcessSpawner::new(path.clone())),
        None => Arc::new(ProcessSpawner::current_exe()?),
    };
    let pool = WorkerPool::start(config.pool.clone(), spawner).await?;

    let llm_manager = Arc::new(LlmManager::new(config.llm.clone())?);
    let llm: Arc<dyn CompletionClient> = Arc::new(OpenAiCompatClient::new(llm_manager));
    let store = MessageStore::new(db.sqlite.clone());

    let orchestrator = Arc::new(ChatOrchestrator::new(
        llm,
        Arc::new(pool.clone()),
        limiter.clone(),
        bus.clone(),
        store,
        ChatSettings {
            model: config.llm.model.clone(),
            max_tool_rounds: config.llm.max_tool_rounds,
            query_timeout_ms: config.pool.query_timeout_ms,
        },
    ));

    let state = Arc::new(ApiState {
        orchestrator,
        bus,
        limiter,
        pool: pool.clone(),
        data_dir: config.server.data_dir.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!(addr = %config.server.bind_addr, "listening");
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.shutdown(Duration::from_millis(config.pool.shutdown_grace_ms))
        .await;
    db.close().await;
    tracing::info!("datachat stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
