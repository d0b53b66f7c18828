use anyhow::Result;
use clap::{Parser, Subcommand};
use cronicorn::planner::{LlmConfig, OpenAiChatClient, PlannerWorker};
use cronicorn::scheduling::repository::{
    PgJobsRepo, PgQuotaGuard, PgRunsRepo, PgSessionsRepo,
};
use cronicorn::scheduling::{
    connection::create_pool, Clock, Cron, Dispatcher, HttpDispatcher, JobsRepo, QuotaGuard,
    RunsRepo, SchedulerWorker, SessionsRepo, StandardCron, SystemClock,
};
use cronicorn::{Config, DatabaseSetup, HeaderCipher};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cronicorn")]
#[command(about = "Adaptive HTTP job scheduler with an AI planning loop")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler worker (claim, dispatch, record, advance)
    Scheduler,
    /// Run the AI planner worker
    Planner,
    /// Run both workers in one process
    All,
    /// Database management commands
    Database {
        #[command(subcommand)]
        command: DatabaseCommands,
    },
}

#[derive(Subcommand)]
enum DatabaseCommands {
    /// Create enum types, tables, and indexes
    Setup,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "info".to_string())
            .into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Scheduler) => run_workers(true, false).await,
        Some(Commands::Planner) => run_workers(false, true).await,
        Some(Commands::All) | None => run_workers(true, true).await,
        Some(Commands::Database {
            command: DatabaseCommands::Setup,
        }) => run_database_setup().await,
    }
}

async fn run_database_setup() -> Result<()> {
    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url, config.max_db_connections).await?;
    DatabaseSetup::new(pool).setup().await
}

async fn run_workers(run_scheduler: bool, run_planner: bool) -> Result<()> {
    let config = Config::from_env()?;

    // Planner-only mode with no API key is a clean no-op startup.
    if run_planner && !run_scheduler && config.planner.openai_api_key.is_none() {
        info!("OPENAI_API_KEY is not set; AI planner exiting");
        return Ok(());
    }

    let pool = create_pool(&config.database_url, config.max_db_connections).await?;
    let cipher = Arc::new(HeaderCipher::new(&config.encryption_secret)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cron: Arc<dyn Cron> = Arc::new(StandardCron);

    let jobs: Arc<dyn JobsRepo> = Arc::new(PgJobsRepo::new(pool.clone(), cipher.clone()));
    let runs: Arc<dyn RunsRepo> = Arc::new(PgRunsRepo::new(pool.clone()));

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut workers = Vec::new();

    if run_scheduler {
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(HttpDispatcher::new()?);
        let worker = SchedulerWorker::new(
            jobs.clone(),
            runs.clone(),
            dispatcher,
            cipher.clone(),
            clock.clone(),
            cron.clone(),
            config.scheduler_settings(),
        );
        let shutdown = shutdown_tx.subscribe();
        workers.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    if run_planner {
        match &config.planner.openai_api_key {
            Some(api_key) => {
                let chat = Arc::new(OpenAiChatClient::new(LlmConfig {
                    api_key: api_key.clone(),
                    base_url: config.planner.base_url.clone(),
                    model: config.planner.model.clone(),
                    max_tokens: config.planner.max_tokens,
                    temperature: config.planner.temperature,
                    ..LlmConfig::default()
                })?);
                let sessions: Arc<dyn SessionsRepo> = Arc::new(PgSessionsRepo::new(pool.clone()));
                let quota: Arc<dyn QuotaGuard> = Arc::new(PgQuotaGuard::new(pool.clone()));
                let worker = PlannerWorker::new(
                    jobs.clone(),
                    runs.clone(),
                    sessions,
                    quota,
                    chat,
                    clock.clone(),
                    config.planner_settings(),
                );
                let shutdown = shutdown_tx.subscribe();
                workers.push(tokio::spawn(async move { worker.run(shutdown).await }));
            }
            None => info!("OPENAI_API_KEY is not set; AI planner disabled"),
        }
    }

    if workers.is_empty() {
        info!("No workers to run, exiting");
        return Ok(());
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    // Give in-flight ticks a bounded window to finish before the process
    // goes away.
    let deadline = Duration::from_millis(config.scheduler.shutdown_timeout_ms);
    for worker in workers {
        match tokio::time::timeout(deadline, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker task failed during shutdown"),
            Err(_) => warn!("Worker did not stop within the shutdown timeout"),
        }
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
