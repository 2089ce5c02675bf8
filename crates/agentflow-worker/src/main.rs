//! CLI entry point for the AgentFlow worker service.
//!
//! Exit codes: 0 on clean signal shutdown, non-zero on startup failure.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentflow_core::evaluator::Evaluator;
use agentflow_core::persistence::{InMemoryRuntimeStore, RuntimeStore};
use agentflow_core::registry::HandlerRegistry;
use agentflow_storage::PostgresRuntimeStore;
use agentflow_worker::{FileConfig, WorkerConfig, WorkerService};

#[derive(Parser)]
#[command(name = "afl-worker")]
#[command(about = "AgentFlow distributed worker service")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (store connection and overrides)
    #[arg(long)]
    config: Option<String>,

    /// Server group name
    #[arg(long, default_value = "default")]
    server_group: String,

    /// Service name
    #[arg(long, default_value = "afl-runner")]
    service_name: String,

    /// Server hostname (default: auto-detect)
    #[arg(long, default_value = "")]
    server_name: String,

    /// Qualified event facet names to handle (default: all with handlers)
    #[arg(long, num_args = 0..)]
    topics: Vec<String>,

    /// Task list to poll
    #[arg(long, default_value = "default")]
    task_list: String,

    /// Poll interval in ms
    #[arg(long, env = "AFL_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval: u64,

    /// Heartbeat interval in ms
    #[arg(long, default_value_t = 10_000)]
    heartbeat_interval: u64,

    /// Max concurrent work items
    #[arg(long, env = "AFL_MAX_CONCURRENT", default_value_t = 2)]
    max_concurrent: usize,

    /// Lock TTL in ms
    #[arg(long, default_value_t = 60_000)]
    lock_duration: i64,

    /// HTTP status port (auto-increments if in use)
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Log level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<String>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let directive = match cli.log_level.as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    match &cli.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let mut config = WorkerConfig::new()
        .with_server_group(&cli.server_group)
        .with_server_name(&cli.server_name)
        .with_topics(cli.topics.clone())
        .with_task_list(&cli.task_list)
        .with_poll_interval_ms(cli.poll_interval)
        .with_max_concurrent(cli.max_concurrent)
        .with_lock_duration_ms(cli.lock_duration)
        .with_http_port(cli.port);
    config.service_name = cli.service_name.clone();
    config.heartbeat_interval_ms = cli.heartbeat_interval;
    file_config.apply(&mut config);

    let database_url = file_config
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store: Arc<dyn RuntimeStore> = match database_url {
        Some(url) => {
            let store = PostgresRuntimeStore::connect(&url).await?;
            info!("connected to document store");
            Arc::new(store)
        }
        None => {
            warn!("no database configured, using the in-memory store");
            Arc::new(InMemoryRuntimeStore::new())
        }
    };

    let evaluator = Arc::new(
        Evaluator::new(Arc::clone(&store)).with_task_list(config.task_list.clone()),
    );
    let registry = Arc::new(HandlerRegistry::new());

    let service = Arc::new(WorkerService::new(store, evaluator, registry, config));

    println!("Starting AgentFlow worker: {}", service.config().service_name);
    println!("  Server group: {}", service.config().server_group);
    println!("  Server name:  {}", service.config().server_name);
    println!("  Task list:    {}", service.config().task_list);
    println!("  Max workers:  {}", service.config().max_concurrent);
    println!("  Poll interval: {}ms", service.config().poll_interval_ms);
    println!(
        "  HTTP port:    {} (auto-increments if in use)",
        service.config().http_port
    );

    let signal_service = Arc::clone(&service);
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_service.stop();
    });

    service.start().await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
