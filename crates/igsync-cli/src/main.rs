use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use igsync_storage::ItemStore;
use igsync_sync::{build_engine, Scheduler, SyncConfig};
use igsync_web::{AppState, HttpServer, WebConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod shutdown;

#[derive(Debug, Parser)]
#[command(name = "igsync")]
#[command(about = "Mirror a media feed into a local store and serve it back")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the periodic sync and the read API together until interrupted.
    Run {
        /// Seconds between update cycles; overrides IGSYNC_INTERVAL_SECS.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run a single update cycle and exit.
    Sync,
    /// Serve the read API over the existing store.
    Serve,
    /// Create or upgrade the store schema.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Run {
        interval_secs: None,
    }) {
        Commands::Run { interval_secs } => run(interval_secs).await,
        Commands::Sync => sync_once().await,
        Commands::Serve => serve().await,
        Commands::Migrate => migrate().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn open_store(path: &std::path::Path) -> Result<ItemStore> {
    ItemStore::open(path)
        .await
        .with_context(|| format!("failed to open db '{}'", path.display()))
}

async fn run(interval_secs: Option<u64>) -> Result<()> {
    let mut config = SyncConfig::from_env()?;
    if let Some(secs) = interval_secs.filter(|secs| *secs > 0) {
        config.interval = Duration::from_secs(secs);
    }
    let web_config = WebConfig::from_env();

    let store = open_store(&config.db_path).await?;
    let engine = build_engine(&config, store.clone())?;
    let scheduler = Arc::new(Scheduler::new(Arc::new(engine)));
    let server = Arc::new(HttpServer::new(
        web_config,
        AppState::new(store.clone(), config.assets_dir.clone()),
    ));

    let token = shutdown::install_signal_handler();

    let sched = scheduler.clone();
    let interval = config.interval;
    let sched_token = token.child_token();
    let mut scheduler_task =
        tokio::spawn(async move { sched.start_with(interval, sched_token).await });
    let srv = server.clone();
    let mut server_task = tokio::spawn(async move { srv.start().await });

    let mut failure: Option<anyhow::Error> = None;
    let mut scheduler_done = None;
    let mut server_done = None;

    tokio::select! {
        _ = token.cancelled() => {}
        res = &mut scheduler_task => scheduler_done = Some(res),
        res = &mut server_task => server_done = Some(res),
    }

    // Reaches the scheduler even before its task is first polled.
    token.cancel();
    scheduler.stop();
    server.stop();

    let scheduler_result = match scheduler_done {
        Some(res) => res,
        None => scheduler_task.await,
    };
    match scheduler_result.context("scheduler task panicked")? {
        Ok(()) => info!("scheduler finished"),
        Err(err) => failure = Some(err.into()),
    }

    let server_result = match server_done {
        Some(res) => res,
        None => server_task.await,
    };
    if let Err(err) = server_result.context("server task panicked")? {
        failure.get_or_insert(err);
    }

    store.close().await;
    info!("shutdown complete");

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn sync_once() -> Result<()> {
    let summary = igsync_sync::run_cycle_once_from_env().await?;
    println!(
        "sync complete: cycle_id={} listed={} new={} committed={}",
        summary.cycle_id, summary.listed, summary.new_items, summary.committed
    );
    Ok(())
}

async fn serve() -> Result<()> {
    let store = open_store(&igsync_sync::db_path_from_env()).await?;
    let state = AppState::new(store.clone(), igsync_sync::assets_dir_from_env());
    let token = shutdown::install_signal_handler();
    let result = igsync_web::serve_until(WebConfig::from_env(), state, token).await;
    store.close().await;
    result
}

async fn migrate() -> Result<()> {
    let path = igsync_sync::db_path_from_env();
    let store = open_store(&path).await?;
    store.migrate().await.context("failed to migrate")?;
    store.close().await;
    info!(db = %path.display(), "migrations applied");
    Ok(())
}
