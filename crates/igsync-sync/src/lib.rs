//! Update-cycle pipeline and its interval scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use igsync_core::Credential;
use igsync_source::{GraphApiSource, DEFAULT_GRAPH_BASE_URL};
use igsync_storage::{build_http_client, AssetDir, HttpAssetFetcher, HttpClientConfig, ItemStore};

mod engine;
mod scheduler;

pub use engine::{CycleSummary, SyncEngine, SyncError, UpdateCycle};
pub use scheduler::{Scheduler, SchedulerError, SchedulerState};

pub const CRATE_NAME: &str = "igsync-sync";

pub const TOKEN_ENV: &str = "INSTAGRAM_TOKEN";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub assets_dir: PathBuf,
    pub interval: Duration,
    pub graph_base_url: String,
    pub access_token: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let access_token = std::env::var(TOKEN_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .with_context(|| format!("please set the {TOKEN_ENV} variable"))?;

        Ok(Self {
            db_path: db_path_from_env(),
            assets_dir: assets_dir_from_env(),
            interval: Duration::from_secs(
                std::env::var("IGSYNC_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|secs: &u64| *secs > 0)
                    .unwrap_or(3600),
            ),
            graph_base_url: std::env::var("IGSYNC_GRAPH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GRAPH_BASE_URL.to_string()),
            access_token,
            user_agent: std::env::var("IGSYNC_USER_AGENT")
                .unwrap_or_else(|_| "igsync/0.1".to_string()),
            http_timeout_secs: std::env::var("IGSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Store location; shared with commands that never talk to the remote.
pub fn db_path_from_env() -> PathBuf {
    std::env::var("IGSYNC_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/igsync.db"))
}

pub fn assets_dir_from_env() -> PathBuf {
    std::env::var("IGSYNC_ASSETS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/assets"))
}

/// Wire the Graph API source and the HTTP asset fetcher around an opened store.
pub fn build_engine(config: &SyncConfig, store: ItemStore) -> Result<SyncEngine> {
    let client = build_http_client(&config.http_client_config())?;
    let source = GraphApiSource::with_client(
        &config.graph_base_url,
        Credential::seed(config.access_token.clone()),
        client.clone(),
    )?;
    Ok(SyncEngine::new(
        Arc::new(source),
        store,
        AssetDir::new(config.assets_dir.clone()),
        Arc::new(HttpAssetFetcher::with_client(client)),
    ))
}

/// Run exactly one update cycle with configuration taken from the environment.
pub async fn run_cycle_once_from_env() -> Result<CycleSummary> {
    let config = SyncConfig::from_env()?;
    let store = ItemStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store {}", config.db_path.display()))?;
    let engine = build_engine(&config, store.clone())?;
    let summary = engine.run_cycle().await;
    store.close().await;
    Ok(summary?)
}
