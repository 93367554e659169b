use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use igsync_core::Item;
use igsync_source::{RemoteSource, SourceError};
use igsync_storage::{
    AssetDir, AssetError, AssetFetcher, ItemBatch, ItemStore, StagedAsset, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Failure of one update cycle, tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to refresh token: {0}")]
    Auth(#[source] SourceError),
    #[error("failed to get media list: {0}")]
    List(#[source] SourceError),
    #[error("failed to look up known media: {0}")]
    Lookup(#[source] StoreError),
    #[error("failed to get media '{id}': {source}")]
    Fetch {
        id: String,
        #[source]
        source: SourceError,
    },
    #[error("failed to open write transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("failed to persist media '{id}': {source}")]
    Persist {
        id: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to prepare asset directory: {0}")]
    PrepareAssets(#[source] AssetError),
    #[error("failed to save asset of media '{id}' from '{url}': {source}")]
    Asset {
        id: String,
        url: String,
        #[source]
        source: AssetError,
    },
    #[error("failed to commit batch of {count} media: {source}")]
    Commit {
        count: usize,
        #[source]
        source: StoreError,
    },
    #[error("media '{id}' was committed but its asset could not be finalized: {source}")]
    Finalize {
        id: String,
        #[source]
        source: AssetError,
    },
}

impl SyncError {
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "auth",
            SyncError::List(_) => "list",
            SyncError::Lookup(_) => "lookup",
            SyncError::Fetch { .. } => "fetch",
            SyncError::Begin(_) | SyncError::Persist { .. } => "persist",
            SyncError::PrepareAssets(_) | SyncError::Asset { .. } => "asset",
            SyncError::Commit { .. } => "commit",
            SyncError::Finalize { .. } => "finalize",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub new_items: usize,
    pub committed: usize,
}

/// One refresh → list → dedupe → fetch → commit pass.
#[async_trait]
pub trait UpdateCycle: Send + Sync {
    async fn run_cycle(&self) -> Result<CycleSummary, SyncError>;
}

pub struct SyncEngine {
    source: Arc<dyn RemoteSource>,
    store: ItemStore,
    assets: AssetDir,
    fetcher: Arc<dyn AssetFetcher>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        store: ItemStore,
        assets: AssetDir,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        Self {
            source,
            store,
            assets,
            fetcher,
        }
    }

    async fn cycle(&self, cycle_id: Uuid) -> Result<CycleSummary, SyncError> {
        let started_at = Utc::now();

        info!("refreshing token");
        self.source.refresh_credential().await.map_err(SyncError::Auth)?;

        let listed = self.source.list_known_ids().await.map_err(SyncError::List)?;
        let new_ids = self
            .store
            .missing_ids(&listed)
            .await
            .map_err(SyncError::Lookup)?;
        info!(listed = listed.len(), new = new_ids.len(), "media to add");

        // Phase 1: every new record is held in memory before the store is touched.
        let mut fetched = Vec::with_capacity(new_ids.len());
        for id in &new_ids {
            let item = self
                .source
                .fetch_item(id)
                .await
                .map_err(|source| SyncError::Fetch {
                    id: id.clone(),
                    source,
                })?;
            fetched.push(item);
        }

        // Phase 2: one transaction for the whole batch.
        let committed = self.commit_batch(&fetched).await?;

        Ok(CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            listed: listed.len(),
            new_items: new_ids.len(),
            committed,
        })
    }

    async fn commit_batch(&self, items: &[Item]) -> Result<usize, SyncError> {
        if !items.is_empty() {
            self.assets.ensure().await.map_err(SyncError::PrepareAssets)?;
        }

        let mut batch = self.store.begin_batch().await.map_err(SyncError::Begin)?;
        let mut staged = Vec::with_capacity(items.len());

        for item in items {
            if let Err(err) = self.write_item(&mut batch, item, &mut staged).await {
                self.abandon(batch, &staged).await;
                return Err(err);
            }
        }

        let count = batch.written();
        if let Err(source) = batch.commit().await {
            self.discard_all(&staged).await;
            return Err(SyncError::Commit { count, source });
        }

        // Records are committed from here on; staged files are kept for manual recovery.
        for (idx, asset) in staged.iter().enumerate() {
            if let Err(source) = self.assets.finalize(asset).await {
                for (item, left) in items[idx..].iter().zip(&staged[idx..]) {
                    error!(
                        id = %item.id,
                        staged = %left.staging_path.display(),
                        "committed media has no finalized asset"
                    );
                }
                return Err(SyncError::Finalize {
                    id: items[idx].id.clone(),
                    source,
                });
            }
        }

        Ok(count)
    }

    async fn write_item(
        &self,
        batch: &mut ItemBatch,
        item: &Item,
        staged: &mut Vec<StagedAsset>,
    ) -> Result<(), SyncError> {
        batch.put(item).await.map_err(|source| SyncError::Persist {
            id: item.id.clone(),
            source,
        })?;

        let asset = self.assets.stage(&item.id, item.asset_extension());
        // Tracked before the download so a half-written file is cleaned up too.
        staged.push(asset.clone());
        self.fetcher
            .fetch(&item.media_url, &asset.staging_path)
            .await
            .map_err(|source| SyncError::Asset {
                id: item.id.clone(),
                url: item.media_url.clone(),
                source,
            })?;

        info!(id = %item.id, "new media added");
        Ok(())
    }

    async fn abandon(&self, batch: ItemBatch, staged: &[StagedAsset]) {
        if let Err(err) = batch.rollback().await {
            warn!(error = %err, "explicit rollback failed; transaction is discarded on drop");
        }
        self.discard_all(staged).await;
    }

    async fn discard_all(&self, staged: &[StagedAsset]) {
        for asset in staged {
            self.assets.discard(asset).await;
        }
    }
}

#[async_trait]
impl UpdateCycle for SyncEngine {
    async fn run_cycle(&self) -> Result<CycleSummary, SyncError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("update_cycle", %cycle_id);
        let result = self.cycle(cycle_id).instrument(span.clone()).await;
        span.in_scope(|| match &result {
            Ok(summary) => info!(
                new = summary.new_items,
                committed = summary.committed,
                "update cycle complete"
            ),
            Err(err) => warn!(stage = err.stage(), error = %err, "update cycle failed"),
        });
        result
    }
}
