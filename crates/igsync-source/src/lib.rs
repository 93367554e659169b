//! Remote feed contract and its Instagram Graph API implementation.

use anyhow::{bail, Context};
use async_trait::async_trait;
use igsync_core::{Credential, Item, ItemList};
use igsync_storage::{build_http_client, HttpClientConfig};
use reqwest::Url;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::RwLock;

pub const CRATE_NAME: &str = "igsync-source";

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.instagram.com/";

const ITEM_FIELDS: &str = "id,caption,media_type,media_url,permalink,username,timestamp";

/// Why a single remote request failed.
#[derive(Debug, Error)]
pub enum RequestFailure {
    #[error("failed to get '{url}': {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("auth error: {0}")]
    Auth(#[source] RequestFailure),
    #[error("remote error: {0}")]
    Remote(#[source] RequestFailure),
}

/// The external feed as the sync engine sees it.
///
/// Every operation is idempotent. Only [`RemoteSource::refresh_credential`]
/// has a side effect, and that effect stays in memory.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn refresh_credential(&self) -> Result<(), SourceError>;

    /// Ids on the first listing page, in remote order.
    async fn list_known_ids(&self) -> Result<Vec<String>, SourceError>;

    async fn fetch_item(&self, id: &str) -> Result<Item, SourceError>;
}

#[derive(Debug)]
pub struct GraphApiSource {
    base: Url,
    client: reqwest::Client,
    credential: RwLock<Credential>,
}

impl GraphApiSource {
    pub fn new(
        base_url: &str,
        credential: Credential,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Self::with_client(base_url, credential, build_http_client(config)?)
    }

    pub fn with_client(
        base_url: &str,
        credential: Credential,
        client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized)
            .with_context(|| format!("invalid graph api base url: {base_url}"))?;
        if base.cannot_be_a_base() {
            bail!("graph api base url cannot carry a path: {base_url}");
        }
        Ok(Self {
            base,
            client,
            credential: RwLock::new(credential),
        })
    }

    /// Snapshot of the credential currently used for requests.
    pub async fn credential(&self) -> Credential {
        self.credential.read().await.clone()
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RequestFailure> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RequestFailure::Other(format!("base url '{}' cannot carry a path", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, RequestFailure> {
        // The token travels in the query string, so only the bare URL goes into errors and logs.
        let display_url = url.as_str().to_string();
        let token = self.credential.read().await.access_token.clone();

        let resp = self
            .client
            .get(url)
            .query(query)
            .query(&[("access_token", token.as_str())])
            .send()
            .await
            .map_err(|source| RequestFailure::Transport {
                url: display_url.clone(),
                source: source.without_url(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(
                url = %display_url,
                status = status.as_u16(),
                "graph api request rejected"
            );
            return Err(RequestFailure::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|source| RequestFailure::Transport {
                url: display_url,
                source: source.without_url(),
            })?;
        serde_json::from_slice(&bytes).map_err(|err| RequestFailure::Decode(err.to_string()))
    }
}

#[async_trait]
impl RemoteSource for GraphApiSource {
    async fn refresh_credential(&self) -> Result<(), SourceError> {
        let url = self
            .endpoint(&["refresh_access_token"])
            .map_err(SourceError::Auth)?;
        let fresh: Credential = self
            .get_json(url, &[("grant_type", "ig_refresh_token")])
            .await
            .map_err(SourceError::Auth)?;

        tracing::info!(
            token_type = %fresh.token_type,
            expires_in = fresh.expires_in,
            "access token refreshed"
        );
        *self.credential.write().await = fresh;
        Ok(())
    }

    async fn list_known_ids(&self) -> Result<Vec<String>, SourceError> {
        let url = self.endpoint(&["me", "media"]).map_err(SourceError::Remote)?;
        let list: ItemList = self
            .get_json(url, &[("fields", "id")])
            .await
            .map_err(SourceError::Remote)?;
        Ok(list.ids())
    }

    async fn fetch_item(&self, id: &str) -> Result<Item, SourceError> {
        let url = self.endpoint(&[id]).map_err(SourceError::Remote)?;
        self.get_json(url, &[("fields", ITEM_FIELDS)])
            .await
            .map_err(SourceError::Remote)
    }
}
