//! Local persistence for igsync: the SQLite item store and the on-disk asset directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod store;

pub use store::{ItemBatch, ItemStore, StoreError};

pub const CRATE_NAME: &str = "igsync-storage";

/// Longest slice of an error response body kept in an [`AssetError`].
const BODY_SNIPPET_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Build the reqwest client shared by the remote source and the asset fetcher.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to get URL '{url}': {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http request for '{url}' failed with status {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("failed to write asset '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AssetError {
    fn write(path: &Path, source: std::io::Error) -> Self {
        Self::Write {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Downloads one binary payload to a local path.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Create or overwrite `destination` with the body served at `url`.
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), AssetError>;
}

#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self::with_client(build_http_client(&config)?))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), AssetError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| AssetError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AssetError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }

        let mut file = fs::File::create(destination)
            .await
            .map_err(|err| AssetError::write(destination, err))?;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|source| AssetError::Request {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|err| AssetError::write(destination, err))?;
        }
        file.flush()
            .await
            .map_err(|err| AssetError::write(destination, err))?;

        tracing::debug!(url, path = %destination.display(), "asset downloaded");
        Ok(())
    }
}

fn body_snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_LIMIT {
        return body.to_string();
    }
    let mut end = BODY_SNIPPET_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// An asset written to a hidden staging file, waiting to be renamed into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAsset {
    pub staging_path: PathBuf,
    pub final_path: PathBuf,
}

/// Layout of the downloaded-asset directory: `{root}/{id}.{ext}`.
#[derive(Debug, Clone)]
pub struct AssetDir {
    root: PathBuf,
}

impl AssetDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure(&self) -> Result<(), AssetError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| AssetError::write(&self.root, err))
    }

    pub fn file_name(id: &str, extension: &str) -> String {
        let stem: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let ext = extension.trim_start_matches('.');
        format!("{stem}.{ext}")
    }

    /// Pick a fresh staging location for the asset of `id`.
    ///
    /// Staging names start with a dot so the static asset route never serves them.
    pub fn stage(&self, id: &str, extension: &str) -> StagedAsset {
        let final_name = Self::file_name(id, extension);
        StagedAsset {
            staging_path: self
                .root
                .join(format!(".{}.{}.part", Uuid::new_v4(), final_name)),
            final_path: self.root.join(final_name),
        }
    }

    pub async fn finalize(&self, staged: &StagedAsset) -> Result<(), AssetError> {
        fs::rename(&staged.staging_path, &staged.final_path)
            .await
            .map_err(|err| AssetError::write(&staged.final_path, err))
    }

    /// Remove a staging file; a file that was never created is not an error.
    pub async fn discard(&self, staged: &StagedAsset) {
        match fs::remove_file(&staged.staging_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %staged.staging_path.display(),
                error = %err,
                "failed to discard staged asset"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    async fn spawn_asset_server() -> String {
        let app = Router::new()
            .route("/ok.jpg", get(|| async { "fake image" }))
            .route(
                "/missing.jpg",
                get(|| async { (StatusCode::NOT_FOUND, "no such media") }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn file_names_are_flattened() {
        assert_eq!(AssetDir::file_name("1789", "jpg"), "1789.jpg");
        assert_eq!(AssetDir::file_name("../etc/passwd", ".jpg"), "___etc_passwd.jpg");
    }

    #[test]
    fn staging_paths_are_hidden_and_unique() {
        let dir = AssetDir::new("/tmp/assets");
        let a = dir.stage("aa", "jpg");
        let b = dir.stage("aa", "jpg");
        assert_eq!(a.final_path, PathBuf::from("/tmp/assets/aa.jpg"));
        assert_eq!(a.final_path, b.final_path);
        assert_ne!(a.staging_path, b.staging_path);
        let name = a.staging_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with('.'));
        assert!(name.ends_with(".part"));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let snippet = body_snippet(&body);
        assert_eq!(snippet.len(), BODY_SNIPPET_LIMIT + 3);
        assert_eq!(body_snippet("short"), "short");
    }

    #[tokio::test]
    async fn finalize_moves_staged_file_and_discard_tolerates_missing() {
        let tmp = tempdir().expect("tempdir");
        let dir = AssetDir::new(tmp.path().join("assets"));
        dir.ensure().await.expect("ensure");

        let staged = dir.stage("aa", "jpg");
        fs::write(&staged.staging_path, b"img").await.unwrap();
        dir.finalize(&staged).await.expect("finalize");
        assert!(!staged.staging_path.exists());
        assert_eq!(fs::read(&staged.final_path).await.unwrap(), b"img");

        let never_written = dir.stage("bb", "jpg");
        dir.discard(&never_written).await;
        assert!(!never_written.final_path.exists());
    }

    #[tokio::test]
    async fn http_fetcher_writes_body_to_destination() {
        let base = spawn_asset_server().await;
        let tmp = tempdir().expect("tempdir");
        let dest = tmp.path().join("aa.jpg");

        let fetcher = HttpAssetFetcher::new(HttpClientConfig::default()).expect("client");
        fetcher
            .fetch(&format!("{base}/ok.jpg"), &dest)
            .await
            .expect("fetch");

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "fake image");
    }

    #[tokio::test]
    async fn http_fetcher_reports_status_and_body() {
        let base = spawn_asset_server().await;
        let tmp = tempdir().expect("tempdir");
        let dest = tmp.path().join("bb.jpg");

        let fetcher = HttpAssetFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .fetch(&format!("{base}/missing.jpg"), &dest)
            .await
            .expect_err("404 must fail");

        match &err {
            AssetError::Status { status, body, .. } => {
                assert_eq!(*status, 404);
                assert_eq!(body, "no such media");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("status 404: no such media"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn http_fetcher_reports_unreachable_url() {
        let tmp = tempdir().expect("tempdir");
        let fetcher = HttpAssetFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .fetch("http://127.0.0.1:1/nothing.jpg", &tmp.path().join("x.jpg"))
            .await
            .expect_err("connection refused");
        assert!(matches!(err, AssetError::Request { .. }));
        assert!(err.to_string().starts_with("failed to get URL 'http://127.0.0.1:1/nothing.jpg'"));
    }
}
