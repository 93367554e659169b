//! Axum read API for igsync: recent items as JSON plus the downloaded assets.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use igsync_core::MAX_RECENT_ITEMS;
use igsync_storage::ItemStore;
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "igsync-web";

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub listen_addr: String,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3333".to_string(),
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: std::env::var("IGSYNC_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            request_timeout: std::env::var("IGSYNC_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            shutdown_grace: std::env::var("IGSYNC_SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: ItemStore,
    pub assets_dir: PathBuf,
}

impl AppState {
    pub fn new(store: ItemStore, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            assets_dir: assets_dir.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueryError::BadRequest(_) => StatusCode::BAD_REQUEST,
            QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Resolve the `count` query parameter: absent or empty means the maximum,
/// anything else must be a positive integer and is capped at the maximum.
pub fn parse_count(raw: Option<&str>) -> Result<usize, QueryError> {
    let raw = match raw {
        None | Some("") => return Ok(MAX_RECENT_ITEMS),
        Some(raw) => raw,
    };
    match raw.parse::<i64>() {
        Ok(n) if n >= 1 => Ok((n as u64).min(MAX_RECENT_ITEMS as u64) as usize),
        _ => Err(QueryError::BadRequest(format!("bad count value: {raw}"))),
    }
}

/// Most recent stored documents, newest first, as the raw JSON that was stored.
pub async fn query_recent(
    store: &ItemStore,
    count: Option<&str>,
) -> Result<Vec<Box<RawValue>>, QueryError> {
    let count = parse_count(count)?;
    let docs = store
        .recent(count)
        .await
        .map_err(|err| QueryError::Internal(format!("failed to view the db: {err}")))?;
    docs.into_iter()
        .map(|doc| {
            RawValue::from_string(doc)
                .map_err(|err| QueryError::Internal(format!("failed to encode: {err}")))
        })
        .collect()
}

#[derive(Debug, Deserialize, Default)]
struct ItemsQuery {
    count: Option<String>,
}

pub fn app(state: AppState, config: &WebConfig) -> Router {
    Router::new()
        .route("/items", get(items_handler))
        .route("/assets/{*path}", get(asset_handler))
        .with_state(Arc::new(state))
        .layer(middleware::from_fn_with_state(
            config.request_timeout,
            timeout_middleware,
        ))
        .layer(middleware::from_fn(request_log_middleware))
}

async fn items_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> Response {
    let docs = match query_recent(&state.store, query.count.as_deref()).await {
        Ok(docs) => docs,
        Err(err) => return err.into_response(),
    };
    let body = match serde_json::to_vec(&docs) {
        Ok(body) => body,
        Err(err) => {
            return QueryError::Internal(format!("failed to encode: {err}")).into_response()
        }
    };
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response()
}

async fn asset_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(path): AxumPath<String>,
) -> Response {
    let Some(relative) = servable_asset_path(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let full = state.assets_dir.join(&relative);
    match tokio::fs::read(&full).await {
        Ok(bytes) => {
            ([(header::CONTENT_TYPE, content_type_for(&relative))], bytes).into_response()
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            warn!(path = %full.display(), error = %err, "failed to read asset");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to read asset").into_response()
        }
    }
}

/// Only plain files directly or below the asset root are served: no directory
/// listings, no parent components, no hidden (staging) files.
fn servable_asset_path(path: &str) -> Option<PathBuf> {
    if path.is_empty() || path.ends_with('/') {
        return None;
    }
    let candidate = Path::new(path);
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) if !part.to_string_lossy().starts_with('.') => out.push(part),
            _ => return None,
        }
    }
    Some(out)
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

async fn timeout_middleware(State(limit): State<Duration>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response(),
    }
}

async fn force_close_middleware(
    State(force_close): State<CancellationToken>,
    req: Request,
    next: Next,
) -> Response {
    tokio::select! {
        resp = next.run(req) => resp,
        _ = force_close.cancelled() => {
            (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response()
        }
    }
}

async fn request_log_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header_value = HeaderValue::from_str(&request_id)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    req.headers_mut().insert(REQUEST_ID_HEADER, header_value.clone());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let started = Instant::now();

    let mut resp = next.run(req).await;
    resp.headers_mut().insert(REQUEST_ID_HEADER, header_value);

    info!(
        request_id = %request_id,
        %method,
        path = %path,
        status = resp.status().as_u16(),
        agent = %agent,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "http request"
    );
    resp
}

/// The read API server with a start/stop lifecycle and bounded graceful shutdown.
pub struct HttpServer {
    config: WebConfig,
    state: AppState,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpServer {
    pub fn new(config: WebConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Address actually bound, once [`HttpServer::start`] is listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve until [`HttpServer::stop`]. In-flight requests get the configured
    /// grace period. Handlers still running after it are cut off with a 503,
    /// which lets their connections close, and `start` returns without
    /// waiting for them.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.serve_router(app(self.state.clone(), &self.config)).await
    }

    async fn serve_router(&self, router: Router) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| {
                format!("failed to create listener on '{}'", self.config.listen_addr)
            })?;
        let addr = listener.local_addr().context("reading bound address")?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        info!(%addr, "server is ready to handle requests");

        let force_close = CancellationToken::new();
        let router = router.layer(middleware::from_fn_with_state(
            force_close.clone(),
            force_close_middleware,
        ));
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .into_future();

        let token = self.shutdown.clone();
        let grace = self.config.shutdown_grace;
        let forced = async move {
            token.cancelled().await;
            info!("server is shutting down");
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            res = serve => res.with_context(|| format!("failed to serve on {addr}"))?,
            _ = forced => {
                warn!(
                    grace_secs = grace.as_secs_f64(),
                    "grace period elapsed; closing remaining connections"
                );
                force_close.cancel();
            }
        }

        info!("server stopped");
        Ok(())
    }

    /// Request shutdown. Never blocks; repeated calls are harmless.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("stopping server");
        }
        self.shutdown.cancel();
    }
}

/// Convenience for `igsync serve`: run with env config until the token fires.
pub async fn serve_until(
    config: WebConfig,
    state: AppState,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let server = Arc::new(HttpServer::new(config, state));
    let stopper = server.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        stopper.stop();
    });
    server.start().await
}
