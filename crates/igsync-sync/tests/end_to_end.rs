use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use igsync_core::Item;
use igsync_storage::ItemStore;
use igsync_sync::{build_engine, SyncConfig, UpdateCycle};
use tokio::net::TcpListener;

struct FakeGraph {
    base: String,
}

async fn refresh() -> Json<serde_json::Value> {
    Json(serde_json::json!({"access_token": "fresh", "token_type": "bearer", "expires_in": 60}))
}

async fn listing() -> Json<serde_json::Value> {
    Json(serde_json::json!({"data": [{"id": "aa"}, {"id": "bb"}], "paging": {"cursors": {}}}))
}

async fn media(State(fake): State<Arc<FakeGraph>>, AxumPath(id): AxumPath<String>) -> Response {
    let timestamp = match id.as_str() {
        "aa" => "2021-07-01T10:00:00+0000",
        "bb" => "2021-07-02T09:00:00+0000",
        _ => return (StatusCode::NOT_FOUND, "unknown media").into_response(),
    };
    Json(serde_json::json!({
        "id": id,
        "caption": format!("post {id}"),
        "media_type": "IMAGE",
        "media_url": format!("{}/cdn/{id}.jpg", fake.base),
        "permalink": format!("https://example/p/{id}"),
        "username": "someone",
        "timestamp": timestamp
    }))
    .into_response()
}

async fn cdn(AxumPath(file): AxumPath<String>) -> String {
    format!("bytes of {file}")
}

async fn spawn_fake_graph() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new()
        .route("/refresh_access_token", get(refresh))
        .route("/me/media", get(listing))
        .route("/cdn/{file}", get(cdn))
        .route("/{id}", get(media))
        .with_state(Arc::new(FakeGraph { base: base.clone() }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

fn config(base: &str, root: &Path) -> SyncConfig {
    SyncConfig {
        db_path: root.join("igsync.db"),
        assets_dir: root.join("assets"),
        interval: Duration::from_secs(3600),
        graph_base_url: base.to_string(),
        access_token: "seed".into(),
        user_agent: "igsync-test".into(),
        http_timeout_secs: 5,
    }
}

#[tokio::test]
async fn empty_store_mirrors_remote_items_and_assets() {
    let base = spawn_fake_graph().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(&base, dir.path());

    let store = ItemStore::open(&config.db_path).await.expect("store");
    let engine = build_engine(&config, store.clone()).expect("engine");

    let summary = engine.run_cycle().await.expect("first cycle");
    assert_eq!(summary.new_items, 2);
    assert_eq!(summary.committed, 2);

    assert_eq!(store.len().await.unwrap(), 2);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("assets/aa.jpg")).unwrap(),
        "bytes of aa.jpg"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("assets/bb.jpg")).unwrap(),
        "bytes of bb.jpg"
    );

    let recent: Vec<Item> = store
        .recent(12)
        .await
        .unwrap()
        .iter()
        .map(|doc| serde_json::from_str(doc).unwrap())
        .collect();
    let ids: Vec<&str> = recent.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["bb", "aa"]);

    let again = engine.run_cycle().await.expect("second cycle");
    assert_eq!(again.new_items, 0);
    assert_eq!(store.len().await.unwrap(), 2);
}
