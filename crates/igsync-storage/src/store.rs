use std::path::Path;
use std::time::Duration;

use igsync_core::Item;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to encode item: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to prepare store location '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Item table keyed by id with a descending index over the `timestamp` field.
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct ItemStore {
    pool: SqlitePool,
}

impl ItemStore {
    /// Open (creating if needed) the database file at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn contains(&self, id: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM items WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Ids from `ids` with no stored record, in input order.
    ///
    /// All lookups run inside one read transaction so they see a single snapshot.
    /// Repeated ids are reported once per occurrence.
    pub async fn missing_ids(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut missing = Vec::new();
        for id in ids {
            let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM items WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            if found.is_none() {
                missing.push(id.clone());
            }
        }
        tx.rollback().await?;
        Ok(missing)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Up to `limit` stored documents, newest `timestamp` first, exactly as written.
    pub async fn recent(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let docs = sqlx::query_scalar::<_, String>(
            "SELECT document FROM items \
             ORDER BY json_extract(document, '$.timestamp') DESC \
             LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(docs)
    }

    /// Open the write transaction that carries one batch of new items.
    pub async fn begin_batch(&self) -> Result<ItemBatch, StoreError> {
        Ok(ItemBatch {
            tx: self.pool.begin().await?,
            written: 0,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Pending writes of one batch. Dropping it without [`ItemBatch::commit`] rolls back.
pub struct ItemBatch {
    tx: Transaction<'static, Sqlite>,
    written: usize,
}

impl ItemBatch {
    /// Write `item` under its id, replacing any record written earlier in the batch.
    pub async fn put(&mut self, item: &Item) -> Result<(), StoreError> {
        let document = serde_json::to_string(item)?;
        sqlx::query(
            "INSERT INTO items (id, document) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET document = excluded.document",
        )
        .bind(&item.id)
        .bind(&document)
        .execute(&mut *self.tx)
        .await?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub async fn commit(self) -> Result<usize, StoreError> {
        self.tx.commit().await?;
        Ok(self.written)
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item(id: &str, timestamp: &str) -> Item {
        Item {
            id: id.to_string(),
            caption: format!("caption {id}"),
            media_type: "IMAGE".into(),
            media_url: format!("https://cdn.example/{id}.jpg"),
            permalink: format!("https://example/p/{id}"),
            username: "someone".into(),
            timestamp: timestamp.to_string(),
        }
    }

    async fn seed(store: &ItemStore, items: &[Item]) {
        let mut batch = store.begin_batch().await.expect("begin");
        for it in items {
            batch.put(it).await.expect("put");
        }
        batch.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/deeper/igsync.db");
        let store = ItemStore::open(&path).await.expect("open");
        assert!(path.exists());
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn committed_batch_is_visible() {
        let dir = tempdir().expect("tempdir");
        let store = ItemStore::open(dir.path().join("db.sqlite")).await.expect("open");
        seed(&store, &[item("a", "2021-01-01T00:00:00+0000")]).await;

        assert!(store.contains("a").await.unwrap());
        let stored: Item = serde_json::from_str(&store.recent(1).await.unwrap()[0]).unwrap();
        assert_eq!(stored.caption, "caption a");
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rolled_back_and_dropped_batches_leave_no_trace() {
        let dir = tempdir().expect("tempdir");
        let store = ItemStore::open(dir.path().join("db.sqlite")).await.expect("open");

        let mut batch = store.begin_batch().await.unwrap();
        batch.put(&item("a", "t1")).await.unwrap();
        batch.put(&item("b", "t2")).await.unwrap();
        assert_eq!(batch.written(), 2);
        batch.rollback().await.unwrap();

        {
            let mut batch = store.begin_batch().await.unwrap();
            batch.put(&item("c", "t3")).await.unwrap();
        }

        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn repeated_put_in_one_batch_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = ItemStore::open(dir.path().join("db.sqlite")).await.expect("open");

        let mut batch = store.begin_batch().await.unwrap();
        batch.put(&item("a", "t1")).await.unwrap();
        batch.put(&item("a", "t1")).await.unwrap();
        assert_eq!(batch.commit().await.unwrap(), 2);

        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_ids_preserves_order_and_repeats() {
        let dir = tempdir().expect("tempdir");
        let store = ItemStore::open(dir.path().join("db.sqlite")).await.expect("open");
        seed(&store, &[item("a", "t1"), item("b", "t2")]).await;

        let ids: Vec<String> = ["d", "a", "c", "b", "d"].iter().map(|s| s.to_string()).collect();
        let missing = store.missing_ids(&ids).await.unwrap();
        assert_eq!(missing, vec!["d", "c", "d"]);
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let dir = tempdir().expect("tempdir");
        let store = ItemStore::open(dir.path().join("db.sqlite")).await.expect("open");
        seed(
            &store,
            &[
                item("mid", "2021-06-01T00:00:00+0000"),
                item("old", "2020-01-01T00:00:00+0000"),
                item("new", "2022-03-04T05:06:07+0000"),
            ],
        )
        .await;

        let docs = store.recent(2).await.unwrap();
        let ids: Vec<String> = docs
            .iter()
            .map(|d| serde_json::from_str::<Item>(d).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["new", "mid"]);

        assert_eq!(store.recent(10).await.unwrap().len(), 3);
        assert!(store.recent(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopening_keeps_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("db.sqlite");
        {
            let store = ItemStore::open(&path).await.expect("open");
            seed(&store, &[item("a", "t1")]).await;
            store.close().await;
        }
        let store = ItemStore::open(&path).await.expect("reopen");
        assert!(store.contains("a").await.unwrap());
    }
}
