//! Relational storage engine (SQLite)
//!
//! This module provides a SQLite-based implementation of the `StorageEngine` trait.
//!
//! ## Features
//!
//! - **Single table**: `items` with a JSON payload column and a
//!   `(kind, timestamp)` index
//! - **Offset pagination**: `LIMIT ? OFFSET ?` ordered by `timestamp DESC`
//! - **Pushed-down filters**: category matched with `json_extract` in SQL
//! - **Bounded pool**: callers queue for a connection when the pool is busy
//! - **Migrations**: automatic schema versioning with sqlx
//!
//! ## Consistency
//!
//! Each page and its `COUNT(*)` run inside one transaction, so `total`
//! agrees with the page it is reported alongside.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, error, info, instrument, warn};

use super::engine::{HealthStatus, PageQuery, StorageEngine};
use super::error::{StorageError, StorageResult};
use crate::model::{ItemKind, PaginatedResponse, Payload, StoredItem, fused_id};

/// Default bound of the connection pool
pub const DEFAULT_POOL_SIZE: u32 = 4;

/// SQLite storage engine
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create the `items` table
    /// 3. Configure SQLite for concurrent readers (WAL mode)
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use fusion_store::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./fusion-store.db", 4).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>, pool_size: u32) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        info!("SQLite connection pool created ({} connections)", pool_size);

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn row_to_item(row: &SqliteRow) -> StorageResult<StoredItem> {
        let kind_str: String = row.try_get("kind")?;
        let kind: ItemKind = kind_str
            .parse()
            .map_err(StorageError::SerializationError)?;
        let data: String = row.try_get("data")?;
        let payload = Payload::from_json(kind, &data).map_err(|e| {
            StorageError::SerializationError(format!("failed to deserialize payload: {}", e))
        })?;

        Ok(StoredItem {
            id: row.try_get("id")?,
            timestamp: row.try_get("timestamp")?,
            payload,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn filter_clause(query: &PageQuery) -> &'static str {
        match query.effective_category() {
            Some(_) => "WHERE kind = ? AND json_extract(data, '$.category') = ?",
            None => "WHERE kind = ?",
        }
    }
}

#[async_trait]
impl StorageEngine for SqliteBackend {
    #[instrument(skip(self, item), fields(kind = %item.kind()))]
    async fn put(&self, mut item: StoredItem) -> StorageResult<String> {
        let sql = match item.kind() {
            ItemKind::Fused => {
                item.id = fused_id(item.timestamp);
                r#"
                INSERT INTO items (id, kind, timestamp, data, expires_at)
                VALUES (?, ?, ?, ?, ?)
                "#
            }
            ItemKind::Custom => {
                r#"
                INSERT INTO items (id, kind, timestamp, data, expires_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    kind = excluded.kind,
                    timestamp = excluded.timestamp,
                    data = excluded.data,
                    expires_at = excluded.expires_at
                "#
            }
        };

        let data = serde_json::to_string(&item.payload).map_err(|e| {
            StorageError::SerializationError(format!("failed to serialize payload: {}", e))
        })?;

        sqlx::query(sql)
            .bind(&item.id)
            .bind(item.kind().as_str())
            .bind(item.timestamp)
            .bind(data)
            .bind(item.expires_at)
            .execute(&self.pool)
            .await?;

        info!("stored item with id: {}", item.id);
        Ok(item.id)
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: &str) -> StorageResult<Option<StoredItem>> {
        let row = sqlx::query(
            "SELECT id, kind, timestamp, data, expires_at FROM items WHERE id = ? LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    #[instrument(skip(self), fields(kind = %query.kind, page = query.page, limit = query.limit))]
    async fn query(&self, query: &PageQuery) -> StorageResult<PaginatedResponse<StoredItem>> {
        let filter = Self::filter_clause(query);
        let category = query.effective_category();
        let offset = query.offset();

        let page_sql = format!(
            r#"
            SELECT id, kind, timestamp, data, expires_at
            FROM items
            {}
            ORDER BY timestamp DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
            filter
        );
        let count_sql = format!("SELECT COUNT(*) FROM items {}", filter);

        let mut tx = self.pool.begin().await?;

        let mut page_query = sqlx::query(&page_sql).bind(query.kind.as_str());
        if let Some(category) = category {
            page_query = page_query.bind(category);
        }
        let rows = page_query
            .bind(query.limit as i64)
            .bind(offset as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql).bind(query.kind.as_str());
        if let Some(category) = category {
            count_query = count_query.bind(category);
        }
        let (total,) = count_query.fetch_one(&mut *tx).await?;

        tx.commit().await?;

        let items = rows
            .iter()
            .map(Self::row_to_item)
            .collect::<StorageResult<Vec<_>>>()?;
        let total = total.max(0) as u64;

        debug!("query returned {} items (total {})", items.len(), total);

        Ok(PaginatedResponse {
            items,
            total,
            page: query.page,
            limit: query.limit,
            has_next: offset + (query.limit as u64) < total,
            has_prev: query.page > 1,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!("deleted item with id: {}", id);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(now = %now))]
    async fn sweep_expired_before(&self, now: DateTime<Utc>) -> usize {
        let result =
            sqlx::query("DELETE FROM items WHERE expires_at IS NOT NULL AND expires_at < ?")
                .bind(now.timestamp())
                .execute(&self.pool)
                .await;

        match result {
            Ok(result) => {
                let deleted = result.rows_affected() as usize;
                info!("cleaned up {} expired items", deleted);
                deleted
            }
            Err(e) => {
                error!("error cleaning up expired items: {}", e);
                0
            }
        }
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "relational".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());
                metadata.insert("pool_size".to_string(), self.pool.size().to_string());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }

    fn backend_type(&self) -> &str {
        "relational"
    }
}
