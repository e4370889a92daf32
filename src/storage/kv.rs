//! Key-value storage engine
//!
//! Implements `StorageEngine` on top of [`KvTable`], using only the
//! operations a hosted key-value store offers: single-item access and a
//! forward-only cursor over the kind index.
//!
//! ## Pagination
//!
//! The index has no offsets, so reaching page N means replaying N-1 cursor
//! advances with the same page size before issuing the real query. That is
//! O(page²) index work across a full walk of the history. Callers that page
//! deep should expect it to get slower.
//!
//! `total` comes from a separate full-index count and is only eventually
//! consistent with the page contents under concurrent writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};

use super::engine::{HealthStatus, PageQuery, StorageEngine};
use super::error::StorageResult;
use super::table::{IndexQuery, KvTable, PutCondition};
use crate::model::{ItemKind, PaginatedResponse, StoredItem, fused_id};

/// Storage engine over the embedded key-value table
pub struct KeyValueEngine {
    table: Arc<KvTable>,
}

impl KeyValueEngine {
    pub fn new(table: Arc<KvTable>) -> Self {
        Self { table }
    }

    /// Engine over a fresh table that only lives in memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(KvTable::in_memory()))
    }

    pub fn table(&self) -> &Arc<KvTable> {
        &self.table
    }

    fn index_query(query: &PageQuery) -> IndexQuery {
        IndexQuery {
            kind: query.kind,
            limit: query.limit as usize,
            exclusive_start_key: None,
            category: query.effective_category().map(str::to_string),
        }
    }
}

#[async_trait]
impl StorageEngine for KeyValueEngine {
    #[instrument(skip(self, item), fields(kind = %item.kind()))]
    async fn put(&self, mut item: StoredItem) -> StorageResult<String> {
        let condition = match item.kind() {
            ItemKind::Fused => {
                item.id = fused_id(item.timestamp);
                PutCondition::IfNotExists
            }
            ItemKind::Custom => PutCondition::Always,
        };

        let id = item.id.clone();
        self.table.put_item(item, condition).await?;

        info!("stored item with id: {}", id);
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: &str) -> StorageResult<Option<StoredItem>> {
        self.table.get_item(id).await
    }

    #[instrument(skip(self), fields(kind = %query.kind, page = query.page, limit = query.limit))]
    async fn query(&self, query: &PageQuery) -> StorageResult<PaginatedResponse<StoredItem>> {
        let mut index_query = Self::index_query(query);

        // replay the cursor up to the requested page
        for warmup in 1..query.page {
            let output = self.table.query_index(&index_query).await?;
            match output.last_evaluated_key {
                Some(cursor) => index_query.exclusive_start_key = Some(cursor),
                None => {
                    debug!("cursor exhausted after {} pages", warmup);
                    let total = self
                        .table
                        .count_index(query.kind, query.effective_category())
                        .await?;
                    return Ok(PaginatedResponse {
                        total,
                        ..PaginatedResponse::empty(query.page, query.limit)
                    });
                }
            }
        }

        let output = self.table.query_index(&index_query).await?;
        let total = self
            .table
            .count_index(query.kind, query.effective_category())
            .await?;

        debug!(
            "page {} returned {} items (total {})",
            query.page,
            output.items.len(),
            total
        );

        Ok(PaginatedResponse {
            items: output.items,
            total,
            page: query.page,
            limit: query.limit,
            has_next: output.last_evaluated_key.is_some(),
            has_prev: query.page > 1,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StorageResult<()> {
        if self.table.delete_item(id).await? {
            info!("deleted item with id: {}", id);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(now = %now))]
    async fn sweep_expired_before(&self, now: DateTime<Utc>) -> usize {
        let expired = match self.table.scan_expired(now.timestamp()).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("failed to scan for expired items: {}", e);
                return 0;
            }
        };
        let mut deleted = 0;

        for id in &expired {
            match self.table.delete_item(id).await {
                Ok(true) => deleted += 1,
                Ok(false) => debug!("expired item {} already gone", id),
                Err(e) => error!("failed to delete expired item {}: {}", id, e),
            }
        }

        info!("cleaned up {} of {} expired items", deleted, expired.len());
        deleted
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let mut metadata = HashMap::from([
            ("backend".to_string(), "key-value".to_string()),
            ("items".to_string(), self.table.len().await?.to_string()),
        ]);
        if let Some(path) = self.table.path() {
            metadata.insert("db_path".to_string(), path.display().to_string());
            metadata.insert(
                "read_only".to_string(),
                self.table.is_read_only().to_string(),
            );
        }

        Ok(HealthStatus {
            healthy: true,
            message: "key-value backend operational".to_string(),
            metadata,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing key-value backend");
        self.table.flush().await
    }

    fn backend_type(&self) -> &str {
        "key-value"
    }
}
