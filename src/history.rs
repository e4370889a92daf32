//! History queries and the latest-fused snapshot cache
//!
//! Both sit on the storage contract only. The history service validates
//! page parameters and hands them to whichever engine is configured; the
//! cache is a read-through entry stored as an ordinary custom record.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::model::{CustomRecord, FusedRecord, ItemKind, PaginatedResponse, Payload, StoredItem};
use crate::storage::{PageQuery, StorageEngine, StorageError};

/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Page size when the caller does not name one
pub const DEFAULT_PAGE_LIMIT: i64 = 10;

const MAX_CATEGORY_LEN: usize = 100;

/// Storage key of the latest-fused cache entry
pub const LATEST_FUSED_KEY: &str = "fusionados_latest";

/// A rejected request parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Errors surfaced by the history service
#[derive(Debug)]
pub enum HistoryError {
    /// Caller supplied bad parameters
    Validation(ValidationError),

    /// Storage engine failed
    Storage(StorageError),

    /// The snapshot producer could not deliver a fresh record
    Upstream(String),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Validation(err) => write!(f, "validation error: {}", err),
            HistoryError::Storage(err) => write!(f, "{}", err),
            HistoryError::Upstream(msg) => write!(f, "failed to fetch fused data: {}", msg),
        }
    }
}

impl std::error::Error for HistoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HistoryError::Validation(err) => Some(err),
            HistoryError::Storage(err) => Some(err),
            HistoryError::Upstream(_) => None,
        }
    }
}

impl From<ValidationError> for HistoryError {
    fn from(err: ValidationError) -> Self {
        HistoryError::Validation(err)
    }
}

impl From<StorageError> for HistoryError {
    fn from(err: StorageError) -> Self {
        HistoryError::Storage(err)
    }
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Validate raw page parameters into an engine query
///
/// `page` must be at least 1, `limit` within `[1, 100]` and a category, when
/// present, between 1 and 100 characters.
pub fn validate_page_query(
    kind: ItemKind,
    page: i64,
    limit: i64,
    category: Option<&str>,
) -> Result<PageQuery, ValidationError> {
    if page < 1 || page > u32::MAX as i64 {
        return Err(ValidationError::new("page", "\"page\" must be greater than or equal to 1"));
    }
    if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
        return Err(ValidationError::new(
            "limit",
            format!("\"limit\" must be between 1 and {MAX_PAGE_LIMIT}"),
        ));
    }

    let mut query = PageQuery::new(kind, page as u32, limit as u32);
    if let Some(category) = category {
        let len = category.chars().count();
        if len == 0 || len > MAX_CATEGORY_LEN {
            return Err(ValidationError::new(
                "category",
                format!("\"category\" length must be between 1 and {MAX_CATEGORY_LEN}"),
            ));
        }
        query = query.with_category(category);
    }

    Ok(query)
}

/// Turns page requests into engine queries
pub struct HistoryService {
    storage: Arc<dyn StorageEngine>,
    degraded_mode: bool,
}

impl HistoryService {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self {
            storage,
            degraded_mode: false,
        }
    }

    /// Serve empty pages instead of storage errors
    pub fn with_degraded_mode(mut self, degraded_mode: bool) -> Self {
        self.degraded_mode = degraded_mode;
        self
    }

    /// Fetch one page of history, newest first
    ///
    /// The engine's page is returned verbatim: `items.len() <= limit` and
    /// `page`/`limit` are echoed unchanged.
    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        kind: ItemKind,
        page: i64,
        limit: i64,
        category: Option<&str>,
    ) -> HistoryResult<PaginatedResponse<StoredItem>> {
        let query = validate_page_query(kind, page, limit, category)?;

        match self.storage.query(&query).await {
            Ok(result) => {
                debug!(
                    "history page {} of {} returned {} items",
                    query.page,
                    kind,
                    result.items.len()
                );
                Ok(result)
            }
            Err(e) if self.degraded_mode => {
                warn!("storage unavailable, serving empty history page: {}", e);
                Ok(PaginatedResponse {
                    has_prev: false,
                    ..PaginatedResponse::empty(query.page, query.limit)
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Source of fresh fused snapshots (the upstream fusion pipeline)
#[async_trait]
pub trait SnapshotProducer: Send + Sync {
    async fn produce(&self) -> anyhow::Result<FusedRecord>;
}

/// Result of a latest-fused lookup
#[derive(Debug, Clone, PartialEq)]
pub struct LatestSnapshot {
    pub record: FusedRecord,

    /// Whether the record came from the cache entry
    pub from_cache: bool,

    /// Id of the persisted fused item, when known
    pub stored_id: Option<String>,
}

/// Read-through cache of the most recent fused snapshot
///
/// The entry is a custom record under [`LATEST_FUSED_KEY`] carrying the
/// snapshot and the id of the fused item it was persisted as. Cache reads and
/// writes are best-effort: a failure is logged and the call carries on.
pub struct LatestFusedCache {
    storage: Arc<dyn StorageEngine>,
    ttl_ms: i64,
    fused_ttl_secs: i64,
}

impl LatestFusedCache {
    pub fn new(storage: Arc<dyn StorageEngine>, ttl_secs: i64, fused_ttl_secs: i64) -> Self {
        Self {
            storage,
            ttl_ms: ttl_secs.saturating_mul(1000),
            fused_ttl_secs,
        }
    }

    /// Serve the cached snapshot when fresh, otherwise produce and store one
    pub async fn get_or_refresh(
        &self,
        producer: &dyn SnapshotProducer,
    ) -> HistoryResult<LatestSnapshot> {
        self.get_or_refresh_at(producer, Utc::now().timestamp_millis())
            .await
    }

    /// `get_or_refresh` with an explicit clock (epoch millis)
    #[instrument(skip(self, producer))]
    pub async fn get_or_refresh_at(
        &self,
        producer: &dyn SnapshotProducer,
        now: i64,
    ) -> HistoryResult<LatestSnapshot> {
        match self.read_cached(now).await {
            Ok(Some(snapshot)) => {
                info!("returning cached fused data");
                return Ok(snapshot);
            }
            Ok(None) => {}
            Err(e) => warn!("cache read failed, continuing without cache: {}", e),
        }

        let record = producer
            .produce()
            .await
            .map_err(|e| HistoryError::Upstream(e.to_string()))?;

        let item = StoredItem::fused_with_ttl(record.clone(), self.fused_ttl_secs)
            .with_timestamp(now);
        let stored_id = match self.storage.put(item).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("store failed, continuing without persistence: {}", e);
                None
            }
        };

        if let Err(e) = self.write_cached(&record, stored_id.as_deref(), now).await {
            warn!("cache write failed, continuing without cache: {}", e);
        }

        Ok(LatestSnapshot {
            record,
            from_cache: false,
            stored_id,
        })
    }

    async fn read_cached(&self, now: i64) -> Result<Option<LatestSnapshot>, StorageError> {
        let Some(item) = self.storage.get_by_id(LATEST_FUSED_KEY).await? else {
            return Ok(None);
        };

        if now.saturating_sub(item.timestamp) >= self.ttl_ms {
            debug!("cached fused data is stale");
            return Ok(None);
        }

        let Payload::Custom(mut cached) = item.payload else {
            return Err(StorageError::SerializationError(
                "cache entry is not a custom item".to_string(),
            ));
        };

        let Some(snapshot) = cached.metadata.remove("snapshot") else {
            return Ok(None);
        };
        let record: FusedRecord = serde_json::from_value(snapshot)?;
        let stored_id = cached
            .metadata
            .get("originalId")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Some(LatestSnapshot {
            record,
            from_cache: true,
            stored_id,
        }))
    }

    async fn write_cached(
        &self,
        record: &FusedRecord,
        stored_id: Option<&str>,
        now: i64,
    ) -> Result<(), StorageError> {
        let metadata = HashMap::from([
            ("originalId".to_string(), Value::from(stored_id)),
            ("snapshot".to_string(), serde_json::to_value(record)?),
        ]);

        let entry = CustomRecord {
            id: LATEST_FUSED_KEY.to_string(),
            title: "Latest Fused Data".to_string(),
            description: "Cached fusionados data".to_string(),
            category: "cache".to_string(),
            tags: vec!["cache".to_string(), "fusionados".to_string()],
            metadata,
            created_at: now,
            updated_at: now,
        };

        self.storage
            .put(StoredItem::custom(entry).with_timestamp(now))
            .await?;
        Ok(())
    }
}
