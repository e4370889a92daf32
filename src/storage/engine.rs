//! Storage engine trait definition
//!
//! This module defines the core `StorageEngine` trait that both
//! storage variants (key-value and relational) implement.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::model::{ItemKind, PaginatedResponse, StoredItem};

/// Parameters of a history page request
///
/// Engines assume `page >= 1` and `limit >= 1`; validation happens in the
/// history service before a query reaches an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub kind: ItemKind,

    /// 1-based page number
    pub page: u32,

    /// Maximum number of items on the page
    pub limit: u32,

    /// Restricts custom items by payload category; ignored for fused items
    pub category: Option<String>,
}

impl PageQuery {
    pub fn new(kind: ItemKind, page: u32, limit: u32) -> Self {
        Self {
            kind,
            page,
            limit,
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Category filter that actually applies to this query's kind
    pub fn effective_category(&self) -> Option<&str> {
        match self.kind {
            ItemKind::Custom => self.category.as_deref(),
            ItemKind::Fused => None,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.limit as u64
    }
}

/// Health status of a storage engine
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the engine operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional engine-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Storage-agnostic contract shared by every engine
///
/// The rate limiter, the history service and the fusion pipeline only ever
/// see this trait; which engine sits behind it is decided once by
/// [`open_storage`](super::factory::open_storage).
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared across
/// concurrently running requests.
///
/// ## Error Handling
///
/// Methods return `StorageResult<T>`. Nothing in this layer retries; retry
/// policy belongs to the caller. A missing item is `Ok(None)`, never an error.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Persist an item and return its id
    ///
    /// - **Custom**: keyed by the caller's id, a second put with the same id
    ///   overwrites (upsert)
    /// - **Fused**: a fresh unique id is generated on every call, the
    ///   supplied id is ignored
    ///
    /// The write is all-or-nothing: readers never observe a partial item.
    async fn put(&self, item: StoredItem) -> StorageResult<String>;

    /// Fetch a single item, `None` when it does not exist
    async fn get_by_id(&self, id: &str) -> StorageResult<Option<StoredItem>>;

    /// Fetch one page of items of a kind, newest first
    ///
    /// `total` is computed by a separate count and may drift from what the
    /// pages contain under concurrent writes.
    async fn query(&self, query: &PageQuery) -> StorageResult<PaginatedResponse<StoredItem>>;

    /// Delete an item; deleting a missing id succeeds
    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// Delete every item whose `expires_at` lies before `now`
    ///
    /// Best-effort: per-item failures are logged and skipped, and errors are
    /// never returned. Yields the number of items deleted.
    async fn sweep_expired_before(&self, now: DateTime<Utc>) -> usize;

    /// Delete every item that has expired as of now
    async fn sweep_expired(&self) -> usize {
        self.sweep_expired_before(Utc::now()).await
    }

    /// Check engine health with a lightweight operation
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Release pooled connections and flush pending state
    async fn close(&self) -> StorageResult<()>;

    /// Engine type identifier
    fn backend_type(&self) -> &str;
}
