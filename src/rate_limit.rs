//! Sliding-window rate limiter
//!
//! ## State Machine
//!
//! One custom record per `(client, endpoint)` pair, stored under
//! `rate_limit_{client}_{endpoint}` through the ordinary storage contract:
//!
//! ```text
//! NoRecord ──first request──▶ WithinWindow ──count >= max──▶ LimitExceeded
//!                                 ▲                               │
//!                                 └──────── window rollover ◀─────┘
//! ```
//!
//! ## Consistency
//!
//! Each check is a plain read-modify-write with no locking, so two
//! concurrent checks for the same key can both pass. The count is
//! best-effort abuse mitigation, not exact accounting.
//!
//! ## Failure Policy
//!
//! Storage errors during a check are logged and the request is allowed
//! (fail-open). The limiter must never be the reason a request fails.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{CustomRecord, Payload, StoredItem};
use crate::storage::{StorageEngine, StorageError, StorageResult};

/// Limiter configuration, supplied by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Length of the sliding window in milliseconds
    pub window_ms: i64,

    /// Requests allowed within one window
    pub max_requests: u32,

    /// Text returned to rejected clients
    pub message: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 15 * 60 * 1000,
            max_requests: 100,
            message: "Rate limit exceeded. Please try again later.".to_string(),
        }
    }
}

/// Remaining quota for a `(client, endpoint)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub remaining: u32,

    /// When the current window ends (epoch millis)
    pub reset_time: i64,

    pub limit: u32,
}

/// Persisted window state, kept in the record's metadata map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WindowState {
    requests: Vec<i64>,
    #[serde(rename = "lastReset")]
    last_reset: i64,
}

impl WindowState {
    fn fresh(now: i64) -> Self {
        Self {
            requests: vec![now],
            last_reset: now,
        }
    }

    fn from_item(item: StoredItem) -> StorageResult<Self> {
        let Payload::Custom(record) = item.payload else {
            return Err(StorageError::SerializationError(format!(
                "rate limit record '{}' is not a custom item",
                item.id
            )));
        };
        let metadata = Value::Object(record.metadata.into_iter().collect());
        Ok(serde_json::from_value(metadata)?)
    }

    fn into_metadata(self) -> StorageResult<HashMap<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(StorageError::SerializationError(
                "window state did not serialize to an object".to_string(),
            )),
        }
    }

    /// Requests still inside the window ending at `now`
    fn within_window(&self, now: i64, window_ms: i64) -> Vec<i64> {
        let window_start = now.saturating_sub(window_ms);
        self.requests
            .iter()
            .copied()
            .filter(|&timestamp| timestamp > window_start)
            .collect()
    }
}

/// Storage key of the record tracking a `(client, endpoint)` pair
pub fn rate_limit_key(client_id: &str, endpoint: &str) -> String {
    format!("rate_limit_{client_id}_{endpoint}")
}

/// Sliding-window limiter backed by the storage contract
pub struct RateLimiter {
    storage: Arc<dyn StorageEngine>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(storage: Arc<dyn StorageEngine>, config: RateLimitConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record a request and report whether it must be rejected
    pub async fn is_rate_limited(&self, client_id: &str, endpoint: &str) -> bool {
        self.check_at(client_id, endpoint, Utc::now().timestamp_millis())
            .await
    }

    /// `is_rate_limited` with an explicit clock (epoch millis)
    #[instrument(skip(self))]
    pub async fn check_at(&self, client_id: &str, endpoint: &str, now: i64) -> bool {
        match self.try_check(client_id, endpoint, now).await {
            Ok(limited) => limited,
            Err(e) => {
                error!("error checking rate limit for {client_id} on {endpoint}: {e}");
                false
            }
        }
    }

    async fn try_check(&self, client_id: &str, endpoint: &str, now: i64) -> StorageResult<bool> {
        let key = rate_limit_key(client_id, endpoint);

        let Some(item) = self.storage.get_by_id(&key).await? else {
            debug!("first request from {client_id} on {endpoint}");
            self.write_state(&key, WindowState::fresh(now), now).await?;
            return Ok(false);
        };

        let state = WindowState::from_item(item)?;

        if now.saturating_sub(state.last_reset) > self.config.window_ms {
            debug!("window rolled over for {client_id} on {endpoint}");
            self.write_state(&key, WindowState::fresh(now), now).await?;
            return Ok(false);
        }

        let mut requests = state.within_window(now, self.config.window_ms);

        if requests.len() >= self.config.max_requests as usize {
            warn!(
                client_id,
                endpoint,
                requests = requests.len(),
                limit = self.config.max_requests,
                "rate limit exceeded for {client_id} on {endpoint}"
            );
            return Ok(true);
        }

        requests.push(now);
        let state = WindowState {
            requests,
            last_reset: state.last_reset,
        };
        self.write_state(&key, state, now).await?;

        Ok(false)
    }

    async fn write_state(&self, key: &str, state: WindowState, now: i64) -> StorageResult<()> {
        let record = CustomRecord {
            id: key.to_string(),
            title: "Rate Limit Data".to_string(),
            description: "Rate limiting information".to_string(),
            category: "system".to_string(),
            tags: vec!["rate-limit".to_string(), "system".to_string()],
            metadata: state.into_metadata()?,
            created_at: now,
            updated_at: now,
        };

        self.storage
            .put(StoredItem::custom(record).with_timestamp(now))
            .await?;
        Ok(())
    }

    /// Remaining quota without recording a request
    pub async fn get_info(&self, client_id: &str, endpoint: &str) -> RateLimitInfo {
        self.info_at(client_id, endpoint, Utc::now().timestamp_millis())
            .await
    }

    /// `get_info` with an explicit clock (epoch millis)
    #[instrument(skip(self))]
    pub async fn info_at(&self, client_id: &str, endpoint: &str, now: i64) -> RateLimitInfo {
        let untouched = RateLimitInfo {
            remaining: self.config.max_requests,
            reset_time: now.saturating_add(self.config.window_ms),
            limit: self.config.max_requests,
        };

        let key = rate_limit_key(client_id, endpoint);
        let state = match self.storage.get_by_id(&key).await {
            Ok(Some(item)) => WindowState::from_item(item),
            Ok(None) => return untouched,
            Err(e) => Err(e),
        };

        match state {
            Ok(state) => {
                let used = state.within_window(now, self.config.window_ms).len();
                RateLimitInfo {
                    remaining: self.config.max_requests.saturating_sub(used as u32),
                    reset_time: state.last_reset.saturating_add(self.config.window_ms),
                    limit: self.config.max_requests,
                }
            }
            Err(e) => {
                error!("error getting rate limit info for {client_id} on {endpoint}: {e}");
                untouched
            }
        }
    }

    /// Forget all recorded requests for a pair (administrative reset)
    #[instrument(skip(self))]
    pub async fn clear(&self, client_id: &str, endpoint: &str) -> StorageResult<()> {
        self.storage
            .delete(&rate_limit_key(client_id, endpoint))
            .await?;
        info!("rate limit cleared for {client_id} on {endpoint}");
        Ok(())
    }
}
