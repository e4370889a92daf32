//! Failure scenario tests
//!
//! These tests verify how each component behaves when storage is unreachable:
//! - Direct engine calls surface the error
//! - A rejected write leaves the previous version and the sweep in place
//! - The rate limiter fails open, except for administrative clears
//! - A closed relational pool reports errors instead of panicking

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use fusion_store::storage::sqlite::SqliteBackend;
use fusion_store::{
    ItemKind, PageQuery, Payload, RateLimitConfig, RateLimiter, StorageConfig, StorageEngine,
    StorageError, StoredItem, open_storage,
};

use crate::helpers::*;

#[tokio::test]
async fn test_unreachable_engine_surfaces_errors() {
    let engine: Arc<dyn StorageEngine> = Arc::new(UnreachableEngine);

    let put = engine
        .put(StoredItem::custom(create_custom_record("c-1", "books")))
        .await;
    assert_matches!(put, Err(StorageError::ConnectionFailed(_)));

    let get = engine.get_by_id("c-1").await;
    assert_matches!(get, Err(StorageError::ConnectionFailed(_)));

    let delete = engine.delete("c-1").await;
    assert_matches!(delete, Err(StorageError::ConnectionFailed(_)));

    let query = engine.query(&PageQuery::new(ItemKind::Custom, 1, 10)).await;
    assert_matches!(query, Err(StorageError::ConnectionFailed(_)));
}

#[tokio::test]
async fn test_rejected_writes_keep_previous_state() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = StorageConfig {
        kv_table_path: Some(temp_dir.path().join("items-db")),
        ..StorageConfig::default()
    };
    let past = (Utc::now() - Duration::minutes(5)).timestamp();

    let expired_id = {
        let engine = open_storage(&config).await.unwrap();
        engine
            .put(StoredItem::custom(create_custom_record("c-1", "books")))
            .await
            .unwrap();
        let id = engine
            .put(StoredItem::fused(create_fused_record("Rey", 1)).with_expires_at(Some(past)))
            .await
            .unwrap();
        engine.close().await.unwrap();
        id
    };

    // a read-only table fails every mutation
    config.kv_read_only = true;
    let engine = open_storage(&config).await.unwrap();

    let mut edited = create_custom_record("c-1", "books");
    edited.title = "Edited".to_string();
    let put = engine.put(StoredItem::custom(edited)).await;
    assert_matches!(put, Err(StorageError::QueryFailed(_)));

    let stored = engine.get_by_id("c-1").await.unwrap().unwrap();
    assert_eq!(
        stored.payload,
        Payload::Custom(create_custom_record("c-1", "books"))
    );

    assert_eq!(engine.sweep_expired().await, 0);
    assert!(engine.get_by_id(&expired_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sweep_of_unreachable_engine_reports_nothing() {
    let engine: Arc<dyn StorageEngine> = Arc::new(UnreachableEngine);

    assert_eq!(engine.sweep_expired().await, 0);
}

#[tokio::test]
async fn test_rate_limiter_fails_open() {
    let limiter = RateLimiter::new(
        Arc::new(UnreachableEngine),
        RateLimitConfig {
            window_ms: 1000,
            max_requests: 1,
            ..RateLimitConfig::default()
        },
    );

    for now in 0..5 {
        assert!(!limiter.check_at("client", "/fusionados", now).await);
    }

    let info = limiter.info_at("client", "/fusionados", 0).await;
    assert_eq!(info.remaining, 1);
    assert_eq!(info.reset_time, 1000);
}

#[tokio::test]
async fn test_rate_limit_clear_propagates_error() {
    let limiter = RateLimiter::new(Arc::new(UnreachableEngine), RateLimitConfig::default());

    let result = limiter.clear("client", "/fusionados").await;

    assert_matches!(result, Err(StorageError::ConnectionFailed(_)));
}

#[tokio::test]
async fn test_closed_pool_reports_errors() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("closed.db"), 2)
        .await
        .unwrap();
    backend.close().await.unwrap();

    let result = backend
        .put(StoredItem::custom(create_custom_record("c-1", "books")))
        .await;
    assert!(result.is_err());

    assert_eq!(backend.sweep_expired().await, 0);

    let health = backend.health_check().await;
    assert!(health.is_err() || !health.unwrap().healthy);
}

#[tokio::test]
async fn test_delete_of_missing_id_is_not_an_error() {
    let engines = create_engines().await;

    for engine in engines.all() {
        assert!(engine.delete("never-stored").await.is_ok(), "{}", engine.backend_type());
    }
}
