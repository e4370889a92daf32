//! Contract tests run against both storage engines
//!
//! These tests verify that:
//! - Items round-trip with deep-equal payloads
//! - Fused puts never upsert, custom puts always do
//! - History pages are newest first and never overlap
//! - The expiry sweep honours the strict deadline

use std::collections::HashSet;

use chrono::{Duration, Utc};
use fusion_store::{ItemKind, PageQuery, Payload, StoredItem};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_round_trip_preserves_payload() {
    let engines = create_engines().await;

    for engine in engines.all() {
        let fused = create_fused_record("Luke Skywalker", 1);
        let custom = create_custom_record("c-round-trip", "books");

        let fused_id = engine.put(StoredItem::fused(fused.clone())).await.unwrap();
        let custom_id = engine
            .put(StoredItem::custom(custom.clone()))
            .await
            .unwrap();

        let stored = engine.get_by_id(&fused_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, Payload::Fused(fused), "{}", engine.backend_type());

        let stored = engine.get_by_id(&custom_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, Payload::Custom(custom), "{}", engine.backend_type());
    }
}

#[tokio::test]
async fn test_custom_put_twice_never_duplicates() {
    let engines = create_engines().await;

    for engine in engines.all() {
        let mut record = create_custom_record("c-dup", "notes");
        engine.put(StoredItem::custom(record.clone())).await.unwrap();
        record.title = "edited".to_string();
        engine.put(StoredItem::custom(record)).await.unwrap();

        let page = engine
            .query(&PageQuery::new(ItemKind::Custom, 1, 100))
            .await
            .unwrap();
        let ids: Vec<&str> = page.items.iter().map(|i| i.id.as_str()).collect();
        let unique: HashSet<&str> = ids.iter().copied().collect();

        assert_eq!(ids.len(), unique.len(), "{}", engine.backend_type());
        assert_eq!(ids, vec!["c-dup"]);
    }
}

#[tokio::test]
async fn test_fused_put_always_generates_new_id() {
    let engines = create_engines().await;

    for engine in engines.all() {
        let mut item = StoredItem::fused(create_fused_record("Rey", 1));
        item.id = "caller-chosen".to_string();

        let first = engine.put(item.clone()).await.unwrap();
        let second = engine.put(item).await.unwrap();

        assert_ne!(first, second);
        assert_ne!(first, "caller-chosen");
        assert!(engine.get_by_id("caller-chosen").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_three_fused_items_first_page() {
    let engines = create_engines().await;

    for engine in engines.all() {
        let mut ids = Vec::new();
        for ts in [1_000, 2_000, 3_000] {
            let item = StoredItem::fused(create_fused_record("Finn", ts)).with_timestamp(ts);
            ids.push(engine.put(item).await.unwrap());
        }

        let page = engine
            .query(&PageQuery::new(ItemKind::Fused, 1, 2))
            .await
            .unwrap();
        let got: Vec<String> = page.items.iter().map(|i| i.id.clone()).collect();

        assert_eq!(got, vec![ids[2].clone(), ids[1].clone()], "{}", engine.backend_type());
        assert!(page.has_next);
        assert!(!page.has_prev);
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 2);
    }
}

#[tokio::test]
async fn test_engines_agree_on_every_page() {
    let engines = create_engines().await;

    for engine in engines.all() {
        for ts in 1..=11 {
            let item = StoredItem::custom(create_custom_record(&format!("c-{ts:02}"), "notes"))
                .with_timestamp(ts);
            engine.put(item).await.unwrap();
        }
    }

    for page in 1..=5 {
        let query = PageQuery::new(ItemKind::Custom, page, 3);
        let kv = engines.key_value.query(&query).await.unwrap();
        let sql = engines.relational.query(&query).await.unwrap();

        assert_eq!(kv, sql, "page {page}");
    }
}

#[tokio::test]
async fn test_category_filter_only_returns_matches() {
    let engines = create_engines().await;

    for engine in engines.all() {
        for (i, category) in ["books", "music", "books", "film", "books"].iter().enumerate() {
            let item = StoredItem::custom(create_custom_record(&format!("c-{i}"), category))
                .with_timestamp(i as i64);
            engine.put(item).await.unwrap();
        }

        let page = engine
            .query(&PageQuery::new(ItemKind::Custom, 1, 10).with_category("books"))
            .await
            .unwrap();

        assert_eq!(page.total, 3, "{}", engine.backend_type());
        assert_eq!(page.items.len(), 3);
        assert!(
            page.items
                .iter()
                .all(|item| item.payload.category() == Some("books"))
        );
    }
}

#[tokio::test]
async fn test_sweep_deletes_only_past_deadlines() {
    let engines = create_engines().await;
    let now = Utc::now();

    for engine in engines.all() {
        let past = engine
            .put(
                StoredItem::fused(create_fused_record("Dooku", 1))
                    .with_expires_at(Some((now - Duration::seconds(1)).timestamp())),
            )
            .await
            .unwrap();
        let at_deadline = engine
            .put(
                StoredItem::fused(create_fused_record("Grievous", 2))
                    .with_expires_at(Some(now.timestamp())),
            )
            .await
            .unwrap();
        let never = engine
            .put(StoredItem::fused(create_fused_record("Maul", 3)).with_expires_at(None))
            .await
            .unwrap();

        assert_eq!(engine.sweep_expired_before(now).await, 1, "{}", engine.backend_type());
        assert!(engine.get_by_id(&past).await.unwrap().is_none());
        assert!(engine.get_by_id(&at_deadline).await.unwrap().is_some());
        assert!(engine.get_by_id(&never).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_expired_items_still_readable_until_swept() {
    let engines = create_engines().await;

    for engine in engines.all() {
        let id = engine
            .put(StoredItem::fused(create_fused_record("Ackbar", 1)).with_expires_at(Some(0)))
            .await
            .unwrap();

        assert!(engine.get_by_id(&id).await.unwrap().is_some());
        let page = engine
            .query(&PageQuery::new(ItemKind::Fused, 1, 10))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }
}

#[tokio::test]
async fn test_key_value_table_reopens() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = fusion_store::StorageConfig {
        kv_table_path: Some(temp_dir.path().join("items-db")),
        ..Default::default()
    };

    let id = {
        let engine = fusion_store::open_storage(&config).await.unwrap();
        let id = engine
            .put(StoredItem::fused(create_fused_record("Poe", 1)))
            .await
            .unwrap();
        engine.close().await.unwrap();
        id
    };

    let engine = fusion_store::open_storage(&config).await.unwrap();
    assert!(engine.get_by_id(&id).await.unwrap().is_some());
}
