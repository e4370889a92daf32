//! Helper functions for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fusion_store::storage::{HealthStatus, KeyValueEngine, KvTable};
use fusion_store::{
    CustomRecord, FusedRecord, PageQuery, PaginatedResponse, StorageEngine, StorageError,
    StorageResult, StoredItem,
};
use tempfile::TempDir;

pub fn create_fused_record(name: &str, fusion_timestamp: i64) -> FusedRecord {
    serde_json::from_value(serde_json::json!({
        "character": {
            "name": name,
            "height": 172,
            "mass": "unknown",
            "hair_color": "blond",
            "skin_color": "fair",
            "eye_color": "blue",
            "birth_year": "19BBY",
            "gender": "male",
            "homeworld": "https://swapi.dev/api/planets/1/",
            "films": ["https://swapi.dev/api/films/1/"],
            "species": [],
            "vehicles": [],
            "starships": [],
            "created": "2014-12-09T13:50:51.644000Z",
            "edited": "2014-12-20T21:17:56.891000Z",
            "url": "https://swapi.dev/api/people/1/"
        },
        "planet": {
            "name": "Tatooine",
            "rotation_period": "23",
            "orbital_period": "304",
            "diameter": 10465,
            "climate": "arid",
            "gravity": "1 standard",
            "terrain": "desert",
            "surface_water": "1",
            "population": "unknown",
            "residents": [],
            "films": [],
            "created": "2014-12-09T13:50:49.641000Z",
            "edited": "2014-12-20T20:58:18.411000Z",
            "url": "https://swapi.dev/api/planets/1/"
        },
        "weather": {
            "location": {
                "name": "Tunis",
                "region": "Tunis",
                "country": "Tunisia",
                "lat": 36.8,
                "lon": 10.18,
                "tz_id": "Africa/Tunis",
                "localtime_epoch": 1700000000,
                "localtime": "2023-11-14 23:13"
            },
            "current": {
                "last_updated_epoch": 1700000000,
                "last_updated": "2023-11-14 23:00",
                "temp_c": 18.5,
                "temp_f": 65.3,
                "is_day": 0,
                "condition": { "text": "Clear", "icon": "", "code": 1000 },
                "wind_kph": 11.2,
                "wind_degree": 270,
                "wind_dir": "W",
                "pressure_mb": 1016,
                "precip_mm": 0,
                "humidity": 64,
                "cloud": 0,
                "feelslike_c": 18.5,
                "vis_km": 10,
                "uv": 1,
                "gust_kph": 15.8
            }
        },
        "fusion_timestamp": fusion_timestamp
    }))
    .unwrap()
}

pub fn create_custom_record(id: &str, category: &str) -> CustomRecord {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": format!("Submission {id}"),
        "description": "Submitted through the API",
        "category": category,
        "tags": ["integration"],
        "metadata": { "priority": 3, "nested": { "ok": true } },
        "created_at": 1700000000000i64,
        "updated_at": 1700000000000i64
    }))
    .unwrap()
}

/// Both engines, so contract tests can run against each
pub struct Engines {
    pub key_value: Arc<dyn StorageEngine>,
    pub relational: Arc<dyn StorageEngine>,
    _temp_dir: TempDir,
}

impl Engines {
    pub fn all(&self) -> [&Arc<dyn StorageEngine>; 2] {
        [&self.key_value, &self.relational]
    }
}

pub async fn create_engines() -> Engines {
    let temp_dir = tempfile::tempdir().unwrap();
    let relational = fusion_store::storage::sqlite::SqliteBackend::new(
        temp_dir.path().join("items.db"),
        4,
    )
    .await
    .unwrap();

    let table = KvTable::open(temp_dir.path().join("kv")).unwrap();

    Engines {
        key_value: Arc::new(KeyValueEngine::new(Arc::new(table))),
        relational: Arc::new(relational),
        _temp_dir: temp_dir,
    }
}

/// Engine whose every call fails as if the store were unreachable
pub struct UnreachableEngine;

fn unreachable() -> StorageError {
    StorageError::ConnectionFailed("connection refused".to_string())
}

#[async_trait]
impl StorageEngine for UnreachableEngine {
    async fn put(&self, _item: StoredItem) -> StorageResult<String> {
        Err(unreachable())
    }

    async fn get_by_id(&self, _id: &str) -> StorageResult<Option<StoredItem>> {
        Err(unreachable())
    }

    async fn query(&self, _query: &PageQuery) -> StorageResult<PaginatedResponse<StoredItem>> {
        Err(unreachable())
    }

    async fn delete(&self, _id: &str) -> StorageResult<()> {
        Err(unreachable())
    }

    async fn sweep_expired_before(&self, _now: DateTime<Utc>) -> usize {
        0
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Err(unreachable())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_type(&self) -> &str {
        "unreachable"
    }
}
