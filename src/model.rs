//! Persisted data model
//!
//! ## Design Philosophy
//!
//! Every record lives in a **single keyspace** as a [`StoredItem`]:
//!
//! - `id` is the primary key, unique across both kinds
//! - `timestamp` (epoch millis) orders history queries
//! - `payload` is a tagged union; the kind is derived from it so the two
//!   can never disagree
//! - `expires_at` (epoch seconds) marks items for the cleanup sweep, it is
//!   never applied as a read filter
//!
//! Storage engines treat the payload as opaque JSON. The typed structs here
//! only exist so producers and consumers get compile-time shapes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default lifetime of a fused snapshot before the sweep may delete it
pub const DEFAULT_FUSED_TTL_SECS: i64 = 24 * 60 * 60;

/// Discriminates the payload shape of a stored item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Character + planet + weather snapshot
    Fused,

    /// Free-form user submission
    Custom,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Fused => "fused",
            ItemKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fused" => Ok(ItemKind::Fused),
            "custom" => Ok(ItemKind::Custom),
            other => Err(format!("unknown item kind '{other}' (expected fused or custom)")),
        }
    }
}

/// Upstream values that arrive either as numbers or as strings like "unknown"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Measure {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub height: Measure,
    pub mass: Measure,
    pub hair_color: String,
    pub skin_color: String,
    pub eye_color: String,
    pub birth_year: String,
    pub gender: String,
    pub homeworld: String,
    #[serde(default)]
    pub films: Vec<String>,
    #[serde(default)]
    pub species: Vec<String>,
    #[serde(default)]
    pub vehicles: Vec<String>,
    #[serde(default)]
    pub starships: Vec<String>,
    pub created: String,
    pub edited: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planet {
    pub name: String,
    pub rotation_period: String,
    pub orbital_period: String,
    pub diameter: Measure,
    pub climate: String,
    pub gravity: String,
    pub terrain: String,
    pub surface_water: String,
    pub population: Measure,
    #[serde(default)]
    pub residents: Vec<String>,
    #[serde(default)]
    pub films: Vec<String>,
    pub created: String,
    pub edited: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherLocation {
    pub name: String,
    pub region: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub tz_id: String,
    pub localtime_epoch: i64,
    pub localtime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherCondition {
    pub text: String,
    pub icon: String,
    pub code: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub last_updated_epoch: i64,
    pub last_updated: String,
    pub temp_c: f64,
    pub temp_f: f64,
    pub is_day: i64,
    pub condition: WeatherCondition,
    pub wind_kph: f64,
    pub wind_degree: f64,
    pub wind_dir: String,
    pub pressure_mb: f64,
    pub precip_mm: f64,
    pub humidity: f64,
    pub cloud: f64,
    pub feelslike_c: f64,
    pub vis_km: f64,
    pub uv: f64,
    pub gust_kph: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub location: WeatherLocation,
    pub current: CurrentWeather,
}

/// A combined snapshot of a character, its home planet and the weather there
///
/// Immutable once stored: every `put` of a fused record creates a new item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedRecord {
    pub character: Character,
    pub planet: Planet,
    pub weather: Weather,
    /// When the upstream pipeline produced the snapshot (epoch millis)
    pub fusion_timestamp: i64,
}

/// A free-form user submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Payload of a stored item, its variant determines the item kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Fused(FusedRecord),
    Custom(CustomRecord),
}

impl Payload {
    pub fn kind(&self) -> ItemKind {
        match self {
            Payload::Fused(_) => ItemKind::Fused,
            Payload::Custom(_) => ItemKind::Custom,
        }
    }

    /// Category of a custom payload, fused payloads have none
    pub fn category(&self) -> Option<&str> {
        match self {
            Payload::Fused(_) => None,
            Payload::Custom(custom) => Some(custom.category.as_str()),
        }
    }

    /// Decode a JSON payload whose kind is known from the surrounding row
    ///
    /// Untagged deserialization alone would guess; the stored kind column is
    /// authoritative.
    pub fn from_json(kind: ItemKind, json: &str) -> serde_json::Result<Self> {
        Ok(match kind {
            ItemKind::Fused => Payload::Fused(serde_json::from_str(json)?),
            ItemKind::Custom => Payload::Custom(serde_json::from_str(json)?),
        })
    }

    pub fn from_value(kind: ItemKind, value: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            ItemKind::Fused => Payload::Fused(serde_json::from_value(value)?),
            ItemKind::Custom => Payload::Custom(serde_json::from_value(value)?),
        })
    }
}

/// The only persisted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: String,
    /// Creation time in epoch millis
    pub timestamp: i64,
    pub payload: Payload,
    /// Optional deadline in epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl StoredItem {
    /// Wrap a fused snapshot with the default TTL
    ///
    /// The id is left empty; engines assign a fresh one on `put`.
    pub fn fused(record: FusedRecord) -> Self {
        Self::fused_with_ttl(record, DEFAULT_FUSED_TTL_SECS)
    }

    pub fn fused_with_ttl(record: FusedRecord, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            timestamp: now.timestamp_millis(),
            payload: Payload::Fused(record),
            expires_at: Some(now.timestamp().saturating_add(ttl_secs)),
        }
    }

    /// Wrap a custom record, keyed by the record's own id
    pub fn custom(record: CustomRecord) -> Self {
        Self {
            id: record.id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            payload: Payload::Custom(record),
            expires_at: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_expires_at(mut self, expires_at: Option<i64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn kind(&self) -> ItemKind {
        self.payload.kind()
    }

    /// Whether the sweep running at `now_secs` may delete this item
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline < now_secs)
    }
}

/// A uniform page of results, shared by both storage engines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> PaginatedResponse<T> {
    /// An empty page echoing the requested page and limit
    pub fn empty(page: u32, limit: u32) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page,
            limit,
            has_next: false,
            has_prev: page > 1,
        }
    }
}

/// Generate a fresh id for a fused item: `fused_{millis}_{9 random chars}`
pub fn fused_id(timestamp_millis: i64) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("fused_{}_{}", timestamp_millis, &random[..9])
}
