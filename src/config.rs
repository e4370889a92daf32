//! Environment-style configuration
//!
//! Every variable is optional. Missing, unparsable or out-of-range values fall
//! back to the documented defaults; a bad value is logged, never fatal.
//! Counts, windows and TTLs must be positive.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::{trace, warn};

use crate::model::DEFAULT_FUSED_TTL_SECS;
use crate::rate_limit::RateLimitConfig;

const DB_ENGINE: &str = "DB_ENGINE";
const KV_TABLE_PATH: &str = "KV_TABLE_PATH";
const KV_READ_ONLY: &str = "KV_READ_ONLY";
const SQLITE_PATH: &str = "SQLITE_PATH";
const DB_POOL_SIZE: &str = "DB_POOL_SIZE";
const RATE_LIMIT_WINDOW_MS: &str = "RATE_LIMIT_WINDOW_MS";
const RATE_LIMIT_MAX_REQUESTS: &str = "RATE_LIMIT_MAX_REQUESTS";
const CACHE_TTL: &str = "CACHE_TTL";
const FUSED_TTL_SECS: &str = "FUSED_TTL_SECS";
const STORAGE_DEGRADED_MODE: &str = "STORAGE_DEGRADED_MODE";

const DEFAULT_SQLITE_PATH: &str = "./fusion-store.db";
const DEFAULT_POOL_SIZE: u32 = 4;
const DEFAULT_CACHE_TTL_SECS: i64 = 30 * 60;

/// Which storage engine backs the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Embedded key-value table (primary backend)
    #[default]
    KeyValue,

    /// SQLite table with a JSON payload column
    Relational,
}

impl BackendKind {
    /// Anything that does not name the relational engine selects key-value
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim().to_ascii_lowercase().as_str() {
            "relational" | "sqlite" | "sql" | "mysql" => BackendKind::Relational,
            "key-value" | "keyvalue" | "kv" | "dynamo" => BackendKind::KeyValue,
            other => {
                warn!("unknown storage backend '{other}', using key-value");
                BackendKind::KeyValue
            }
        }
    }
}

/// Storage engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: BackendKind,

    /// RocksDB directory of the key-value table (None = in-process only)
    pub kv_table_path: Option<PathBuf>,

    /// Open the key-value table without taking its write lock
    pub kv_read_only: bool,

    /// Path to the SQLite database file
    pub sqlite_path: PathBuf,

    /// Relational connection pool bound
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            kv_table_path: None,
            kv_read_only: false,
            sqlite_path: PathBuf::from(DEFAULT_SQLITE_PATH),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub storage: StorageConfig,

    pub rate_limit: RateLimitConfig,

    /// Validity of the latest-fused cache entry in seconds
    pub cache_ttl_secs: i64,

    /// `expires_at` horizon applied to new fused items
    pub fused_ttl_secs: i64,

    /// Serve empty history pages instead of failing when storage is down
    pub degraded_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            fused_ttl_secs: DEFAULT_FUSED_TTL_SECS,
            degraded_mode: false,
        }
    }
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();

        let storage = StorageConfig {
            backend: lookup(DB_ENGINE)
                .map(|selector| BackendKind::from_selector(&selector))
                .unwrap_or_default(),
            kv_table_path: lookup(KV_TABLE_PATH)
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            kv_read_only: lookup(KV_READ_ONLY)
                .map(|value| parse_flag(&value))
                .unwrap_or(defaults.storage.kv_read_only),
            sqlite_path: lookup(SQLITE_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.storage.sqlite_path),
            pool_size: parse_positive(&lookup, DB_POOL_SIZE, defaults.storage.pool_size),
        };

        let rate_limit = RateLimitConfig {
            window_ms: parse_positive(&lookup, RATE_LIMIT_WINDOW_MS, defaults.rate_limit.window_ms),
            max_requests: parse_positive(
                &lookup,
                RATE_LIMIT_MAX_REQUESTS,
                defaults.rate_limit.max_requests,
            ),
            ..defaults.rate_limit
        };

        let config = Config {
            storage,
            rate_limit,
            cache_ttl_secs: parse_positive(&lookup, CACHE_TTL, defaults.cache_ttl_secs),
            fused_ttl_secs: parse_positive(&lookup, FUSED_TTL_SECS, defaults.fused_ttl_secs),
            degraded_mode: lookup(STORAGE_DEGRADED_MODE)
                .map(|value| parse_flag(&value))
                .unwrap_or(defaults.degraded_mode),
        };

        trace!("loaded config: {config:?}");
        config
    }
}

/// Parse a strictly positive number, falling back to `default` otherwise
fn parse_positive<T: FromStr + Copy + PartialOrd + Default>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        Ok(_) => {
            warn!("{key} must be positive, got '{raw}', using default");
            default
        }
        Err(_) => {
            warn!("invalid value '{raw}' for {key}, using default");
            default
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
