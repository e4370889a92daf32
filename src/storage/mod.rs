//! Storage engines for item persistence
//!
//! This module provides a trait-based abstraction over the two engines that
//! can hold the item keyspace.
//!
//! ## Design
//!
//! - **Trait-based**: `StorageEngine` is the only surface callers see
//! - **Async**: All operations are async and may suspend the calling task
//! - **Chosen once**: [`open_storage`] picks the engine from configuration at
//!   startup; nothing branches on the engine per call
//!
//! ## Engines
//!
//! - **Key-value** (default): embedded table with a kind/timestamp index and
//!   forward cursors, in memory or backed by RocksDB; pages are reached by
//!   cursor replay
//! - **Relational**: SQLite table with a JSON payload column and offset
//!   pagination
//!
//! ## Usage
//!
//! ```no_run
//! use fusion_store::config::StorageConfig;
//! use fusion_store::storage::open_storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = open_storage(&StorageConfig::default()).await?;
//!     // Hand `storage` to the rate limiter and history service
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod factory;
pub mod keys;
pub mod kv;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;
pub mod table;

pub use engine::{HealthStatus, PageQuery, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use factory::open_storage;
pub use kv::KeyValueEngine;
pub use table::KvTable;
