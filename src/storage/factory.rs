//! Persistence facade: picks the storage engine once at startup

use std::sync::Arc;

use tracing::info;

use super::engine::StorageEngine;
use super::error::StorageResult;
use super::kv::KeyValueEngine;
use super::table::KvTable;
use crate::config::{BackendKind, StorageConfig};

/// Open the storage engine the configuration designates
///
/// The relational engine is chosen when the configuration names it,
/// otherwise the key-value engine. The returned handle is the only thing
/// downstream components see; the choice is fixed for its lifetime.
pub async fn open_storage(config: &StorageConfig) -> StorageResult<Arc<dyn StorageEngine>> {
    match config.backend {
        BackendKind::Relational => open_relational(config).await,
        BackendKind::KeyValue => {
            let table = match &config.kv_table_path {
                Some(path) if config.kv_read_only => KvTable::open_read_only(path)?,
                Some(path) => KvTable::open(path)?,
                None => KvTable::in_memory(),
            };
            info!("using key-value storage backend");
            Ok(Arc::new(KeyValueEngine::new(Arc::new(table))))
        }
    }
}

#[cfg(feature = "storage-sqlite")]
async fn open_relational(config: &StorageConfig) -> StorageResult<Arc<dyn StorageEngine>> {
    let backend = super::sqlite::SqliteBackend::new(&config.sqlite_path, config.pool_size).await?;
    info!("using relational storage backend");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "storage-sqlite"))]
async fn open_relational(_config: &StorageConfig) -> StorageResult<Arc<dyn StorageEngine>> {
    Err(super::error::StorageError::InvalidConfig(
        "relational backend requires the storage-sqlite feature".to_string(),
    ))
}
