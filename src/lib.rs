pub mod config;
pub mod history;
pub mod model;
pub mod rate_limit;
pub mod storage;

pub use config::{BackendKind, Config, StorageConfig};
pub use history::{
    HistoryError, HistoryService, LatestFusedCache, LatestSnapshot, SnapshotProducer,
    ValidationError,
};
pub use model::{
    CustomRecord, FusedRecord, ItemKind, PaginatedResponse, Payload, StoredItem,
};
pub use rate_limit::{RateLimitConfig, RateLimitInfo, RateLimiter};
pub use storage::{PageQuery, StorageEngine, StorageError, StorageResult, open_storage};
