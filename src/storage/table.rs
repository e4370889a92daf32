//! Embedded key-value table
//!
//! A small key-value store with the access pattern of a hosted document
//! table: single-item get/put/delete by primary key, plus a secondary index
//! on the item kind ordered by timestamp. The index only supports
//! **forward cursors**: a query returns at most `limit` evaluated entries and
//! a `last_evaluated_key` to continue from. There is no offset access.
//!
//! ## Backing stores
//!
//! - **In memory**: a map plus a `BTreeSet` index, gone with the process.
//!   This is what tests use.
//! - **RocksDB**: column families for items, the kind index and expiry
//!   deadlines (see [`keys`](super::keys)). An item and its index entries are
//!   written in one `WriteBatch`, so readers never observe one without the
//!   other. Mutations are serialized by a writer lock; reads are not.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use rocksdb::{ColumnFamily, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use super::error::{StorageError, StorageResult};
use super::keys::{
    self, ALL_CF_NAMES, CF_EXPIRY, CF_ITEMS, CF_KIND_INDEX, build_cf_descriptors,
};
use crate::model::{ItemKind, Payload, StoredItem};

/// Position in the in-memory kind index, newest first
///
/// Ordering is `(timestamp DESC, id DESC)`; the derived `Ord` on the
/// negated timestamp and reversed id gives exactly that.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexEntry {
    neg_timestamp: i64,
    id: std::cmp::Reverse<String>,
}

impl IndexEntry {
    fn for_item(item: &StoredItem) -> Self {
        Self {
            neg_timestamp: item.timestamp.saturating_neg(),
            id: std::cmp::Reverse(item.id.clone()),
        }
    }

    fn from_cursor(cursor: &CursorKey) -> Self {
        Self {
            neg_timestamp: cursor.timestamp.saturating_neg(),
            id: std::cmp::Reverse(cursor.id.clone()),
        }
    }

    fn id(&self) -> &str {
        &self.id.0
    }
}

/// Opaque continuation token of an index query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorKey {
    pub id: String,
    pub timestamp: i64,
}

/// Write condition for `put_item`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Overwrite whatever is stored under the key
    Always,

    /// Fail with `ConstraintViolation` if the key already exists
    IfNotExists,
}

/// A single forward query against the kind index
#[derive(Debug, Clone)]
pub struct IndexQuery {
    pub kind: ItemKind,
    pub limit: usize,
    pub exclusive_start_key: Option<CursorKey>,

    /// Filter expression on the payload category
    ///
    /// Applied after `limit` entries have been evaluated, so a filtered page
    /// can hold fewer than `limit` items.
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexQueryOutput {
    pub items: Vec<StoredItem>,

    /// Entries evaluated before filtering
    pub scanned_count: usize,

    /// Set when more entries remain after the evaluated ones
    pub last_evaluated_key: Option<CursorKey>,
}

fn matches_category(item_category: Option<&str>, wanted: Option<&str>) -> bool {
    wanted.is_none_or(|wanted| item_category == Some(wanted))
}

#[derive(Default)]
struct TableState {
    items: HashMap<String, StoredItem>,
    index: HashMap<ItemKind, BTreeSet<IndexEntry>>,
}

impl TableState {
    fn insert(&mut self, item: StoredItem) {
        self.remove(&item.id);
        self.index
            .entry(item.kind())
            .or_default()
            .insert(IndexEntry::for_item(&item));
        self.items.insert(item.id.clone(), item);
    }

    fn remove(&mut self, id: &str) -> Option<StoredItem> {
        let previous = self.items.remove(id)?;
        if let Some(entries) = self.index.get_mut(&previous.kind()) {
            entries.remove(&IndexEntry::for_item(&previous));
        }
        Some(previous)
    }

    fn query_index(&self, query: &IndexQuery) -> IndexQueryOutput {
        let Some(entries) = self.index.get(&query.kind) else {
            return IndexQueryOutput {
                items: Vec::new(),
                scanned_count: 0,
                last_evaluated_key: None,
            };
        };

        let lower = match &query.exclusive_start_key {
            Some(cursor) => Bound::Excluded(IndexEntry::from_cursor(cursor)),
            None => Bound::Unbounded,
        };

        let mut range = entries.range((lower, Bound::Unbounded));
        let mut items = Vec::new();
        let mut scanned_count = 0;
        let mut last_evaluated = None;

        for entry in range.by_ref().take(query.limit) {
            scanned_count += 1;
            last_evaluated = Some(entry);

            let Some(item) = self.items.get(entry.id()) else {
                continue;
            };
            if matches_category(item.payload.category(), query.category.as_deref()) {
                items.push(item.clone());
            }
        }

        let more_remaining = range.next().is_some();
        let last_evaluated_key = match last_evaluated {
            Some(entry) if more_remaining => Some(CursorKey {
                id: entry.id().to_string(),
                timestamp: entry.neg_timestamp.saturating_neg(),
            }),
            _ => None,
        };

        IndexQueryOutput {
            items,
            scanned_count,
            last_evaluated_key,
        }
    }

    fn count_index(&self, kind: ItemKind, category: Option<&str>) -> u64 {
        self.index
            .get(&kind)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| self.items.get(entry.id()))
                    .filter(|item| matches_category(item.payload.category(), category))
                    .count() as u64
            })
            .unwrap_or(0)
    }
}

/// Value of the `items` column family
#[derive(Debug, Serialize, Deserialize)]
struct ItemRecord {
    id: String,
    kind: ItemKind,
    timestamp: i64,
    data: Value,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl ItemRecord {
    fn from_item(item: &StoredItem) -> StorageResult<Self> {
        Ok(Self {
            id: item.id.clone(),
            kind: item.kind(),
            timestamp: item.timestamp,
            data: serde_json::to_value(&item.payload)?,
            expires_at: item.expires_at,
        })
    }

    fn into_item(self) -> StorageResult<StoredItem> {
        Ok(StoredItem {
            payload: Payload::from_value(self.kind, self.data)?,
            id: self.id,
            timestamp: self.timestamp,
            expires_at: self.expires_at,
        })
    }
}

/// Value of the `kind_index` column family
///
/// Carries the category so filters and counts never load the item.
#[derive(Debug, Serialize, Deserialize)]
struct IndexValue {
    id: String,
    timestamp: i64,
    #[serde(default)]
    category: Option<String>,
}

impl IndexValue {
    fn for_item(item: &StoredItem) -> Self {
        Self {
            id: item.id.clone(),
            timestamp: item.timestamp,
            category: item.payload.category().map(str::to_string),
        }
    }
}

struct RocksTable {
    db: DB,
    path: PathBuf,
    read_only: bool,
    writer: Mutex<()>,
}

impl RocksTable {
    fn open(path: &Path, read_only: bool) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let db = if read_only {
            DB::open_cf_for_read_only(&db_opts, path, ALL_CF_NAMES, false)
        } else {
            DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())
        }
        .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
            read_only,
            writer: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> StorageResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::InvalidConfig(format!("column family not found: {name}")))
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::QueryFailed(format!(
                "key-value table at {} is open read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn get(&self, id: &str) -> StorageResult<Option<StoredItem>> {
        let cf = self.cf(CF_ITEMS)?;
        match self.db.get_cf(&cf, keys::item_key(id))? {
            Some(bytes) => {
                let record: ItemRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(record.into_item()?))
            }
            None => Ok(None),
        }
    }

    /// Queue deletion of the index entries pointing at `item`
    fn unindex(&self, batch: &mut WriteBatch, item: &StoredItem) -> StorageResult<()> {
        let index_cf = self.cf(CF_KIND_INDEX)?;
        batch.delete_cf(&index_cf, keys::index_key(item.kind(), item.timestamp, &item.id));
        if let Some(deadline) = item.expires_at {
            let expiry_cf = self.cf(CF_EXPIRY)?;
            batch.delete_cf(&expiry_cf, keys::expiry_key(deadline, &item.id));
        }
        Ok(())
    }

    fn put(&self, item: &StoredItem, condition: PutCondition) -> StorageResult<()> {
        self.ensure_writable()?;
        let items_cf = self.cf(CF_ITEMS)?;
        let index_cf = self.cf(CF_KIND_INDEX)?;
        let expiry_cf = self.cf(CF_EXPIRY)?;

        let previous = self.get(&item.id)?;
        if condition == PutCondition::IfNotExists && previous.is_some() {
            return Err(StorageError::ConstraintViolation(format!(
                "item '{}' already exists",
                item.id
            )));
        }

        let mut batch = WriteBatch::default();
        if let Some(previous) = &previous {
            self.unindex(&mut batch, previous)?;
        }
        batch.put_cf(
            &items_cf,
            keys::item_key(&item.id),
            serde_json::to_vec(&ItemRecord::from_item(item)?)?,
        );
        batch.put_cf(
            &index_cf,
            keys::index_key(item.kind(), item.timestamp, &item.id),
            serde_json::to_vec(&IndexValue::for_item(item))?,
        );
        if let Some(deadline) = item.expires_at {
            batch.put_cf(&expiry_cf, keys::expiry_key(deadline, &item.id), item.id.as_bytes());
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> StorageResult<bool> {
        self.ensure_writable()?;
        let Some(previous) = self.get(id)? else {
            return Ok(false);
        };

        let items_cf = self.cf(CF_ITEMS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&items_cf, keys::item_key(id));
        self.unindex(&mut batch, &previous)?;

        self.db.write(batch)?;
        Ok(true)
    }

    fn query_index(&self, query: &IndexQuery) -> StorageResult<IndexQueryOutput> {
        let index_cf = self.cf(CF_KIND_INDEX)?;
        let prefix = keys::index_prefix(query.kind);
        let start = match &query.exclusive_start_key {
            Some(cursor) => keys::index_key(query.kind, cursor.timestamp, &cursor.id),
            None => prefix.clone(),
        };

        let iter = self
            .db
            .iterator_cf(&index_cf, IteratorMode::From(&start, Direction::Forward));

        let mut items = Vec::new();
        let mut scanned_count = 0;
        let mut last_evaluated = None;
        let mut more_remaining = false;

        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            if query.exclusive_start_key.is_some() && &*key == start.as_slice() {
                continue;
            }
            if scanned_count == query.limit {
                more_remaining = true;
                break;
            }
            scanned_count += 1;

            let entry: IndexValue = serde_json::from_slice(&value)?;
            if matches_category(entry.category.as_deref(), query.category.as_deref()) {
                if let Some(item) = self.get(&entry.id)? {
                    items.push(item);
                }
            }
            last_evaluated = Some(entry);
        }

        let last_evaluated_key = match last_evaluated {
            Some(entry) if more_remaining => Some(CursorKey {
                id: entry.id,
                timestamp: entry.timestamp,
            }),
            _ => None,
        };

        Ok(IndexQueryOutput {
            items,
            scanned_count,
            last_evaluated_key,
        })
    }

    fn count_index(&self, kind: ItemKind, category: Option<&str>) -> StorageResult<u64> {
        let index_cf = self.cf(CF_KIND_INDEX)?;
        let prefix = keys::index_prefix(kind);
        let iter = self
            .db
            .iterator_cf(&index_cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut count = 0;
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let entry: IndexValue = serde_json::from_slice(&value)?;
            if matches_category(entry.category.as_deref(), category) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn scan_expired(&self, now_secs: i64) -> StorageResult<Vec<String>> {
        let expiry_cf = self.cf(CF_EXPIRY)?;
        let bound = keys::expiry_bound(now_secs);

        let mut ids = Vec::new();
        for entry in self.db.iterator_cf(&expiry_cf, IteratorMode::Start) {
            let (key, value) = entry?;
            if &*key >= bound.as_slice() {
                break;
            }
            let id = String::from_utf8(value.to_vec())
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn len(&self) -> StorageResult<usize> {
        let cf = self.cf(CF_ITEMS)?;
        let mut count = 0;
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn flush(&self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        for name in ALL_CF_NAMES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }
}

enum Store {
    Memory(RwLock<TableState>),
    Rocks(RocksTable),
}

/// Key-value table with a kind/timestamp secondary index
pub struct KvTable {
    store: Store,
}

impl KvTable {
    /// Create an empty table that only lives in memory
    pub fn in_memory() -> Self {
        Self {
            store: Store::Memory(RwLock::new(TableState::default())),
        }
    }

    /// Open (or create) a RocksDB-backed table in the directory `path`
    #[instrument(skip_all)]
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let table = RocksTable::open(path, false)?;
        info!("opened key-value table at {}", path.display());
        Ok(Self {
            store: Store::Rocks(table),
        })
    }

    /// Open an existing table without taking its write lock
    ///
    /// Lets a second process inspect a table another process owns. Every
    /// mutation fails with `QueryFailed`.
    #[instrument(skip_all)]
    pub fn open_read_only(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let table = RocksTable::open(path, true)?;
        info!("opened key-value table at {} (read-only)", path.display());
        Ok(Self {
            store: Store::Rocks(table),
        })
    }

    /// Directory of the persistent table, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        match &self.store {
            Store::Memory(_) => None,
            Store::Rocks(table) => Some(&table.path),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(&self.store, Store::Rocks(table) if table.read_only)
    }

    pub async fn get_item(&self, id: &str) -> StorageResult<Option<StoredItem>> {
        match &self.store {
            Store::Memory(state) => Ok(state.read().await.items.get(id).cloned()),
            Store::Rocks(table) => table.get(id),
        }
    }

    pub async fn put_item(&self, item: StoredItem, condition: PutCondition) -> StorageResult<()> {
        match &self.store {
            Store::Memory(state) => {
                let mut state = state.write().await;
                if condition == PutCondition::IfNotExists && state.items.contains_key(&item.id) {
                    return Err(StorageError::ConstraintViolation(format!(
                        "item '{}' already exists",
                        item.id
                    )));
                }
                state.insert(item);
                Ok(())
            }
            Store::Rocks(table) => {
                let _writer = table.writer.lock().await;
                table.put(&item, condition)
            }
        }
    }

    /// Delete by key, returns whether anything was removed
    pub async fn delete_item(&self, id: &str) -> StorageResult<bool> {
        match &self.store {
            Store::Memory(state) => Ok(state.write().await.remove(id).is_some()),
            Store::Rocks(table) => {
                let _writer = table.writer.lock().await;
                table.delete(id)
            }
        }
    }

    /// Evaluate up to `limit` index entries after the start key
    pub async fn query_index(&self, query: &IndexQuery) -> StorageResult<IndexQueryOutput> {
        let output = match &self.store {
            Store::Memory(state) => state.read().await.query_index(query),
            Store::Rocks(table) => table.query_index(query)?,
        };

        debug!(
            "index query on {} evaluated {} entries, returned {}",
            query.kind,
            output.scanned_count,
            output.items.len()
        );
        Ok(output)
    }

    /// Count index entries of a kind, applying the same category filter
    pub async fn count_index(&self, kind: ItemKind, category: Option<&str>) -> StorageResult<u64> {
        match &self.store {
            Store::Memory(state) => Ok(state.read().await.count_index(kind, category)),
            Store::Rocks(table) => table.count_index(kind, category),
        }
    }

    /// Ids of the items whose deadline lies before `now_secs`
    pub async fn scan_expired(&self, now_secs: i64) -> StorageResult<Vec<String>> {
        match &self.store {
            Store::Memory(state) => Ok(state
                .read()
                .await
                .items
                .values()
                .filter(|item| item.is_expired_at(now_secs))
                .map(|item| item.id.clone())
                .collect()),
            Store::Rocks(table) => table.scan_expired(now_secs),
        }
    }

    pub async fn len(&self) -> StorageResult<usize> {
        match &self.store {
            Store::Memory(state) => Ok(state.read().await.items.len()),
            Store::Rocks(table) => table.len(),
        }
    }

    pub async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Flush memtables to disk; a no-op in memory and when read-only
    pub async fn flush(&self) -> StorageResult<()> {
        match &self.store {
            Store::Memory(_) => Ok(()),
            Store::Rocks(table) => table.flush(),
        }
    }
}
