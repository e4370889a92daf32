//! Column families and key encoding of the persistent key-value table
//!
//! Key formats:
//! - `items`: `{id}`, value is the JSON item record
//! - `kind_index`: `{kind}:{desc_timestamp:020}:{desc_id}`, value names the item
//! - `expiry`: `{expires_at:020}:{id}`, value is the id
//!
//! Numbers are mapped onto `u64` so that zero-padded decimal keys sort like
//! the signed values they encode. The kind index stores the timestamp and id
//! complemented, so a forward iterator walks `(timestamp DESC, id DESC)`.

use rocksdb::{ColumnFamilyDescriptor, Options};

use crate::model::ItemKind;

/// Column family holding every item by primary key
pub const CF_ITEMS: &str = "items";

/// Column family ordering items of a kind newest first
pub const CF_KIND_INDEX: &str = "kind_index";

/// Column family ordering items by expiry deadline
pub const CF_EXPIRY: &str = "expiry";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_ITEMS, CF_KIND_INDEX, CF_EXPIRY];

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    ALL_CF_NAMES
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect()
}

/// Order-preserving map from `i64` to `u64`
fn sortable(value: i64) -> u64 {
    (value as u64) ^ (1 << 63)
}

pub fn item_key(id: &str) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Prefix shared by every index entry of a kind
pub fn index_prefix(kind: ItemKind) -> Vec<u8> {
    format!("{}:", kind).into_bytes()
}

/// Index entry key: newer timestamps and, on ties, greater ids sort first
pub fn index_key(kind: ItemKind, timestamp: i64, id: &str) -> Vec<u8> {
    let mut key = format!("{}:{:020}:", kind, !sortable(timestamp)).into_bytes();
    key.extend(id.bytes().map(|b| !b));
    // terminator sorts after every complemented byte, so longer ids come first
    key.push(0xFF);
    key
}

pub fn expiry_key(expires_at: i64, id: &str) -> Vec<u8> {
    format!("{:020}:{}", sortable(expires_at), id).into_bytes()
}

/// Exclusive upper bound of the expiry keys whose deadline lies before `now_secs`
pub fn expiry_bound(now_secs: i64) -> Vec<u8> {
    format!("{:020}:", sortable(now_secs)).into_bytes()
}
