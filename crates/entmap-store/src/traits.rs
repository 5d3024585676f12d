use entmap_types::{RawKey, Record};

use crate::error::StoreResult;

/// Keyed record store.
///
/// All implementations must satisfy these invariants:
/// - `put` with an incomplete key allocates a fresh numeric id and returns
///   the completed key.
/// - `get_batch` returns one slot per requested key, in request order.
/// - Concurrent reads are always safe.
pub trait Datastore: Send + Sync {
    /// Read a record by key.
    ///
    /// Returns `Ok(None)` if the record does not exist.
    fn get(&self, key: &RawKey) -> StoreResult<Option<Record>>;

    /// Write a record, allocating an id first if its key is incomplete.
    fn put(&self, record: Record) -> StoreResult<RawKey>;

    /// Allocate a numeric id for `kind` under `parent`.
    fn allocate_id(&self, kind: &str, parent: Option<&RawKey>) -> StoreResult<i64>;

    /// Delete a record. Returns `true` if the record existed.
    fn delete(&self, key: &RawKey) -> StoreResult<bool>;

    /// All records of `kind`, in key order.
    fn scan_kind(&self, kind: &str) -> StoreResult<Vec<Record>>;

    /// Read multiple records in one round trip.
    ///
    /// Default implementation calls `get()` for each key. Backends may
    /// override for better performance.
    fn get_batch(&self, keys: &[RawKey]) -> StoreResult<Vec<Option<Record>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Write multiple records and return their completed keys.
    fn put_batch(&self, records: Vec<Record>) -> StoreResult<Vec<RawKey>> {
        records.into_iter().map(|record| self.put(record)).collect()
    }
}
