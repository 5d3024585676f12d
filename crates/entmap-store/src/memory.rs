use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use entmap_types::{RawKey, Record};
use rand::Rng;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::Datastore;

/// Upper bound (exclusive) of scattered id allocation.
const MAX_SCATTERED_ID: i64 = 1 << 52;

/// Attempts before giving up on finding an unused id.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// In-memory, HashMap-based datastore.
///
/// Intended for tests and embedding. Records are held behind a `RwLock` for
/// safe concurrent access and cloned on read/write. Allocated ids are
/// scattered over `1..2^52` and never handed out twice.
pub struct InMemoryDatastore {
    records: RwLock<HashMap<RawKey, Record>>,
    allocated: RwLock<HashSet<i64>>,
    batch_reads: AtomicUsize,
}

impl InMemoryDatastore {
    /// Create a new empty datastore.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            allocated: RwLock::new(HashSet::new()),
            batch_reads: AtomicUsize::new(0),
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().expect("lock poisoned").is_empty()
    }

    /// Remove all records. Allocated ids stay reserved.
    pub fn clear(&self) {
        self.records.write().expect("lock poisoned").clear();
    }

    /// Number of `get_batch` round trips served so far.
    pub fn batch_reads(&self) -> usize {
        self.batch_reads.load(Ordering::Relaxed)
    }

    /// Return a sorted list of all keys in the store.
    pub fn all_keys(&self) -> Vec<RawKey> {
        let map = self.records.read().expect("lock poisoned");
        let mut keys: Vec<RawKey> = map.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore for InMemoryDatastore {
    fn get(&self, key: &RawKey) -> StoreResult<Option<Record>> {
        let map = self.records.read().expect("lock poisoned");
        Ok(map.get(key).cloned())
    }

    fn put(&self, mut record: Record) -> StoreResult<RawKey> {
        if !record.key.is_complete() {
            let id = self.allocate_id(record.key.kind(), record.key.parent())?;
            record.key = record.key.clone().complete(id);
        }
        let key = record.key.clone();
        let mut map = self.records.write().expect("lock poisoned");
        map.insert(key.clone(), record);
        Ok(key)
    }

    fn allocate_id(&self, kind: &str, _parent: Option<&RawKey>) -> StoreResult<i64> {
        let mut allocated = self.allocated.write().expect("lock poisoned");
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = rng.gen_range(1..MAX_SCATTERED_ID);
            if allocated.insert(candidate) {
                debug!(kind, id = candidate, "allocated id");
                return Ok(candidate);
            }
        }
        Err(StoreError::IdSpaceExhausted(kind.to_string()))
    }

    fn delete(&self, key: &RawKey) -> StoreResult<bool> {
        if !key.is_complete() {
            return Err(StoreError::IncompleteKey(key.clone()));
        }
        let mut map = self.records.write().expect("lock poisoned");
        Ok(map.remove(key).is_some())
    }

    fn scan_kind(&self, kind: &str) -> StoreResult<Vec<Record>> {
        let map = self.records.read().expect("lock poisoned");
        let mut found: Vec<Record> = map
            .values()
            .filter(|record| record.kind() == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    fn get_batch(&self, keys: &[RawKey]) -> StoreResult<Vec<Option<Record>>> {
        self.batch_reads.fetch_add(1, Ordering::Relaxed);
        let map = self.records.read().expect("lock poisoned");
        Ok(keys.iter().map(|key| map.get(key).cloned()).collect())
    }
}

impl std::fmt::Debug for InMemoryDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("InMemoryDatastore")
            .field("record_count", &count)
            .finish()
    }
}
