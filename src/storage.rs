//! Key-value storage layer
//!
//! Every component persists through [`KvStore`]. Multi-key mutations are
//! expressed as a list of [`BatchOp`]s and applied with a single atomic
//! `write_batch`, which is what keeps a settlement from half-applying.

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::{CasinoResult, StorageError};

/// A single mutation inside an atomic batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOp::Delete { key: key.into() }
    }

    pub fn put_json<T: Serialize>(key: impl Into<Vec<u8>>, value: &T) -> CasinoResult<Self> {
        let key = key.into();
        let bytes = serde_json::to_vec(value).map_err(|e| {
            StorageError::WriteFailed(format!(
                "Failed to encode value for {}: {}",
                String::from_utf8_lossy(&key),
                e
            ))
        })?;
        Ok(BatchOp::Put { key, value: bytes })
    }

    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply all operations atomically: either every op lands or none does.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Ordered scan of keys starting with `prefix`, resuming strictly after
    /// `start_after` when given.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.write_batch(vec![BatchOp::put(key, value)])
    }
}

/// Load and decode a JSON value
pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &[u8]) -> CasinoResult<Option<T>> {
    let Some(bytes) = store.get(key)? else {
        return Ok(None);
    };

    decode_json(key, &bytes).map(Some)
}

/// Decode every value under a prefix, newest/oldest order follows the key layout.
pub fn scan_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &[u8],
    limit: usize,
) -> CasinoResult<Vec<T>> {
    let rows = store.scan_prefix(prefix, None, limit)?;
    rows.iter().map(|(key, bytes)| decode_json(key, bytes)).collect()
}

pub fn decode_json<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> CasinoResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        StorageError::CorruptedData(format!(
            "Failed to decode {}: {}",
            String::from_utf8_lossy(key),
            e
        ))
        .into()
    })
}

/// RocksDB-backed store
#[derive(Clone)]
pub struct OptimizedStorage {
    db: Arc<DB>,
}

impl OptimizedStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(4);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path.as_ref()).map_err(|e| {
            StorageError::DatabaseOpenFailed(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for OptimizedStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.put(key, value),
                BatchOp::Delete { key } => batch.delete(key),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let start = start_after.unwrap_or(prefix);
        let mut rows = Vec::new();

        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            if start_after == Some(&key[..]) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::ReadFailed("memory store poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::WriteFailed("memory store poisoned".to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::ReadFailed("memory store poisoned".to_string()))?;
        let lower = match start_after {
            Some(after) => Bound::Excluded(after.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };

        Ok(data
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Wrapper that fails selected batch writes
///
/// After `skip` successful batches, the next `count` batches fail with
/// `WriteFailed`. Used to drive the rollback and recovery paths.
pub struct FaultInjectingStore {
    inner: Arc<dyn KvStore>,
    skip: AtomicUsize,
    fail: AtomicUsize,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            skip: AtomicUsize::new(0),
            fail: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes(&self, skip: usize, count: usize) {
        self.skip.store(skip, Ordering::SeqCst);
        self.fail.store(count, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail.store(0, Ordering::SeqCst);
    }
}

impl KvStore for FaultInjectingStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) > 0 {
            let skipped = self
                .skip
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| s.checked_sub(1))
                .is_ok();
            if !skipped {
                self.fail.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::WriteFailed("injected write failure".to_string()));
            }
        }
        self.inner.write_batch(ops)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.inner.scan_prefix(prefix, start_after, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise_store(store: &dyn KvStore) {
        store
            .write_batch(vec![
                BatchOp::put("a:1", "one"),
                BatchOp::put("a:2", "two"),
                BatchOp::put("a:3", "three"),
                BatchOp::put("b:1", "other"),
            ])
            .unwrap();

        assert_eq!(store.get(b"a:2").unwrap(), Some(b"two".to_vec()));

        let rows = store.scan_prefix(b"a:", None, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, b"a:1".to_vec());

        let rows = store.scan_prefix(b"a:", Some(b"a:1"), 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, b"a:2".to_vec());

        store
            .write_batch(vec![BatchOp::delete("a:2"), BatchOp::put("a:4", "four")])
            .unwrap();
        assert_eq!(store.get(b"a:2").unwrap(), None);
        assert_eq!(store.scan_prefix(b"a:", None, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_memory_storage() {
        exercise_store(&MemoryStorage::new());
    }

    #[test]
    fn test_rocksdb_storage() {
        let dir = TempDir::new().unwrap();
        let store = OptimizedStorage::new(dir.path()).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_fault_injection_skips_then_fails() {
        let store = FaultInjectingStore::new(Arc::new(MemoryStorage::new()));
        store.fail_writes(1, 1);

        assert!(store.put(b"k1", b"v").is_ok());
        assert!(store.put(b"k2", b"v").is_err());
        assert!(store.put(b"k3", b"v").is_ok());
        assert_eq!(store.get(b"k2").unwrap(), None);
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStorage::new();
        let op = BatchOp::put_json("json:1", &vec![1u32, 2, 3]).unwrap();
        store.write_batch(vec![op]).unwrap();

        let loaded: Option<Vec<u32>> = load_json(&store, b"json:1").unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
        let missing: Option<Vec<u32>> = load_json(&store, b"json:2").unwrap();
        assert!(missing.is_none());
    }
}
