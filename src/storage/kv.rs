//! Embedded key-value store backing the WAL, checkpoint store, and saga
//! store. `sled` gives us ordered iteration (so zero-padded sequence keys
//! come back in sequence order for free) and single-key atomic
//! read-modify-write via `fetch_and_update`, which the WAL's sequence
//! counter and the ownership coordinator's fencing tokens both need.

use crate::errors::{EngineError, Result};
use std::path::Path;

/// Thin wrapper over a `sled::Tree` scoped by key prefix convention. All of
/// the WAL/checkpoint/saga-store/ownership modules share one `KvStore`
/// instance and partition it by key prefix, per spec.md §6's persisted
/// state layout.
#[derive(Clone)]
pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| EngineError::StorageError(e.to_string()))?;
        Ok(Self { db })
    }

    /// An in-memory store, used by tests and by components that don't need
    /// durability (e.g. unit tests exercising the WAL in isolation).
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EngineError::StorageError(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map(|opt| opt.map(|v| v.to_vec()))
            .map_err(|e| EngineError::StorageError(e.to_string()))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| EngineError::StorageError(e.to_string()))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.db
            .remove(key)
            .map(|_| ())
            .map_err(|e| EngineError::StorageError(e.to_string()))
    }

    /// Returns `(key, value)` pairs under `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| EngineError::StorageError(e.to_string()))?;
            let key = String::from_utf8_lossy(&k).into_owned();
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }

    /// Deletes every key under `prefix` in a single batch.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in self.db.scan_prefix(prefix) {
            let (k, _) = item.map_err(|e| EngineError::StorageError(e.to_string()))?;
            batch.remove(k);
            count += 1;
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| EngineError::StorageError(e.to_string()))?;
        Ok(count)
    }

    /// Atomically increments the little-endian u64 stored at `key` and
    /// returns the new value. Used for per-saga WAL sequence counters and
    /// per-shard fencing tokens.
    pub fn next_sequence(&self, key: &str) -> Result<u64> {
        let previous = self
            .db
            .fetch_and_update(key, |old| {
                let next = old
                    .map(|bytes| {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(&bytes[..8.min(bytes.len())]);
                        u64::from_le_bytes(buf)
                    })
                    .unwrap_or(0)
                    + 1;
                Some(next.to_le_bytes().to_vec())
            })
            .map_err(|e| EngineError::StorageError(e.to_string()))?;
        let previous = previous
            .map(|bytes| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8.min(bytes.len())]);
                u64::from_le_bytes(buf)
            })
            .unwrap_or(0);
        Ok(previous + 1)
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| EngineError::StorageError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotone_and_gap_free() {
        let kv = KvStore::temporary().unwrap();
        let seqs: Vec<u64> = (0..5).map(|_| kv.next_sequence("wal-seq:s1").unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn scan_prefix_returns_key_order() {
        let kv = KvStore::temporary().unwrap();
        kv.put("wal:s1:00000000000000000002", b"b").unwrap();
        kv.put("wal:s1:00000000000000000001", b"a").unwrap();
        let entries = kv.scan_prefix("wal:s1:").unwrap();
        assert_eq!(entries[0].1, b"a");
        assert_eq!(entries[1].1, b"b");
    }

    #[test]
    fn delete_prefix_removes_all_matching_keys() {
        let kv = KvStore::temporary().unwrap();
        kv.put("wal:s1:1", b"a").unwrap();
        kv.put("wal:s1:2", b"b").unwrap();
        kv.put("wal:s2:1", b"c").unwrap();
        let removed = kv.delete_prefix("wal:s1:").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.scan_prefix("wal:s1:").unwrap().len(), 0);
        assert_eq!(kv.scan_prefix("wal:s2:").unwrap().len(), 1);
    }
}
