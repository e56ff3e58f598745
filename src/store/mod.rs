//! Persistent ordered key-value store backed by redb.
//!
//! All catalog state that survives restarts lives here: record blobs,
//! availability rows under both key directions, and the format dictionary.
//! Keys are fixed-layout byte strings (see [`keys`]) packed big-endian so
//! that redb's lexicographic ordering matches the natural ordering of the
//! packed integer fields, which is what makes prefix scans yield rows in
//! ascending id order.

pub mod keys;

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTableMetadata, TableDefinition};

use crate::error::{StoreError, StoreResult};

/// Single table holding every persisted row (byte keys, byte values).
const CATALOG_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("catalog");

/// On-disk size above which the store is considered already loaded and the
/// CSV cold load is skipped.
pub const WARM_START_THRESHOLD: u64 = 10_000;

/// Ordered embedded store for catalog state.
///
/// Writes are batched into single transactions during ingest; reads use
/// MVCC snapshots, so each request handler sees a consistent view.
pub struct Kv {
    db: Database,
    path: PathBuf,
}

impl Kv {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io { source: e })?;
            }
        }
        let db = Database::create(path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", path.display()),
        })?;

        // Make sure the table exists so read transactions never race its
        // creation.
        let txn = db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        txn.open_table(CATALOG_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Write a batch of key-value pairs in one transaction.
    ///
    /// Ingest calls this with a few thousand rows at a time; a failure here
    /// aborts the load.
    pub fn put_batch<I>(&self, entries: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut table = txn.open_table(CATALOG_TABLE).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            for (key, value) in entries {
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(|e| StoreError::Redb {
                        message: format!("insert failed: {e}"),
                    })?;
            }
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    /// Store a single key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.put_batch([(key.to_vec(), value.to_vec())])
    }

    /// Read a value by key. Returns `Ok(None)` if the key doesn't exist.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(CATALOG_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let result = table.get(key).map_err(|e| StoreError::Redb {
            message: format!("get failed: {e}"),
        })?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    /// Stream every `(key, value)` whose key starts with `prefix`, in key
    /// order, into the callback. This is the query-path scan: nothing is
    /// collected, so peak allocation stays at one row.
    pub fn for_each_prefix<F>(&self, prefix: &[u8], mut f: F) -> StoreResult<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(CATALOG_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;

        let end = prefix_successor(prefix);
        let range = match end.as_deref() {
            Some(end) => table.range::<&[u8]>(prefix..end),
            None => table.range::<&[u8]>(prefix..),
        }
        .map_err(|e| StoreError::Redb {
            message: format!("range failed: {e}"),
        })?;

        for entry in range {
            let (key, value) = entry.map_err(|e| StoreError::Redb {
                message: format!("range advance failed: {e}"),
            })?;
            f(key.value(), value.value());
        }
        Ok(())
    }

    /// Like [`Kv::for_each_prefix`], but stops early once the callback
    /// returns `false`. Used where a scan only needs a bounded count, such
    /// as "does a second holding library exist".
    pub fn for_each_prefix_while<F>(&self, prefix: &[u8], mut f: F) -> StoreResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(CATALOG_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;

        let end = prefix_successor(prefix);
        let range = match end.as_deref() {
            Some(end) => table.range::<&[u8]>(prefix..end),
            None => table.range::<&[u8]>(prefix..),
        }
        .map_err(|e| StoreError::Redb {
            message: format!("range failed: {e}"),
        })?;

        for entry in range {
            let (key, value) = entry.map_err(|e| StoreError::Redb {
                message: format!("range advance failed: {e}"),
            })?;
            if !f(key.value(), value.value()) {
                break;
            }
        }
        Ok(())
    }

    /// Collect every `(key, value)` under `prefix`. Ingest-path convenience;
    /// query code prefers [`Kv::for_each_prefix`].
    pub fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.for_each_prefix(prefix, |k, v| out.push((k.to_vec(), v.to_vec())))?;
        Ok(out)
    }

    /// Estimated stored size in bytes (key and value bytes in the table,
    /// not the raw file length, which redb pads with free pages).
    pub fn estimated_size(&self) -> u64 {
        let stats = self
            .db
            .begin_read()
            .ok()
            .and_then(|txn| txn.open_table(CATALOG_TABLE).ok())
            .and_then(|table| table.stats().ok());
        stats
            .map(|s| s.stored_bytes() + s.metadata_bytes())
            .unwrap_or(0)
    }

    /// Whether the store already holds a loaded catalog.
    pub fn is_warm(&self) -> bool {
        self.estimated_size() > WARM_START_THRESHOLD
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Kv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kv").field("path", &self.path).finish()
    }
}

/// Smallest byte string strictly greater than every key with this prefix,
/// or `None` when the prefix is all 0xff and the range is unbounded above.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Kv) {
        let dir = TempDir::new().unwrap();
        let kv = Kv::open(&dir.path().join("catalog.redb")).unwrap();
        (dir, kv)
    }

    #[test]
    fn put_and_get() {
        let (_dir, kv) = open_temp();
        kv.put(b"hello", b"world").unwrap();
        assert_eq!(kv.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(kv.get(b"missing").unwrap(), None);
    }

    #[test]
    fn batch_write_lands_atomically() {
        let (_dir, kv) = open_temp();
        kv.put_batch((0u8..10).map(|i| (vec![b'k', i], vec![i])))
            .unwrap();
        for i in 0u8..10 {
            assert_eq!(kv.get(&[b'k', i]).unwrap(), Some(vec![i]));
        }
    }

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let (_dir, kv) = open_temp();
        kv.put(b"ma\x00\x01", b"a").unwrap();
        kv.put(b"ma\x00\x02", b"b").unwrap();
        kv.put(b"mb\x00\x01", b"other").unwrap();

        let rows = kv.scan_prefix(b"ma").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].0 < rows[1].0);
        assert_eq!(rows[0].1, b"a");
    }

    #[test]
    fn streaming_scan_matches_collecting_scan() {
        let (_dir, kv) = open_temp();
        for i in 0u8..5 {
            kv.put(&[b'p', i], &[i]).unwrap();
        }
        let mut streamed = Vec::new();
        kv.for_each_prefix(b"p", |k, v| streamed.push((k.to_vec(), v.to_vec())))
            .unwrap();
        assert_eq!(streamed, kv.scan_prefix(b"p").unwrap());
    }

    #[test]
    fn prefix_successor_increments_last_byte() {
        assert_eq!(prefix_successor(b"ma"), Some(b"mb".to_vec()));
        assert_eq!(prefix_successor(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
    }

    #[test]
    fn fresh_store_is_cold() {
        let (_dir, kv) = open_temp();
        assert!(!kv.is_warm());
    }

    #[test]
    fn loaded_store_goes_warm() {
        let (_dir, kv) = open_temp();
        let row = vec![0u8; 64];
        kv.put_batch((0u16..500).map(|i| {
            let mut key = b"mk".to_vec();
            key.extend_from_slice(i.to_string().as_bytes());
            (key, row.clone())
        }))
        .unwrap();
        assert!(kv.is_warm());
    }
}
