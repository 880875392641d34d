//! KV foundation: a thin, safe wrapper over the libmdbx embedded store.
//!
//! libmdbx is a copy-on-write B+tree with MVCC and a memory-mapped file:
//! one writer at a time, many concurrent readers, each reader pinned to the
//! snapshot its transaction started on. This crate is the only place in the
//! workspace that talks to the engine; everything above works in terms of
//! [`KvEnv`], [`KvReadTxn`], and [`KvWriteTxn`].
//!
//! # Transaction model
//!
//! MDBX enforces "one thread, one transaction". A [`KvReadTxn`] therefore
//! represents the single read transaction a logical operation holds on a
//! thread: begin it once, run every read of the operation through it, and
//! drop it to release the snapshot. Overlapping read transactions on the
//! same thread are a caller bug; the scoped API makes that hard to write.
//!
//! Values handed out by transactions are copied out of the map once at the
//! read site. The mmap slice itself never outlives its transaction.
//!
//! # Failure model
//!
//! Engine errors surface as [`KvError`] with a kind per failure class
//! (`EnvOpen`, `TxnBegin`, `TableOpen`, `KeyNotFound`, `CorruptData`,
//! `MapFull`, `ReadersFull`) and convert into `common::DbError` at the
//! public boundary. Writers retry once on `MapFull` (the default geometry
//! auto-grows); `CorruptData` is fatal for the environment and triggers
//! tier recovery above.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{DbError, DbResult};
use libmdbx::{Database, DatabaseOptions, NoWriteMap, TableFlags, WriteFlags};

type RoTxn<'db> = libmdbx::Transaction<'db, libmdbx::RO, NoWriteMap>;
type RwTxn<'db> = libmdbx::Transaction<'db, libmdbx::RW, NoWriteMap>;

/// KV-layer error, one variant per failure class.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The environment could not be created, opened, or locked.
    #[error("Failed to open environment: {0}")]
    EnvOpen(String),

    /// A transaction could not be started.
    #[error("Failed to begin transaction: {0}")]
    TxnBegin(String),

    /// A named table could not be opened or created.
    #[error("Failed to open table '{table}': {message}")]
    TableOpen { table: String, message: String },

    /// The requested key does not exist.
    #[error("Key not found")]
    KeyNotFound,

    /// Stored bytes failed validation; the environment needs recovery.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// The map is full and could not be grown.
    #[error("Map full: {0}")]
    MapFull(String),

    /// The reader table is exhausted.
    #[error("Readers full: {0}")]
    ReadersFull(String),

    /// Any other engine error.
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Maps a KV-layer error into the API-boundary envelope.
pub fn db_err(err: KvError) -> DbError {
    match err {
        KvError::EnvOpen(m) => DbError::Unavailable(m),
        KvError::TxnBegin(m) => DbError::Unavailable(m),
        KvError::TableOpen { table, message } => {
            DbError::Unavailable(format!("table '{table}': {message}"))
        }
        KvError::KeyNotFound => DbError::NotFound("key not found".to_string()),
        KvError::CorruptData(m) => DbError::Corrupt(m),
        KvError::MapFull(m) => DbError::OutOfSpace(m),
        KvError::ReadersFull(m) => DbError::Unavailable(m),
        KvError::Engine(m) => DbError::Other(m),
    }
}

/// Classify a libmdbx error message into a [`KvError`].
///
/// The high-level crate reports engine errors by display string, so the
/// mapping keys off the well-known MDBX error names.
fn classify(err: libmdbx::Error) -> KvError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("map") && lower.contains("full") {
        KvError::MapFull(text)
    } else if lower.contains("corrupt") {
        KvError::CorruptData(text)
    } else if lower.contains("readers") {
        KvError::ReadersFull(text)
    } else {
        KvError::Engine(text)
    }
}

/// One libmdbx environment: a single mmap-backed file tree holding multiple
/// named tables.
///
/// Cloning is cheap; clones share the same underlying environment.
#[derive(Clone)]
pub struct KvEnv {
    db: Arc<Database<NoWriteMap>>,
    path: PathBuf,
}

impl KvEnv {
    /// Opens or creates an environment at `path`.
    ///
    /// The directory is created if absent. `max_tables` bounds the number of
    /// named tables the environment may hold.
    ///
    /// # Errors
    ///
    /// `KvError::EnvOpen` (as `DbError::Unavailable`) if the path cannot be
    /// created or the lock cannot be taken.
    pub fn open(path: &Path, max_tables: usize) -> DbResult<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| db_err(KvError::EnvOpen(format!("{}: {e}", path.display()))))?;

        let mut options = DatabaseOptions::default();
        options.max_tables = Some(max_tables as u64);

        let db = Database::<NoWriteMap>::open_with_options(path, options)
            .map_err(|e| db_err(KvError::EnvOpen(format!("{}: {e}", path.display()))))?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// The filesystem path of this environment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the named table if it does not exist yet.
    ///
    /// Tables referenced by read transactions must be ensured up front;
    /// read transactions cannot create them.
    pub fn ensure_table(&self, name: &str) -> DbResult<()> {
        let txn = self
            .db
            .begin_rw_txn()
            .map_err(|e| db_err(KvError::TxnBegin(e.to_string())))?;
        txn.create_table(Some(name), TableFlags::empty())
            .map_err(|e| {
                db_err(KvError::TableOpen {
                    table: name.to_string(),
                    message: e.to_string(),
                })
            })?;
        txn.commit()
            .map_err(|e| db_err(classify(e)))?;
        Ok(())
    }

    /// Begins a read transaction scoped to one logical operation.
    pub fn begin_read(&self) -> DbResult<KvReadTxn<'_>> {
        let txn = self
            .db
            .begin_ro_txn()
            .map_err(|e| db_err(KvError::TxnBegin(e.to_string())))?;
        Ok(KvReadTxn { txn })
    }

    /// Begins a write transaction.
    ///
    /// Write transactions on one environment are serialized by the engine;
    /// dropping the value without [`KvWriteTxn::commit`] aborts it.
    pub fn begin_write(&self) -> DbResult<KvWriteTxn<'_>> {
        let txn = self
            .db
            .begin_rw_txn()
            .map_err(|e| db_err(KvError::TxnBegin(e.to_string())))?;
        Ok(KvWriteTxn { txn })
    }

    /// One-shot read of a single key.
    pub fn get(&self, table: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.begin_read()?.get(table, key)
    }

    /// One-shot write of a single key.
    ///
    /// Retries once on a full map; the default geometry grows between
    /// attempts.
    pub fn put(&self, table: &str, key: &[u8], value: &[u8]) -> DbResult<()> {
        match self.try_put(table, key, value) {
            Err(DbError::OutOfSpace(_)) => self.try_put(table, key, value),
            other => other,
        }
    }

    fn try_put(&self, table: &str, key: &[u8], value: &[u8]) -> DbResult<()> {
        let txn = self.begin_write()?;
        txn.put(table, key, value)?;
        txn.commit()
    }

    /// One-shot delete. Returns whether the key existed.
    pub fn delete(&self, table: &str, key: &[u8]) -> DbResult<bool> {
        let txn = self.begin_write()?;
        let existed = txn.delete(table, key)?;
        txn.commit()?;
        Ok(existed)
    }

    /// Collects every `(key, value)` pair in `table` whose key starts with
    /// `prefix`. An empty prefix scans the whole table.
    pub fn scan_prefix(&self, table: &str, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.begin_read()?.scan_prefix(table, prefix)
    }

    /// Collects every `(key, value)` pair in `table`.
    pub fn iter_table(&self, table: &str) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix(table, &[])
    }

    /// Number of entries in `table`.
    pub fn table_len(&self, table: &str) -> DbResult<usize> {
        Ok(self.iter_table(table)?.len())
    }

    /// Flushes dirty pages to disk.
    pub fn sync(&self) -> DbResult<()> {
        self.db
            .sync(true)
            .map_err(|e| db_err(classify(e)))?;
        Ok(())
    }
}

/// A read transaction over one environment.
///
/// Holds one MVCC snapshot; every read through it sees the same state.
/// Dropping it releases the snapshot.
pub struct KvReadTxn<'env> {
    txn: RoTxn<'env>,
}

impl KvReadTxn<'_> {
    /// Reads a single key. Returns `Ok(None)` for a missing key or a table
    /// that has never been created in this environment.
    pub fn get(&self, table: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let table = match self.txn.open_table(Some(table)) {
            Ok(t) => t,
            // A tier that has never seen this table is indistinguishable
            // from an empty one for readers.
            Err(_) => return Ok(None),
        };
        match self.txn.get::<Cow<'_, [u8]>>(&table, key) {
            Ok(Some(data)) => Ok(Some(data.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(classify(e))),
        }
    }

    /// Collects `(key, value)` pairs whose key starts with `prefix`.
    ///
    /// Keys are returned in lexicographic order; the scan stops at the first
    /// key past the prefix range.
    pub fn scan_prefix(&self, table: &str, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = match self.txn.open_table(Some(table)) {
            Ok(t) => t,
            Err(_) => return Ok(Vec::new()),
        };
        let mut cursor = self
            .txn
            .cursor(&table)
            .map_err(|e| db_err(classify(e)))?;

        let mut out = Vec::new();
        let mut entry = cursor
            .first::<Cow<'_, [u8]>, Cow<'_, [u8]>>()
            .map_err(|e| db_err(classify(e)))?
            .map(|(k, v)| (k.to_vec(), v.to_vec()));

        while let Some((key, value)) = entry {
            if key.starts_with(prefix) {
                out.push((key, value));
            } else if key.as_slice() > prefix && !prefix.is_empty() {
                break;
            }
            entry = cursor
                .next::<Cow<'_, [u8]>, Cow<'_, [u8]>>()
                .map_err(|e| db_err(classify(e)))?
                .map(|(k, v)| (k.to_vec(), v.to_vec()));
        }

        Ok(out)
    }
}

/// A write transaction over one environment.
///
/// All puts and deletes issued through one value commit atomically; a reader
/// sees either all of them or none. Dropping without `commit` aborts.
pub struct KvWriteTxn<'env> {
    txn: RwTxn<'env>,
}

impl KvWriteTxn<'_> {
    /// Writes `key -> value` into `table`, creating the table on first use.
    pub fn put(&self, table: &str, key: &[u8], value: &[u8]) -> DbResult<()> {
        let handle = self
            .txn
            .create_table(Some(table), TableFlags::empty())
            .map_err(|e| {
                db_err(KvError::TableOpen {
                    table: table.to_string(),
                    message: e.to_string(),
                })
            })?;
        self.txn
            .put(&handle, key, value, WriteFlags::empty())
            .map_err(|e| db_err(classify(e)))
    }

    /// Reads a key within this transaction (sees uncommitted writes).
    pub fn get(&self, table: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let handle = self
            .txn
            .create_table(Some(table), TableFlags::empty())
            .map_err(|e| {
                db_err(KvError::TableOpen {
                    table: table.to_string(),
                    message: e.to_string(),
                })
            })?;
        match self.txn.get::<Cow<'_, [u8]>>(&handle, key) {
            Ok(Some(data)) => Ok(Some(data.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(classify(e))),
        }
    }

    /// Deletes a key. Returns whether it existed.
    pub fn delete(&self, table: &str, key: &[u8]) -> DbResult<bool> {
        let handle = self
            .txn
            .create_table(Some(table), TableFlags::empty())
            .map_err(|e| {
                db_err(KvError::TableOpen {
                    table: table.to_string(),
                    message: e.to_string(),
                })
            })?;
        self.txn
            .del(&handle, key, None)
            .map_err(|e| db_err(classify(e)))
    }

    /// Commits every write issued through this transaction.
    pub fn commit(self) -> DbResult<()> {
        self.txn
            .commit()
            .map_err(|e| db_err(classify(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (KvEnv, TempDir) {
        let temp = TempDir::new().expect("temp dir");
        let env = KvEnv::open(&temp.path().join("env"), 32).expect("open env");
        (env, temp)
    }

    #[test]
    fn test_put_get_delete() {
        let (env, _temp) = open_temp();
        env.ensure_table("nodes").unwrap();

        env.put("nodes", b"k1", b"v1").unwrap();
        assert_eq!(env.get("nodes", b"k1").unwrap(), Some(b"v1".to_vec()));

        assert!(env.delete("nodes", b"k1").unwrap());
        assert_eq!(env.get("nodes", b"k1").unwrap(), None);
        assert!(!env.delete("nodes", b"k1").unwrap());
    }

    #[test]
    fn test_missing_table_reads_as_empty() {
        let (env, _temp) = open_temp();
        assert_eq!(env.get("never_created", b"k").unwrap(), None);
        assert!(env.scan_prefix("never_created", b"").unwrap().is_empty());
    }

    #[test]
    fn test_multi_table_write_is_atomic() {
        let (env, _temp) = open_temp();

        let txn = env.begin_write().unwrap();
        txn.put("nodes", b"n1", b"node").unwrap();
        txn.put("structural_index", b"prop:x:1", b"ids").unwrap();
        txn.commit().unwrap();

        assert!(env.get("nodes", b"n1").unwrap().is_some());
        assert!(env.get("structural_index", b"prop:x:1").unwrap().is_some());
    }

    #[test]
    fn test_abort_on_drop() {
        let (env, _temp) = open_temp();
        env.ensure_table("nodes").unwrap();

        {
            let txn = env.begin_write().unwrap();
            txn.put("nodes", b"ghost", b"v").unwrap();
            // dropped without commit
        }

        assert_eq!(env.get("nodes", b"ghost").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_ordering_and_bounds() {
        let (env, _temp) = open_temp();
        env.ensure_table("idx").unwrap();

        env.put("idx", b"prop:a:1", b"1").unwrap();
        env.put("idx", b"prop:a:2", b"2").unwrap();
        env.put("idx", b"prop:b:1", b"3").unwrap();

        let hits = env.scan_prefix("idx", b"prop:a:").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"prop:a:1".to_vec());
        assert_eq!(hits[1].0, b"prop:a:2".to_vec());

        let all = env.iter_table("idx").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_read_txn_serves_many_reads() {
        let (env, _temp) = open_temp();
        env.ensure_table("nodes").unwrap();
        env.put("nodes", b"k1", b"v1").unwrap();
        env.put("nodes", b"k2", b"v2").unwrap();

        // One transaction per logical operation: every read of the operation
        // goes through the same snapshot.
        let read = env.begin_read().unwrap();
        assert_eq!(read.get("nodes", b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(read.get("nodes", b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(read.get("nodes", b"missing").unwrap(), None);
        assert_eq!(read.scan_prefix("nodes", b"k").unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("env");
        {
            let env = KvEnv::open(&path, 32).unwrap();
            env.put("nodes", b"persist", b"yes").unwrap();
            env.sync().unwrap();
        }
        {
            let env = KvEnv::open(&path, 32).unwrap();
            assert_eq!(env.get("nodes", b"persist").unwrap(), Some(b"yes".to_vec()));
        }
    }
}
