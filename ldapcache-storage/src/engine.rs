//! LMDB environment lifecycle and raw transactional access.
//!
//! Uses the heed crate (Rust bindings for LMDB). The engine owns the single
//! environment of a deployment; shards borrow named sub-databases from it
//! and run their reads and writes through the transactions it hands out.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread::{self, ThreadId};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, MdbError, RoTxn, RwTxn};
use ldapcache_core::{StorageConfig, StorageError};
use serde::Serialize;

/// Handle to one named sub-database.
pub type SubDatabase = Database<Bytes, Bytes>;

/// Translate heed errors into the transient/fatal storage vocabulary.
pub(crate) fn storage_error(error: heed::Error) -> StorageError {
    let reason = error.to_string();
    match error {
        heed::Error::Mdb(
            MdbError::MapFull | MdbError::TxnFull | MdbError::PageFull | MdbError::CursorFull,
        ) => StorageError::CapacityExhausted { reason },
        heed::Error::Mdb(MdbError::ReadersFull | MdbError::TlsFull | MdbError::MapResized) => {
            StorageError::Contended { reason }
        }
        heed::Error::Mdb(
            MdbError::Corrupted
            | MdbError::PageNotFound
            | MdbError::Panic
            | MdbError::VersionMismatch
            | MdbError::Invalid,
        ) => StorageError::Corrupted { reason },
        _ => StorageError::TransactionFailed { reason },
    }
}

/// Snapshot of environment usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentStats {
    pub path: PathBuf,
    pub map_size_bytes: usize,
    pub disk_size_bytes: u64,
    pub max_sub_databases: u32,
    /// Entry count per registered sub-database.
    pub sub_databases: BTreeMap<String, u64>,
}

/// The embedded store of one deployment.
pub struct StorageEngine {
    env: Env,
    path: PathBuf,
    map_size_bytes: usize,
    max_sub_databases: u32,
    sub_databases: RwLock<BTreeMap<String, SubDatabase>>,
    /// Thread currently holding the write transaction, if any.
    writer: Mutex<Option<ThreadId>>,
    closed: AtomicBool,
}

impl StorageEngine {
    /// Create or open the environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if:
    /// - The directory cannot be created or is not writable
    /// - LMDB cannot open or lock the environment
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        max_sub_databases: u32,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let unavailable = |reason: String| StorageError::Unavailable {
            path: path.display().to_string(),
            reason,
        };

        std::fs::create_dir_all(path).map_err(|e| unavailable(e.to_string()))?;

        let map_size_bytes = max_size_mb * 1024 * 1024;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_bytes)
                .max_dbs(max_sub_databases)
                .open(path)
        }
        .map_err(|e| unavailable(e.to_string()))?;

        restrict_permissions(path).map_err(|e| unavailable(e.to_string()))?;

        tracing::info!(
            path = %path.display(),
            max_size_mb,
            max_sub_databases,
            "Opened cache environment"
        );

        Ok(Self {
            env,
            path: path.to_path_buf(),
            map_size_bytes,
            max_sub_databases,
            sub_databases: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::open(&config.path, config.max_size_mb, config.max_sub_databases)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Start a snapshot read. Runs concurrently with the writer.
    pub fn begin_read(&self) -> Result<RoTxn<'_>, StorageError> {
        self.ensure_open()?;
        self.env.read_txn().map_err(storage_error)
    }

    /// Start the write transaction.
    ///
    /// Blocks while another thread writes. Fails with `StorageError::Busy`
    /// if the calling thread already holds a write transaction.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>, StorageError> {
        self.ensure_open()?;
        let me = thread::current().id();
        {
            let owner = self.writer.lock().map_err(|_| StorageError::LockPoisoned)?;
            if *owner == Some(me) {
                return Err(StorageError::Busy {
                    reason: "write transaction already open on this thread".to_string(),
                });
            }
        }

        let txn = self.env.write_txn().map_err(storage_error)?;
        *self.writer.lock().map_err(|_| StorageError::LockPoisoned)? = Some(me);

        Ok(WriteTxn {
            txn,
            _guard: WriterGuard {
                engine: self,
                owner: me,
            },
        })
    }

    // ========================================================================
    // SUB-DATABASES
    // ========================================================================

    /// Create (or reopen) the named sub-database. Idempotent.
    ///
    /// The registration lock is never held while waiting for the writer.
    pub fn create_sub_database(&self, name: &str) -> Result<SubDatabase, StorageError> {
        self.ensure_open()?;
        if let Ok(db) = self.sub_database(name) {
            return Ok(db);
        }

        let mut wtxn = self.begin_write()?;
        let db: SubDatabase = self
            .env
            .create_database(wtxn.txn_mut(), Some(name))
            .map_err(|e| match e {
                heed::Error::Mdb(MdbError::DbsFull) => StorageError::TransactionFailed {
                    reason: format!(
                        "sub-database limit of {} reached creating {}",
                        self.max_sub_databases, name
                    ),
                },
                other => storage_error(other),
            })?;
        wtxn.commit()?;

        // Racing creators get the same handle from LMDB.
        self.sub_databases
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .entry(name.to_string())
            .or_insert(db);
        tracing::debug!(sub_database = name, "Registered sub-database");
        Ok(db)
    }

    /// Look up a sub-database registered in this process.
    pub fn sub_database(&self, name: &str) -> Result<SubDatabase, StorageError> {
        self.sub_databases
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::UnknownSubDatabase {
                name: name.to_string(),
            })
    }

    pub fn sub_database_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .sub_databases
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .keys()
            .cloned()
            .collect())
    }

    // ========================================================================
    // KEY/VALUE ACCESS
    // ========================================================================

    pub fn get<'t>(
        &self,
        txn: &'t RoTxn<'_>,
        db: &SubDatabase,
        key: &[u8],
    ) -> Result<Option<&'t [u8]>, StorageError> {
        db.get(txn, key).map_err(storage_error)
    }

    pub fn put(
        &self,
        txn: &mut WriteTxn<'_>,
        db: &SubDatabase,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        db.put(txn.txn_mut(), key, value).map_err(storage_error)
    }

    /// Delete `key`; `Ok(false)` if it was not present.
    pub fn delete(
        &self,
        txn: &mut WriteTxn<'_>,
        db: &SubDatabase,
        key: &[u8],
    ) -> Result<bool, StorageError> {
        db.delete(txn.txn_mut(), key).map_err(storage_error)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Empty every registered sub-database in one write transaction.
    ///
    /// Returns the number of sub-databases cleared. Concurrent readers keep
    /// their snapshot until they finish; new readers see the empty store.
    pub fn recreate(&self) -> Result<usize, StorageError> {
        let mut wtxn = self.begin_write()?;
        let cleared = self.recreate_in(&mut wtxn)?;
        wtxn.commit()?;
        Ok(cleared)
    }

    /// Empty every registered sub-database inside a caller-owned
    /// transaction. Nothing is visible to readers until `txn` commits, and
    /// aborting it leaves the previous contents intact.
    pub fn recreate_in(&self, txn: &mut WriteTxn<'_>) -> Result<usize, StorageError> {
        let dbs: Vec<SubDatabase> = self
            .sub_databases
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .values()
            .copied()
            .collect();

        for db in &dbs {
            db.clear(txn.txn_mut()).map_err(storage_error)?;
        }

        tracing::info!(
            path = %self.path.display(),
            sub_databases = dbs.len(),
            "Cleared cache environment"
        );
        Ok(dbs.len())
    }

    /// Flush to disk and refuse further transactions. Idempotent.
    ///
    /// The memory map is released when the last handle is dropped.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.env.force_sync().map_err(storage_error)?;
        tracing::info!(path = %self.path.display(), "Closed cache environment");
        Ok(())
    }

    pub fn stats(&self) -> Result<EnvironmentStats, StorageError> {
        let dbs: Vec<(String, SubDatabase)> = self
            .sub_databases
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .iter()
            .map(|(name, db)| (name.clone(), *db))
            .collect();

        let rtxn = self.begin_read()?;
        let mut sub_databases = BTreeMap::new();
        for (name, db) in dbs {
            sub_databases.insert(name, db.len(&rtxn).map_err(storage_error)?);
        }

        Ok(EnvironmentStats {
            path: self.path.clone(),
            map_size_bytes: self.map_size_bytes,
            disk_size_bytes: self.env.real_disk_size().map_err(storage_error)?,
            max_sub_databases: self.max_sub_databases,
            sub_databases,
        })
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("path", &self.path)
            .field("map_size_bytes", &self.map_size_bytes)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// WRITE TRANSACTION
// ============================================================================

/// The single write transaction. Aborted on drop unless committed.
pub struct WriteTxn<'e> {
    txn: RwTxn<'e>,
    _guard: WriterGuard<'e>,
}

impl<'e> WriteTxn<'e> {
    pub fn txn_mut(&mut self) -> &mut RwTxn<'e> {
        &mut self.txn
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.txn.commit().map_err(storage_error)
    }

    pub fn abort(self) {
        self.txn.abort();
    }
}

impl<'e> Deref for WriteTxn<'e> {
    type Target = RwTxn<'e>;

    fn deref(&self) -> &Self::Target {
        &self.txn
    }
}

impl DerefMut for WriteTxn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.txn
    }
}

/// Releases writer ownership once the transaction is gone.
struct WriterGuard<'e> {
    engine: &'e StorageEngine,
    owner: ThreadId,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut owner) = self.engine.writer.lock() {
            // Another thread may already have taken the lock after our commit.
            if *owner == Some(self.owner) {
                *owner = None;
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    for name in ["data.mdb", "lock.mdb"] {
        let file = path.join(name);
        if file.exists() {
            std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
