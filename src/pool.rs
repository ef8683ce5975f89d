//! Connection pool lifecycle.
//!
//! Every connection handed out carries a read guard on the restart lock.
//! Compaction takes the write side, so no session can observe the file while
//! it is being rewritten. When acquisition fails with nothing checked out the
//! supervisor classifies the failure once: a peer holding the file is
//! reported as-is, anything else is treated as corruption and the files are
//! deleted and recreated.

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::flock::{self, FileLock};
use crate::spatial;
use crate::sql;

type Initializer = Arc<dyn Fn(&mut Connection) -> Result<()> + Send + Sync>;

/// A pooled connection plus the restart read guard it was acquired under.
pub struct CacheConnection<'a> {
    // Declared first so the connection goes back to the pool before the guard
    // is released.
    conn: PooledConnection<SqliteConnectionManager>,
    _restart: RwLockReadGuard<'a, ()>,
}

impl Deref for CacheConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for CacheConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// True for engine errors meaning another connection or process holds the
/// file.
pub fn is_already_open(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// Size of the database in bytes, from the engine's page accounting.
pub fn database_size(conn: &Connection) -> Result<i64> {
    let sql = "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()";
    conn.query_row(sql, [], |row| row.get(0))
        .map_err(|e| Error::sql(sql, e))
}

fn configure_connection(
    conn: &mut Connection,
    cache_kib: i64,
    busy_timeout: Duration,
) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
    conn.execute_batch(&format!(
        "PRAGMA synchronous = OFF; PRAGMA cache_size = -{};",
        cache_kib
    ))?;
    spatial::register(conn)
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub struct PoolSupervisor {
    config: CacheConfig,
    pool: Mutex<Pool<SqliteConnectionManager>>,
    restart: RwLock<()>,
    capacity: AtomicU32,
    exclusive: AtomicBool,
    open_failure: AtomicBool,
    recoveries: AtomicU64,
    initializer: Mutex<Option<Initializer>>,
    _lock: Option<FileLock>,
}

impl PoolSupervisor {
    pub fn open(config: CacheConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock = if config.auto_server {
            None
        } else {
            let lock = FileLock::for_database(&config.path).map_err(|e| {
                if flock::is_held_elsewhere(&e) {
                    Error::DatabaseAlreadyOpen(config.path.display().to_string())
                } else {
                    Error::LockError(e)
                }
            })?;
            Some(lock)
        };

        let capacity = config.max_connections.max(1);
        let pool = Self::build_pool(&config, capacity);
        tracing::info!(
            path = %config.path.display(),
            max_connections = capacity,
            auto_server = config.auto_server,
            "Opened connection pool"
        );

        Ok(Self {
            pool: Mutex::new(pool),
            restart: RwLock::new(()),
            capacity: AtomicU32::new(capacity),
            exclusive: AtomicBool::new(false),
            open_failure: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
            initializer: Mutex::new(None),
            _lock: lock,
            config,
        })
    }

    fn build_pool(config: &CacheConfig, capacity: u32) -> Pool<SqliteConnectionManager> {
        let cache_kib = config.cache_size_kib_per_connection();
        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(&config.path)
            .with_init(move |conn| configure_connection(conn, cache_kib, busy_timeout));
        Pool::builder()
            .max_size(capacity)
            .min_idle(Some(0))
            .connection_timeout(config.connection_timeout)
            .build_unchecked(manager)
    }

    fn swap_pool(&self, capacity: u32) -> Pool<SqliteConnectionManager> {
        let pool = Self::build_pool(&self.config, capacity);
        let old = std::mem::replace(&mut *self.pool.lock(), pool.clone());
        drop(old);
        pool
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Runs on a fresh connection after the database was recreated.
    pub fn set_initializer<F>(&self, init: F)
    where
        F: Fn(&mut Connection) -> Result<()> + Send + Sync + 'static,
    {
        *self.initializer.lock() = Some(Arc::new(init));
    }

    /// Configured pool capacity
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Capacity of the pool currently in service
    pub fn pool_max_size(&self) -> u32 {
        self.pool.lock().max_size()
    }

    /// Whether a compaction currently owns the database
    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::SeqCst)
    }

    /// Whether an open failure is currently being handled
    pub fn is_recovering(&self) -> bool {
        self.open_failure.load(Ordering::SeqCst)
    }

    /// Number of delete-and-recreate recoveries performed
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }

    /// Changes the pool capacity. Applied immediately unless a compaction is
    /// running, in which case it takes effect when the compaction ends. The
    /// compaction swaps in a pool of `capacity()` on exit, so a resize that
    /// times out on the restart lock is deferred rather than lost.
    pub fn set_max_connections(&self, max: u32) {
        let max = max.max(1);
        self.capacity.store(max, Ordering::SeqCst);
        let Some(_guard) = self.restart.try_read_for(self.config.connection_timeout) else {
            tracing::debug!(
                max_connections = max,
                "Restart lock busy, resize deferred to end of compaction"
            );
            return;
        };
        if self.is_exclusive() {
            tracing::debug!(max_connections = max, "Resize deferred to end of compaction");
        } else {
            self.swap_pool(max);
            tracing::debug!(max_connections = max, "Resized connection pool");
        }
    }

    /// Hands out a pooled connection. Blocks at most the configured
    /// connection timeout on the restart lock and again on the pool.
    pub fn get_connection(&self) -> Result<CacheConnection<'_>> {
        let timeout = self.config.connection_timeout;
        let guard = self.restart.try_read_for(timeout).ok_or_else(|| {
            Error::PoolExhausted(format!(
                "restart lock not available within {:?}",
                timeout
            ))
        })?;

        let pool = self.pool.lock().clone();
        let err = match pool.get() {
            Ok(conn) => {
                return Ok(CacheConnection {
                    conn,
                    _restart: guard,
                })
            }
            Err(err) => err,
        };

        let state = pool.state();
        let active = state.connections.saturating_sub(state.idle_connections);
        if active > 0 || self.open_failure.swap(true, Ordering::SeqCst) {
            return Err(Error::PoolExhausted(err.to_string()));
        }

        let result = self.recover(pool, err);
        self.open_failure.store(false, Ordering::SeqCst);
        result.map(|conn| CacheConnection {
            conn,
            _restart: guard,
        })
    }

    fn probe(&self) -> rusqlite::Result<()> {
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(())
    }

    fn recover(
        &self,
        failed: Pool<SqliteConnectionManager>,
        err: r2d2::Error,
    ) -> Result<PooledConnection<SqliteConnectionManager>> {
        let path = self.config.path.display().to_string();
        match self.probe() {
            Ok(()) => {
                tracing::warn!(path = %path, error = %err, "Connection failed but database opens, retrying");
                failed
                    .get()
                    .map_err(|e| Error::PoolExhausted(e.to_string()))
            }
            Err(probe) if is_already_open(&probe) => {
                tracing::error!(path = %path, error = %probe, "Database is held by another process");
                Err(Error::DatabaseAlreadyOpen(format!("{}: {}", path, probe)))
            }
            Err(probe) => {
                tracing::warn!(
                    path = %path,
                    error = %probe,
                    "Database cannot be opened, deleting and recreating"
                );
                drop(failed);
                let pool = self.swap_pool(self.capacity());
                self.remove_database_files()
                    .map_err(|e| Error::CorruptDatabase(format!("{}: {}", path, e)))?;
                self.recoveries.fetch_add(1, Ordering::SeqCst);

                let mut conn = pool
                    .get()
                    .map_err(|e| Error::CorruptDatabase(format!("{}: {}", path, e)))?;
                let init = self.initializer.lock().clone();
                if let Some(init) = init {
                    init(&mut conn)?;
                }
                tracing::info!(path = %path, "Recreated database");
                Ok(conn)
            }
        }
    }

    fn remove_database_files(&self) -> io::Result<()> {
        let path = &self.config.path;
        for file in [
            path.to_path_buf(),
            with_suffix(path, "-wal"),
            with_suffix(path, "-shm"),
            with_suffix(path, "-journal"),
        ] {
            if remove_if_present(&file)? {
                tracing::debug!(file = %file.display(), "Removed database file");
            }
        }
        Ok(())
    }

    /// Runs `work` and a `VACUUM` with the database to itself: readers are
    /// locked out and the pool is cut to a single connection until both
    /// finish and the configured capacity is restored.
    pub fn compact<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&mut Connection) -> Result<()>,
    {
        let timeout = self.config.connection_timeout;
        let _guard = self.restart.try_write_for(timeout).ok_or_else(|| {
            Error::PoolExhausted(format!("readers did not drain within {:?}", timeout))
        })?;
        self.exclusive.store(true, Ordering::SeqCst);
        tracing::info!(path = %self.config.path.display(), "Compaction started");

        let result = (|| -> Result<()> {
            let single = self.swap_pool(1);
            let mut conn = single.get()?;
            work(&mut conn)?;
            sql::execute_batch(&conn, "VACUUM")?;
            let checkpoint = "PRAGMA wal_checkpoint(TRUNCATE)";
            conn.query_row(checkpoint, [], |_| Ok(()))
                .map_err(|e| Error::sql(checkpoint, e))?;
            Ok(())
        })();

        self.swap_pool(self.capacity());
        self.exclusive.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) => tracing::info!("Compaction finished"),
            Err(e) => tracing::error!(error = %e, "Compaction failed"),
        }
        result
    }

    /// Current database size in bytes
    pub fn on_disk_size(&self) -> Result<i64> {
        let conn = self.get_connection()?;
        database_size(&conn)
    }
}
