//! Connection pool: one serialized writer, a bounded set of readers.
//!
//! All writes go through a single connection guarded by an async mutex, so a
//! process never holds two write handles at once. Readers are `query_only`
//! connections limited by a semaphore. Waits on either are bounded by the
//! configured busy timeout. When a write fails because the store went
//! read-only or corrupt, the pool hands the files to the [`RecoveryManager`],
//! reopens the database and retries the operation once.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use libsql::{Connection, Database};
use tokio::sync::{Mutex, MutexGuard, RwLock, Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::config::{StoreConfig, StorePaths};
use crate::error::{DatabaseError, Error, ErrorCategory, ErrorReporter, ErrorSeverity, Result};
use crate::store::recovery::{PermissionManager, RecoveryManager};

/// Kind of handle an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Shared handle to the embedded store.
pub struct ConnectionPool {
    config: StoreConfig,
    paths: StorePaths,
    database: RwLock<Arc<Database>>,
    writer: Mutex<Option<Connection>>,
    /// Idle readers tagged with the generation they were opened under.
    idle_readers: StdMutex<Vec<(u64, Connection)>>,
    read_permits: Semaphore,
    /// Bumped every time the database is reopened after recovery.
    generation: AtomicU64,
    recovery: Arc<RecoveryManager>,
    reporter: Arc<dyn ErrorReporter>,
}

impl ConnectionPool {
    /// Open the store described by `config` with the standard recovery ladder.
    pub async fn open(config: StoreConfig, reporter: Arc<dyn ErrorReporter>) -> Result<Self> {
        let permissions = Arc::new(PermissionManager::new(&config));
        let recovery = Arc::new(RecoveryManager::new(permissions));
        Self::open_with_recovery(config, recovery, reporter).await
    }

    /// Open with a caller-supplied recovery manager.
    pub async fn open_with_recovery(
        config: StoreConfig,
        recovery: Arc<RecoveryManager>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let paths = config.paths();

        if !recovery.permissions().ensure_permissions() {
            warn!(
                dir = %paths.data_dir.display(),
                "Store permissions not usable, attempting recovery"
            );
            if !recovery.recover_from_readonly().await {
                let err = DatabaseError::with_category(
                    format!("{} is not writable", paths.data_dir.display()),
                    ErrorCategory::Permission,
                )
                .severity(ErrorSeverity::Fatal)
                .context("path", paths.data_dir.display());
                reporter.report(&err);
                return Err(err.into());
            }
        }

        let database = match open_database(&paths.db_file).await {
            Ok(database) => database,
            Err(e) if e.needs_recovery() && recovery.recover_from_readonly().await => {
                open_database(&paths.db_file).await?
            }
            Err(e) => {
                if e.report_to_user {
                    reporter.report(&e);
                }
                return Err(e.into());
            }
        };
        let pool = Self {
            read_permits: Semaphore::new(config.max_readers.max(1)),
            config,
            paths,
            database: RwLock::new(Arc::new(database)),
            writer: Mutex::new(None),
            idle_readers: StdMutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            recovery,
            reporter,
        };

        // Opening the writer switches the file to WAL; a read-only store
        // surfaces here and goes through recovery like any other write.
        pool.with_connection(AccessMode::ReadWrite, |_conn| async { Ok(()) })
            .await?;

        info!(path = %pool.paths.db_file.display(), "Database opened");
        Ok(pool)
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Changes whenever the database has been reopened.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run `op` against a handle of the requested kind.
    ///
    /// Read-only calls share the reader set; read-write calls go through the
    /// single writer. A read-only or corruption failure on the write path
    /// triggers recovery and one retry.
    pub async fn with_connection<T, F, Fut>(&self, mode: AccessMode, op: F) -> Result<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self.run_once(mode, &op).await;
        match result {
            Err(e) if mode == AccessMode::ReadWrite && e.needs_recovery() => {
                if let Err(failed) = self.recover(&e).await {
                    return self.finish(Err(failed));
                }
                let retry = self.run_once(mode, &op).await;
                self.finish(self.escalate_unrecovered(retry))
            }
            other => self.finish(other),
        }
    }

    /// Run `op` inside a `BEGIN IMMEDIATE` transaction on the writer.
    ///
    /// Commits when `op` returns `Ok`, rolls back otherwise.
    pub async fn with_transaction<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self.transact_once(&op).await;
        match result {
            Err(e) if e.needs_recovery() => {
                if let Err(failed) = self.recover(&e).await {
                    return self.finish(Err(failed));
                }
                let retry = self.transact_once(&op).await;
                self.finish(self.escalate_unrecovered(retry))
            }
            other => self.finish(other),
        }
    }

    // ── Execution ───────────────────────────────────────────────────

    async fn run_once<T, F, Fut>(&self, mode: AccessMode, op: &F) -> Result<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match mode {
            AccessMode::ReadOnly => {
                let (_permit, generation, conn) = self.acquire_reader().await?;
                let result = op(conn.clone()).await;
                self.release_reader(generation, conn);
                result
            }
            AccessMode::ReadWrite => {
                let mut slot = self.lock_writer().await?;
                let conn = self.writer_connection(&mut slot).await?;
                op(conn).await
            }
        }
    }

    async fn transact_once<T, F, Fut>(&self, op: &F) -> Result<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut txn = WriterTxn {
            slot: self.lock_writer().await?,
            open: true,
        };
        let conn = self.writer_connection(&mut txn.slot).await?;

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("begin", e))?;

        let result = match op(conn.clone()).await {
            Ok(value) => match conn.execute("COMMIT", ()).await {
                Ok(_) => Ok(value),
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", ()).await;
                    Err(DatabaseError::from_libsql("commit", e).into())
                }
            },
            Err(e) => {
                if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                    warn!("Rollback failed: {rollback}");
                }
                Err(e)
            }
        };
        txn.open = !conn.is_autocommit();
        result
    }

    async fn lock_writer(
        &self,
    ) -> std::result::Result<MutexGuard<'_, Option<Connection>>, DatabaseError> {
        tokio::time::timeout(self.config.busy_timeout, self.writer.lock())
            .await
            .map_err(|_| self.wait_timeout("writer"))
    }

    async fn writer_connection(
        &self,
        slot: &mut Option<Connection>,
    ) -> std::result::Result<Connection, DatabaseError> {
        if let Some(conn) = slot.as_ref() {
            if conn.is_autocommit() {
                return Ok(conn.clone());
            }
            // An earlier write was dropped mid-flight and left BEGIN behind.
            warn!("Writer left inside a transaction, rolling back");
            if conn.execute("ROLLBACK", ()).await.is_ok() && conn.is_autocommit() {
                return Ok(conn.clone());
            }
            *slot = None;
        }
        let conn = self.connect(AccessMode::ReadWrite).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn acquire_reader(
        &self,
    ) -> std::result::Result<(SemaphorePermit<'_>, u64, Connection), DatabaseError> {
        let permit = tokio::time::timeout(self.config.busy_timeout, self.read_permits.acquire())
            .await
            .map_err(|_| self.wait_timeout("reader"))?
            .map_err(|_| {
                DatabaseError::with_category("reader pool closed", ErrorCategory::Connection)
            })?;

        let generation = self.generation();
        let pooled = self.idle_readers.lock().ok().and_then(|mut idle| {
            idle.retain(|(g, _)| *g == generation);
            idle.pop()
        });
        let conn = match pooled {
            Some((_, conn)) => conn,
            None => self.connect(AccessMode::ReadOnly).await?,
        };
        Ok((permit, generation, conn))
    }

    fn release_reader(&self, generation: u64, conn: Connection) {
        if generation != self.generation() {
            return;
        }
        if let Ok(mut idle) = self.idle_readers.lock() {
            idle.push((generation, conn));
        }
    }

    async fn connect(&self, mode: AccessMode) -> std::result::Result<Connection, DatabaseError> {
        let database = self.database.read().await.clone();
        let conn = database
            .connect()
            .map_err(|e| DatabaseError::from_libsql("connect", e))?;

        let busy_ms = self.config.busy_timeout.as_millis();
        pragma(&conn, &format!("PRAGMA busy_timeout = {busy_ms}")).await?;
        match mode {
            AccessMode::ReadWrite => {
                pragma(&conn, "PRAGMA journal_mode = WAL").await?;
                pragma(&conn, "PRAGMA foreign_keys = ON").await?;
            }
            AccessMode::ReadOnly => pragma(&conn, "PRAGMA query_only = 1").await?,
        }
        debug!(?mode, "Opened connection");
        Ok(conn)
    }

    fn wait_timeout(&self, what: &str) -> DatabaseError {
        DatabaseError::with_category(
            format!(
                "timed out after {} ms waiting for {what} connection",
                self.config.busy_timeout.as_millis()
            ),
            ErrorCategory::Timeout,
        )
        .context("waiting_for", what)
    }

    // ── Recovery ────────────────────────────────────────────────────

    async fn recover(&self, cause: &Error) -> Result<()> {
        error!(path = %self.paths.db_file.display(), "Write failed, store needs recovery: {cause}");
        self.drop_connections().await;

        if !self.recovery.recover_from_readonly().await {
            let base = cause.as_database().cloned().unwrap_or_else(|| {
                DatabaseError::with_category(cause.to_string(), ErrorCategory::Permission)
            });
            return Err(escalate(base, "recovery_failed").into());
        }

        self.reopen().await?;
        Ok(())
    }

    async fn drop_connections(&self) {
        *self.writer.lock().await = None;
        if let Ok(mut idle) = self.idle_readers.lock() {
            idle.clear();
        }
    }

    async fn reopen(&self) -> std::result::Result<(), DatabaseError> {
        let database = open_database(&self.paths.db_file).await?;
        *self.database.write().await = Arc::new(database);
        self.drop_connections().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, path = %self.paths.db_file.display(), "Database reopened after recovery");
        Ok(())
    }

    fn escalate_unrecovered<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(Error::Database(e)) if e.needs_recovery() => {
                Err(escalate(e, "failed_after_recovery").into())
            }
            other => other,
        }
    }

    /// Hand user-facing failures to the reporter on their way out.
    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Database(e)) = &result {
            if e.report_to_user {
                self.reporter.report(e);
            }
        }
        result
    }
}

/// Writer slot held for the length of one transaction.
///
/// If the transaction future is dropped before COMMIT or ROLLBACK ran, the
/// writer is discarded so the open transaction and its lock die with it.
struct WriterTxn<'a> {
    slot: MutexGuard<'a, Option<Connection>>,
    open: bool,
}

impl Drop for WriterTxn<'_> {
    fn drop(&mut self) {
        if self.open && self.slot.is_some() {
            warn!("Transaction abandoned before completion, discarding writer connection");
            *self.slot = None;
        }
    }
}

fn escalate(err: DatabaseError, stage: &str) -> DatabaseError {
    err.severity(ErrorSeverity::Critical)
        .report(true)
        .context("recovery", stage)
}

async fn open_database(path: &Path) -> std::result::Result<Database, DatabaseError> {
    libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| DatabaseError::from_libsql("open", e).context("path", path.display()))
}

/// Run a PRAGMA, draining whatever rows it returns.
async fn pragma(conn: &Connection, sql: &str) -> std::result::Result<(), DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::from_libsql("pragma", e).context("sql", sql))?;
    while rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql("pragma", e).context("sql", sql))?
        .is_some()
    {}
    Ok(())
}
