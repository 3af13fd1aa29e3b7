//! Background job repository: the job state machine on top of the pool.
//!
//! Every mutation runs through [`ConnectionPool::with_transaction`] or the
//! pool's read-write path, so writes are serialized and read-only failures go
//! through recovery. Read paths log and return empty results instead of
//! failing, so listing views stay up when the store is unhappy.

mod claim;
mod cleanup;
mod queries;
mod rows;
mod writes;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use libsql::Connection;
use tracing::debug;

use crate::error::Result;
use crate::store::pool::{AccessMode, ConnectionPool};
use crate::store::schema::ensure_jobs_schema;

/// Message written to jobs canceled in bulk.
pub const BULK_CANCEL_MESSAGE: &str = "Canceled by user";

/// Hard-delete horizon for terminal jobs, regardless of `days_to_keep`.
pub const HISTORY_PURGE_DAYS: i64 = 90;

/// Repository for `background_jobs`.
pub struct BackgroundJobRepository {
    pool: Arc<ConnectionPool>,
    /// Pool generation the schema was last bootstrapped for.
    schema_generation: AtomicU64,
}

impl BackgroundJobRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            schema_generation: AtomicU64::new(u64::MAX),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Create the table if this pool generation has not seen it yet.
    ///
    /// Runs outside any transaction so a later rollback cannot undo it.
    async fn ensure_schema(&self) -> Result<()> {
        let generation = self.pool.generation();
        if self.schema_generation.load(Ordering::Acquire) == generation {
            return Ok(());
        }
        self.pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                ensure_jobs_schema(&conn).await?;
                Ok(())
            })
            .await?;
        self.schema_generation.store(generation, Ordering::Release);
        debug!(generation, "Job schema ready");
        Ok(())
    }

    /// Inside a write: re-run the DDL if the pool reopened since the last bootstrap.
    ///
    /// Covers the retry after recovery recreated an empty database file.
    async fn bootstrap_if_reopened(&self, conn: &Connection) -> Result<()> {
        if self.schema_generation.load(Ordering::Acquire) != self.pool.generation() {
            ensure_jobs_schema(conn).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;

    use super::BackgroundJobRepository;
    use crate::config::StoreConfig;
    use crate::error::TracingReporter;
    use crate::store::pool::ConnectionPool;

    pub async fn test_repo(dir: &Path) -> BackgroundJobRepository {
        let config = StoreConfig::new(dir.join("data"));
        let pool = ConnectionPool::open(config, Arc::new(TracingReporter))
            .await
            .unwrap();
        BackgroundJobRepository::new(Arc::new(pool))
    }
}
