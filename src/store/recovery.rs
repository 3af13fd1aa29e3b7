//! Filesystem permission repair and the read-only recovery ladder.
//!
//! [`PermissionManager`] keeps the data directory, the database file and its
//! WAL sidecars writable. [`RecoveryManager`] runs an ordered list of
//! [`RecoveryStrategy`] steps when a write fails because the store went
//! read-only; the first step that leaves the store writable ends the run.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{StoreConfig, StorePaths};
use crate::error::DatabaseError;

// ── Permissions ─────────────────────────────────────────────────────

/// Verifies and repairs permissions on the store's files.
pub struct PermissionManager {
    paths: StorePaths,
    dir_mode: u32,
    file_mode: u32,
    cache_ttl: Duration,
    last_ok: Mutex<Option<Instant>>,
}

impl PermissionManager {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            paths: config.paths(),
            dir_mode: config.dir_mode,
            file_mode: config.file_mode,
            cache_ttl: config.permission_cache_ttl,
            last_ok: Mutex::new(None),
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Make sure the directory exists and every store file is writable.
    ///
    /// Never fails: problems are logged and reported as `false`. A success is
    /// cached for the configured interval.
    pub fn ensure_permissions(&self) -> bool {
        if self.cached_ok() {
            return true;
        }
        match self.repair() {
            Ok(()) => {
                if let Ok(mut last) = self.last_ok.lock() {
                    *last = Some(Instant::now());
                }
                true
            }
            Err(e) => {
                warn!(dir = %self.paths.data_dir.display(), "Permission check failed: {e}");
                false
            }
        }
    }

    /// Forget the cached result so the next check touches the filesystem.
    pub fn invalidate(&self) {
        if let Ok(mut last) = self.last_ok.lock() {
            *last = None;
        }
    }

    fn cached_ok(&self) -> bool {
        self.last_ok
            .lock()
            .ok()
            .and_then(|last| *last)
            .is_some_and(|at| at.elapsed() < self.cache_ttl)
    }

    fn repair(&self) -> Result<(), DatabaseError> {
        let dir = &self.paths.data_dir;
        if !dir.exists() {
            info!(dir = %dir.display(), "Creating database directory");
            std::fs::create_dir_all(dir).map_err(|e| io_error("create_dir", dir, e))?;
        }
        set_mode(dir, self.dir_mode)?;
        ensure_writable(dir)?;

        for file in [
            &self.paths.db_file,
            &self.paths.wal_file,
            &self.paths.shm_file,
        ] {
            if file.exists() {
                set_mode(file, self.file_mode)?;
                ensure_writable(file)?;
            }
        }
        debug!(dir = %dir.display(), "Database permissions verified");
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), DatabaseError> {
    use std::os::unix::fs::PermissionsExt;

    let current = std::fs::metadata(path)
        .map_err(|e| io_error("stat", path, e))?
        .permissions()
        .mode()
        & 0o777;
    if current != mode {
        debug!(
            path = %path.display(),
            from = %format!("{current:o}"),
            to = %format!("{mode:o}"),
            "Fixing mode"
        );
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| io_error("chmod", path, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), DatabaseError> {
    // ACL-managed platforms: nothing to normalize.
    Ok(())
}

/// Check real write access for this process, not just the mode bits.
///
/// Directories get a throwaway file created and removed; files are opened
/// for writing without truncation.
fn ensure_writable(path: &Path) -> Result<(), DatabaseError> {
    if path.is_dir() {
        let check = path.join(".jobstore-write-check");
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&check)
            .map_err(|e| io_error("write_check", path, e))?;
        std::fs::remove_file(&check).map_err(|e| io_error("write_check", path, e))?;
    } else {
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_error("write_check", path, e))?;
    }
    Ok(())
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> DatabaseError {
    let mut err = DatabaseError::from(e);
    err.message = format!("{op} {}: {}", path.display(), err.message);
    err.context("path", path.display())
}

// ── Write probe ─────────────────────────────────────────────────────

/// Checks whether the store accepts writes.
#[async_trait]
pub trait WriteProbe: Send + Sync {
    async fn can_write(&self, paths: &StorePaths) -> bool;
}

/// Opens a fresh handle and attempts a rolled-back schema write.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibsqlWriteProbe;

#[async_trait]
impl WriteProbe for LibsqlWriteProbe {
    async fn can_write(&self, paths: &StorePaths) -> bool {
        match probe_write(&paths.db_file).await {
            Ok(()) => true,
            Err(e) => {
                debug!(path = %paths.db_file.display(), "Write probe failed: {e}");
                false
            }
        }
    }
}

async fn probe_write(db_file: &Path) -> Result<(), libsql::Error> {
    let db = libsql::Builder::new_local(db_file).build().await?;
    let conn = db.connect()?;
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    let created = conn
        .execute("CREATE TABLE IF NOT EXISTS __write_probe (id INTEGER)", ())
        .await;
    let _ = conn.execute("ROLLBACK", ()).await;
    created.map(|_| ())
}

// ── Ladder ──────────────────────────────────────────────────────────

/// Result of one recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The store accepts writes again; stop here.
    Recovered,
    /// Not writable yet; escalate to the next step.
    NotRecovered,
}

/// Everything a recovery step may touch.
pub struct RecoveryContext {
    pub paths: StorePaths,
    pub permissions: Arc<PermissionManager>,
    pub probe: Arc<dyn WriteProbe>,
}

impl RecoveryContext {
    async fn writable(&self) -> StepOutcome {
        if self.probe.can_write(&self.paths).await {
            StepOutcome::Recovered
        } else {
            StepOutcome::NotRecovered
        }
    }
}

/// One rung of the recovery ladder.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, ctx: &RecoveryContext) -> StepOutcome;
}

/// Copies the database to a timestamped backup. Best-effort; never recovers on its own.
pub struct BackupSnapshot;

#[async_trait]
impl RecoveryStrategy for BackupSnapshot {
    fn name(&self) -> &'static str {
        "backup_snapshot"
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> StepOutcome {
        let db_file = &ctx.paths.db_file;
        if !db_file.exists() {
            return StepOutcome::NotRecovered;
        }
        let backup = backup_path(db_file);
        match tokio::fs::copy(db_file, &backup).await {
            Ok(bytes) => info!(backup = %backup.display(), bytes, "Database backup created"),
            Err(e) => warn!(backup = %backup.display(), "Failed to create database backup: {e}"),
        }
        StepOutcome::NotRecovered
    }
}

fn backup_path(db_file: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let name = db_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database".to_string());
    db_file.with_file_name(format!("{name}.backup-{stamp}"))
}

/// Re-applies file modes, then retests.
pub struct RepairPermissions;

#[async_trait]
impl RecoveryStrategy for RepairPermissions {
    fn name(&self) -> &'static str {
        "repair_permissions"
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> StepOutcome {
        ctx.permissions.invalidate();
        if !ctx.permissions.ensure_permissions() {
            return StepOutcome::NotRecovered;
        }
        ctx.writable().await
    }
}

/// Deletes the WAL sidecars, which may hold a stale lock, then retests.
pub struct RemoveSidecars;

#[async_trait]
impl RecoveryStrategy for RemoveSidecars {
    fn name(&self) -> &'static str {
        "remove_sidecars"
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> StepOutcome {
        for sidecar in ctx.paths.sidecars() {
            if sidecar.exists() {
                info!(path = %sidecar.display(), "Removing sidecar file");
                if let Err(e) = tokio::fs::remove_file(sidecar).await {
                    warn!(path = %sidecar.display(), "Failed to remove sidecar: {e}");
                }
            }
        }
        ctx.writable().await
    }
}

/// Last resort: replaces the database with an empty file.
pub struct RecreateDatabase;

#[async_trait]
impl RecoveryStrategy for RecreateDatabase {
    fn name(&self) -> &'static str {
        "recreate_database"
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> StepOutcome {
        let db_file = &ctx.paths.db_file;
        warn!(path = %db_file.display(), "Last resort: recreating database file");
        if db_file.exists() {
            if let Err(e) = tokio::fs::remove_file(db_file).await {
                error!(path = %db_file.display(), "Failed to delete database file: {e}");
                return StepOutcome::NotRecovered;
            }
        }
        if let Err(e) = tokio::fs::write(db_file, b"").await {
            error!(path = %db_file.display(), "Failed to create empty database file: {e}");
            return StepOutcome::NotRecovered;
        }
        ctx.permissions.invalidate();
        if !ctx.permissions.ensure_permissions() {
            return StepOutcome::NotRecovered;
        }
        ctx.writable().await
    }
}

/// Runs strategies in order until one recovers.
pub struct RecoveryLadder {
    steps: Vec<Box<dyn RecoveryStrategy>>,
}

impl RecoveryLadder {
    pub fn new(steps: Vec<Box<dyn RecoveryStrategy>>) -> Self {
        Self { steps }
    }

    /// Backup, permissions, sidecars, recreate.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(BackupSnapshot),
            Box::new(RepairPermissions),
            Box::new(RemoveSidecars),
            Box::new(RecreateDatabase),
        ])
    }

    /// Returns the name of the step that recovered the store, if any.
    pub async fn run(&self, ctx: &RecoveryContext) -> Option<&'static str> {
        for step in &self.steps {
            info!(step = step.name(), "Recovery step");
            if step.attempt(ctx).await == StepOutcome::Recovered {
                info!(step = step.name(), "Database recovered");
                return Some(step.name());
            }
        }
        None
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Entry point for read-only and corruption recovery.
pub struct RecoveryManager {
    ctx: RecoveryContext,
    ladder: RecoveryLadder,
    /// Serializes ladder runs; concurrent failures share one recovery.
    running: tokio::sync::Mutex<()>,
}

impl RecoveryManager {
    pub fn new(permissions: Arc<PermissionManager>) -> Self {
        Self::with_ladder(permissions, Arc::new(LibsqlWriteProbe), RecoveryLadder::standard())
    }

    pub fn with_ladder(
        permissions: Arc<PermissionManager>,
        probe: Arc<dyn WriteProbe>,
        ladder: RecoveryLadder,
    ) -> Self {
        Self {
            ctx: RecoveryContext {
                paths: permissions.paths().clone(),
                permissions,
                probe,
            },
            ladder,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.ctx.permissions
    }

    /// Try to make a read-only store writable again.
    pub async fn recover_from_readonly(&self) -> bool {
        let _guard = self.running.lock().await;
        error!(
            path = %self.ctx.paths.db_file.display(),
            "Attempting to recover from read-only database"
        );

        // Another caller may have finished recovery while we waited.
        if self.ctx.writable().await == StepOutcome::Recovered
            && self.ctx.permissions.ensure_permissions()
        {
            info!("Database already writable");
            return true;
        }

        match self.ladder.run(&self.ctx).await {
            Some(_) => true,
            None => {
                error!(path = %self.ctx.paths.db_file.display(), "All recovery attempts failed");
                false
            }
        }
    }

    /// Run `PRAGMA integrity_check` on a fresh handle.
    pub async fn integrity_check(&self) -> Result<bool, DatabaseError> {
        let db = libsql::Builder::new_local(&self.ctx.paths.db_file)
            .build()
            .await
            .map_err(|e| DatabaseError::from_libsql("integrity_check", e))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::from_libsql("integrity_check", e))?;
        let mut rows = conn
            .query("PRAGMA integrity_check", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("integrity_check", e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("integrity_check", e))?;
        let result: String = match row {
            Some(row) => row
                .get(0)
                .map_err(|e| DatabaseError::from_libsql("integrity_check", e))?,
            None => String::new(),
        };
        if result == "ok" {
            info!("Database integrity check passed");
            Ok(true)
        } else {
            warn!(result = %result, "Database integrity check failed");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_config(dir: &Path) -> StoreConfig {
        StoreConfig::new(dir.join("data"))
    }

    #[test]
    fn write_check_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("jobs.db");
        std::fs::write(&file, b"keep me").unwrap();

        ensure_writable(tmp.path()).unwrap();
        ensure_writable(&file).unwrap();

        assert_eq!(std::fs::read(&file).unwrap(), b"keep me");
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("jobs.db")]);
    }

    #[cfg(unix)]
    #[test]
    fn write_check_uses_real_access() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let locked = tmp.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users bypass mode bits; the check must agree with the OS.
        let os_allows = std::fs::write(locked.join("x"), b"").is_ok();
        let _ = std::fs::remove_file(locked.join("x"));
        assert_eq!(ensure_writable(&locked).is_ok(), os_allows);

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    struct Recorded {
        name: &'static str,
        outcome: StepOutcome,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl RecoveryStrategy for Recorded {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn attempt(&self, _ctx: &RecoveryContext) -> StepOutcome {
            self.calls.lock().unwrap().push(self.name);
            self.outcome
        }
    }

    struct FixedProbe(AtomicBool);

    #[async_trait]
    impl WriteProbe for FixedProbe {
        async fn can_write(&self, _paths: &StorePaths) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct CountingProbe {
        calls: AtomicUsize,
        writable_after: usize,
    }

    #[async_trait]
    impl WriteProbe for CountingProbe {
        async fn can_write(&self, _paths: &StorePaths) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 > self.writable_after
        }
    }

    fn context(dir: &Path, probe: Arc<dyn WriteProbe>) -> RecoveryContext {
        let permissions = Arc::new(PermissionManager::new(&test_config(dir)));
        RecoveryContext {
            paths: permissions.paths().clone(),
            permissions,
            probe,
        }
    }

    #[test]
    fn ensure_permissions_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let manager = PermissionManager::new(&config);
        assert!(!config.data_dir.exists());
        assert!(manager.ensure_permissions());
        assert!(config.data_dir.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn ensure_permissions_normalizes_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let paths = config.paths();
        std::fs::create_dir_all(&paths.data_dir).unwrap();
        std::fs::write(&paths.db_file, b"").unwrap();
        std::fs::write(&paths.wal_file, b"").unwrap();
        std::fs::set_permissions(&paths.db_file, std::fs::Permissions::from_mode(0o444)).unwrap();
        std::fs::set_permissions(&paths.wal_file, std::fs::Permissions::from_mode(0o400)).unwrap();

        let manager = PermissionManager::new(&config);
        assert!(manager.ensure_permissions());

        for file in [&paths.db_file, &paths.wal_file] {
            let mode = std::fs::metadata(file).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o666, "{}", file.display());
        }
    }

    #[cfg(unix)]
    #[test]
    fn ensure_permissions_result_is_cached() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let paths = config.paths();
        let manager = PermissionManager::new(&config);
        assert!(manager.ensure_permissions());

        std::fs::write(&paths.db_file, b"").unwrap();
        std::fs::set_permissions(&paths.db_file, std::fs::Permissions::from_mode(0o444)).unwrap();

        // Cached: the new file is not looked at.
        assert!(manager.ensure_permissions());
        let mode = std::fs::metadata(&paths.db_file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o444);

        manager.invalidate();
        assert!(manager.ensure_permissions());
        let mode = std::fs::metadata(&paths.db_file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);
    }

    #[tokio::test]
    async fn ladder_stops_at_first_success() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), Arc::new(FixedProbe(AtomicBool::new(false))));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let step = |name: &'static str, outcome: StepOutcome| -> Box<dyn RecoveryStrategy> {
            Box::new(Recorded {
                name,
                outcome,
                calls: calls.clone(),
            })
        };
        let ladder = RecoveryLadder::new(vec![
            step("backup", StepOutcome::NotRecovered),
            step("permissions", StepOutcome::NotRecovered),
            step("sidecars", StepOutcome::Recovered),
            step("recreate", StepOutcome::Recovered),
        ]);

        assert_eq!(ladder.run(&ctx).await, Some("sidecars"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["backup", "permissions", "sidecars"]
        );
    }

    #[tokio::test]
    async fn ladder_reports_total_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), Arc::new(FixedProbe(AtomicBool::new(false))));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ladder = RecoveryLadder::new(vec![Box::new(Recorded {
            name: "only",
            outcome: StepOutcome::NotRecovered,
            calls: calls.clone(),
        })]);
        assert_eq!(ladder.run(&ctx).await, None);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_sidecars_deletes_wal_and_shm() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), Arc::new(FixedProbe(AtomicBool::new(true))));
        std::fs::create_dir_all(&ctx.paths.data_dir).unwrap();
        std::fs::write(&ctx.paths.db_file, b"").unwrap();
        std::fs::write(&ctx.paths.wal_file, b"stale").unwrap();
        std::fs::write(&ctx.paths.shm_file, b"stale").unwrap();

        assert_eq!(RemoveSidecars.attempt(&ctx).await, StepOutcome::Recovered);
        assert!(!ctx.paths.wal_file.exists());
        assert!(!ctx.paths.shm_file.exists());
        assert!(ctx.paths.db_file.exists());
    }

    #[tokio::test]
    async fn backup_snapshot_copies_file_and_escalates() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), Arc::new(FixedProbe(AtomicBool::new(true))));
        std::fs::create_dir_all(&ctx.paths.data_dir).unwrap();
        std::fs::write(&ctx.paths.db_file, b"contents").unwrap();

        assert_eq!(BackupSnapshot.attempt(&ctx).await, StepOutcome::NotRecovered);

        let backups: Vec<_> = std::fs::read_dir(&ctx.paths.data_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(backups[0].path()).unwrap(), b"contents");
    }

    #[tokio::test]
    async fn recreate_database_replaces_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), Arc::new(LibsqlWriteProbe));
        std::fs::create_dir_all(&ctx.paths.data_dir).unwrap();
        std::fs::write(&ctx.paths.db_file, b"definitely not a sqlite database file").unwrap();

        assert_eq!(RecreateDatabase.attempt(&ctx).await, StepOutcome::Recovered);
        assert!(LibsqlWriteProbe.can_write(&ctx.paths).await);
    }

    #[tokio::test]
    async fn manager_escalates_until_probe_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let permissions = Arc::new(PermissionManager::new(&test_config(tmp.path())));
        assert!(permissions.ensure_permissions());
        std::fs::write(&permissions.paths().db_file, b"").unwrap();

        // Initial check + permissions step fail; the sidecar step's probe passes.
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            writable_after: 2,
        });
        let manager =
            RecoveryManager::with_ladder(permissions, probe.clone(), RecoveryLadder::standard());

        assert!(manager.recover_from_readonly().await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(manager.permissions().paths().db_file.exists());
    }

    #[tokio::test]
    async fn integrity_check_on_fresh_database() {
        let tmp = tempfile::tempdir().unwrap();
        let permissions = Arc::new(PermissionManager::new(&test_config(tmp.path())));
        assert!(permissions.ensure_permissions());
        let manager = RecoveryManager::new(permissions);
        assert!(manager.integrity_check().await.unwrap());
    }
}
