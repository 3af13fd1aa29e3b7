//! Configuration types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Application data directory holding the database and its sidecars.
    pub data_dir: PathBuf,
    /// File name of the primary database inside `data_dir`.
    pub db_file_name: String,
    /// How long an operation waits on lock contention before failing.
    pub busy_timeout: Duration,
    /// Maximum concurrently open read-only handles.
    pub max_readers: usize,
    /// How long a successful permission check is trusted.
    pub permission_cache_ttl: Duration,
    /// Mode applied to `data_dir` (unix only).
    pub dir_mode: u32,
    /// Mode applied to the database and sidecar files (unix only).
    pub file_mode: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            db_file_name: "jobs.db".to_string(),
            busy_timeout: Duration::from_millis(5_000),
            max_readers: 8,
            permission_cache_ttl: Duration::from_secs(60),
            dir_mode: 0o775,
            file_mode: 0o666,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `data_dir`, everything else default.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Read overrides from `JOBSTORE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("JOBSTORE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("JOBSTORE_DB_FILE") {
            config.db_file_name = name;
        }
        if let Some(ms) = env_parse::<u64>("JOBSTORE_BUSY_TIMEOUT_MS")? {
            config.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("JOBSTORE_MAX_READERS")? {
            if n == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "JOBSTORE_MAX_READERS".into(),
                    message: "must be at least 1".into(),
                });
            }
            config.max_readers = n;
        }
        Ok(config)
    }

    pub fn paths(&self) -> StorePaths {
        StorePaths::new(&self.data_dir, &self.db_file_name)
    }
}

/// On-disk layout: the primary database file and its two WAL sidecars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub data_dir: PathBuf,
    pub db_file: PathBuf,
    pub wal_file: PathBuf,
    pub shm_file: PathBuf,
}

impl StorePaths {
    pub fn new(data_dir: &Path, db_file_name: &str) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            db_file: data_dir.join(db_file_name),
            wal_file: data_dir.join(format!("{db_file_name}-wal")),
            shm_file: data_dir.join(format!("{db_file_name}-shm")),
        }
    }

    pub fn sidecars(&self) -> [&Path; 2] {
        [&self.wal_file, &self.shm_file]
    }
}

/// Periodic maintenance configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Claims older than this are handed back to the queue.
    pub stale_threshold: Duration,
    /// Retention argument passed to the history sweep.
    pub days_to_keep: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(300), // 5 minutes
            days_to_keep: 7,
        }
    }
}

impl SweeperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = env_parse::<u64>("JOBSTORE_SWEEP_INTERVAL_SECS")? {
            config.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("JOBSTORE_STALE_THRESHOLD_SECS")? {
            config.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(days) = env_parse::<i64>("JOBSTORE_DAYS_TO_KEEP")? {
            config.days_to_keep = days;
        }
        Ok(config)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_paths_sit_next_to_db() {
        let paths = StorePaths::new(Path::new("/var/app"), "jobs.db");
        assert_eq!(paths.db_file, PathBuf::from("/var/app/jobs.db"));
        assert_eq!(paths.wal_file, PathBuf::from("/var/app/jobs.db-wal"));
        assert_eq!(paths.shm_file, PathBuf::from("/var/app/jobs.db-shm"));
    }

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert_eq!(config.permission_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.file_mode, 0o666);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // SAFETY: test-only variable no other test reads.
        unsafe { std::env::set_var("JOBSTORE_TEST_GARBAGE", "abc") };
        let err = env_parse::<u64>("JOBSTORE_TEST_GARBAGE").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(env_parse::<u64>("JOBSTORE_TEST_UNSET_VAR").unwrap().is_none());
    }
}
