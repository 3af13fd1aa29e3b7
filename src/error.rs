//! Error types for the job store.
//!
//! Storage failures are normalized into [`DatabaseError`], which carries a
//! category, a severity and a correlation id so that callers (and the
//! user-facing [`ErrorReporter`]) can decide what to surface.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Top-level error type for the job store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl Error {
    /// The storage error behind this failure, if there is one.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match self {
            Self::Database(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this failure means the store could not be written at all.
    pub fn is_readonly(&self) -> bool {
        self.as_database().is_some_and(DatabaseError::is_readonly)
    }

    /// Whether the recovery ladder should run before giving up.
    pub fn needs_recovery(&self) -> bool {
        self.as_database().is_some_and(DatabaseError::needs_recovery)
    }
}

impl From<libsql::Error> for Error {
    fn from(e: libsql::Error) -> Self {
        Self::Database(DatabaseError::from(e))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown job status: {0}")]
    InvalidStatus(String),

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },
}

// ── Taxonomy ────────────────────────────────────────────────────────

/// What kind of storage failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Permission,
    Integrity,
    Constraint,
    Lock,
    Timeout,
    Query,
    Other,
}

/// Substring table used by [`ErrorCategory::detect`]. Checked in order.
const CATEGORY_PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Lock,
        &["database is locked", "database table is locked", "sqlite_busy", "busy", "locked"],
    ),
    (ErrorCategory::Timeout, &["timeout", "timed out"]),
    (
        ErrorCategory::Permission,
        &["readonly", "read-only", "permission denied", "access denied", "eacces", "eperm"],
    ),
    (
        ErrorCategory::Integrity,
        &["malformed", "corrupt", "not a database", "integrity"],
    ),
    (
        ErrorCategory::Constraint,
        &["constraint", "unique", "foreign key", "not null"],
    ),
    (
        ErrorCategory::Connection,
        &["unable to open", "cannot open", "connection", "disk i/o"],
    ),
    (
        ErrorCategory::Query,
        &["syntax error", "no such table", "no such column", "sql"],
    ),
];

impl ErrorCategory {
    /// Classify a failure from its message text.
    pub fn detect(message: &str) -> Self {
        let lower = message.to_lowercase();
        CATEGORY_PATTERNS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
            .map(|(category, _)| *category)
            .unwrap_or(Self::Other)
    }

    /// Severity a failure of this category gets unless told otherwise.
    pub fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Connection | Self::Permission | Self::Integrity => ErrorSeverity::Critical,
            Self::Lock | Self::Timeout | Self::Constraint | Self::Query | Self::Other => {
                ErrorSeverity::Warning
            }
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Permission => "permission",
            Self::Integrity => "integrity",
            Self::Constraint => "constraint",
            Self::Lock => "lock",
            Self::Timeout => "timeout",
            Self::Query => "query",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// How bad a storage failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Fatal,
    Critical,
    Warning,
    Info,
}

impl ErrorSeverity {
    /// Only fatal and critical failures are shown to a human by default.
    pub fn reports_to_user(self) -> bool {
        matches!(self, Self::Fatal | Self::Critical)
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fatal => "fatal",
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        };
        write!(f, "{s}")
    }
}

/// A classified storage failure.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message} [{category}/{severity}]")]
pub struct DatabaseError {
    /// Human-readable description.
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Whether this failure should be surfaced to the user.
    pub report_to_user: bool,
    /// Free-form details (operation name, job id, path...).
    pub context: BTreeMap<String, String>,
    /// Correlation id for log lookups.
    pub id: Uuid,
}

impl DatabaseError {
    /// Build an error, detecting the category from the message.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let category = ErrorCategory::detect(&message);
        Self::with_category(message, category)
    }

    /// Build an error with an explicit category.
    pub fn with_category(message: impl Into<String>, category: ErrorCategory) -> Self {
        let severity = category.default_severity();
        Self {
            message: message.into(),
            category,
            severity,
            report_to_user: severity.reports_to_user(),
            context: BTreeMap::new(),
            id: Uuid::new_v4(),
        }
    }

    /// Wrap a libsql failure raised by the named operation.
    pub fn from_libsql(operation: &str, err: libsql::Error) -> Self {
        Self::new(format!("{operation}: {err}")).context("operation", operation)
    }

    /// Override severity; `report_to_user` follows the new severity.
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self.report_to_user = severity.reports_to_user();
        self
    }

    pub fn report(mut self, report_to_user: bool) -> Self {
        self.report_to_user = report_to_user;
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Whether the store rejected a write because it is read-only.
    pub fn is_readonly(&self) -> bool {
        let lower = self.message.to_lowercase();
        lower.contains("readonly") || lower.contains("read-only")
    }

    /// Read-only and corrupted stores are both handed to recovery.
    pub fn needs_recovery(&self) -> bool {
        self.is_readonly() || self.category == ErrorCategory::Integrity
    }

    /// Whether the failure was lock contention or a wait that ran out.
    pub fn is_contention(&self) -> bool {
        matches!(self.category, ErrorCategory::Lock | ErrorCategory::Timeout)
    }
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::io::Error> for DatabaseError {
    fn from(e: std::io::Error) -> Self {
        let category = match e.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
            std::io::ErrorKind::TimedOut => ErrorCategory::Timeout,
            _ => ErrorCategory::detect(&e.to_string()),
        };
        Self::with_category(e.to_string(), category)
    }
}

// ── Reporting ───────────────────────────────────────────────────────

/// Channel through which user-facing storage failures leave the core.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &DatabaseError);
}

/// Default reporter: writes the failure to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &DatabaseError) {
        tracing::error!(
            error_id = %error.id,
            category = %error.category,
            severity = %error.severity,
            context = ?error.context,
            "{}",
            error.message
        );
    }
}

/// Fans reported failures out to UI subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastReporter {
    tx: broadcast::Sender<DatabaseError>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseError> {
        self.tx.subscribe()
    }
}

impl ErrorReporter for BroadcastReporter {
    fn report(&self, error: &DatabaseError) {
        // No subscribers is fine; nobody is looking.
        let _ = self.tx.send(error.clone());
    }
}

/// Result type alias for the job store.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_categories_from_messages() {
        assert_eq!(
            ErrorCategory::detect("SQLite failure: `database is locked`"),
            ErrorCategory::Lock
        );
        assert_eq!(
            ErrorCategory::detect("attempt to write a readonly database"),
            ErrorCategory::Permission
        );
        assert_eq!(
            ErrorCategory::detect("database disk image is malformed"),
            ErrorCategory::Integrity
        );
        assert_eq!(
            ErrorCategory::detect("CHECK constraint failed: status"),
            ErrorCategory::Constraint
        );
        assert_eq!(
            ErrorCategory::detect("unable to open database file"),
            ErrorCategory::Connection
        );
        assert_eq!(
            ErrorCategory::detect("no such table: background_jobs"),
            ErrorCategory::Query
        );
        assert_eq!(
            ErrorCategory::detect("writer wait timed out"),
            ErrorCategory::Timeout
        );
        assert_eq!(ErrorCategory::detect("something odd"), ErrorCategory::Other);
    }

    #[test]
    fn severity_defaults_follow_category() {
        let e = DatabaseError::new("attempt to write a readonly database");
        assert_eq!(e.category, ErrorCategory::Permission);
        assert_eq!(e.severity, ErrorSeverity::Critical);
        assert!(e.report_to_user);
        assert!(e.is_readonly());

        let e = DatabaseError::new("database is locked");
        assert_eq!(e.severity, ErrorSeverity::Warning);
        assert!(!e.report_to_user);
        assert!(e.is_contention());
        assert!(!e.needs_recovery());

        let e = DatabaseError::new("file is not a database");
        assert_eq!(e.category, ErrorCategory::Integrity);
        assert!(e.needs_recovery());
        assert!(!e.is_readonly());
    }

    #[test]
    fn explicit_severity_overrides_reporting() {
        let e = DatabaseError::new("database is locked").severity(ErrorSeverity::Fatal);
        assert!(e.report_to_user);

        let e = DatabaseError::with_category("gone", ErrorCategory::Connection).report(false);
        assert_eq!(e.severity, ErrorSeverity::Critical);
        assert!(!e.report_to_user);
    }

    #[test]
    fn each_error_gets_its_own_id() {
        let a = DatabaseError::new("x");
        let b = DatabaseError::new("x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn io_permission_denied_is_permission() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let e = DatabaseError::from(io);
        assert_eq!(e.category, ErrorCategory::Permission);
    }

    #[tokio::test]
    async fn broadcast_reporter_delivers_to_subscribers() {
        let reporter = BroadcastReporter::new(8);
        let mut rx = reporter.subscribe();
        let err = DatabaseError::new("unable to open database file").context("path", "/tmp/x");
        reporter.report(&err);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, err.id);
        assert_eq!(got.context.get("path").map(String::as_str), Some("/tmp/x"));
    }
}
