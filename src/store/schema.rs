//! Schema for the background job table.
//!
//! The repository bootstraps this itself on first write; there is no separate
//! migration step. Every statement is `IF NOT EXISTS`, so running it again is
//! harmless.

use libsql::Connection;

use crate::error::DatabaseError;
use crate::jobs::JobStatus;

pub const JOBS_TABLE: &str = "background_jobs";

/// DDL for the jobs table and its indexes.
pub fn jobs_ddl() -> String {
    let statuses = JobStatus::all_sql_list();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {JOBS_TABLE} (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            api_type TEXT NOT NULL,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'idle' CHECK (status IN {statuses}),
            prompt TEXT NOT NULL,
            response TEXT NOT NULL DEFAULT '',
            error_message TEXT,
            status_message TEXT,
            tokens_sent INTEGER NOT NULL DEFAULT 0,
            tokens_received INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            chars_received INTEGER NOT NULL DEFAULT 0,
            model_used TEXT,
            max_output_tokens INTEGER,
            temperature REAL,
            include_syntax INTEGER NOT NULL DEFAULT 0,
            output_file_path TEXT,
            project_directory TEXT,
            cleared INTEGER NOT NULL DEFAULT 0,
            visible INTEGER NOT NULL DEFAULT 1,
            metadata TEXT NOT NULL DEFAULT '{{}}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_update INTEGER,
            start_time INTEGER,
            end_time INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_background_jobs_session ON {JOBS_TABLE}(session_id);
        CREATE INDEX IF NOT EXISTS idx_background_jobs_status_created ON {JOBS_TABLE}(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_background_jobs_updated ON {JOBS_TABLE}(updated_at);
        CREATE INDEX IF NOT EXISTS idx_background_jobs_task_type ON {JOBS_TABLE}(task_type);
        CREATE INDEX IF NOT EXISTS idx_background_jobs_project ON {JOBS_TABLE}(project_directory);
        "#
    )
}

/// Create the jobs table and indexes if absent.
pub async fn ensure_jobs_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(&jobs_ddl())
        .await
        .map_err(|e| DatabaseError::from_libsql("ensure_jobs_schema", e))?;
    Ok(())
}
