//! Read-only lookups. Failures are logged and read as "nothing found".

use std::time::Duration;

use libsql::Value;
use libsql::params::Params;
use serde_json::Value as Json;
use tracing::{debug, warn};

use super::BackgroundJobRepository;
use super::rows::{
    collect_jobs, listing_order, millis_before, placeholders, select_columns, to_millis,
};
use crate::error::DatabaseError;
use crate::jobs::model::now_millis;
use crate::jobs::{Job, JobStatus, PayloadMode};
use crate::store::pool::AccessMode;
use crate::store::schema::JOBS_TABLE;

impl BackgroundJobRepository {
    /// Fetch one job by id, cleared or not.
    pub async fn get_background_job(&self, job_id: &str) -> Option<Job> {
        self.select(
            "get_background_job",
            "id = ?",
            vec![Value::Text(job_id.to_string())],
            PayloadMode::Full,
        )
        .await
        .into_iter()
        .next()
    }

    /// Jobs belonging to a session.
    pub async fn get_session_background_jobs(
        &self,
        session_id: &str,
        mode: PayloadMode,
    ) -> Vec<Job> {
        self.select(
            "get_session_background_jobs",
            "session_id = ? AND cleared = 0",
            vec![Value::Text(session_id.to_string())],
            mode,
        )
        .await
    }

    /// Every job that has not reached a terminal status.
    pub async fn get_active_background_jobs(&self, mode: PayloadMode) -> Vec<Job> {
        let filter = format!(
            "status NOT IN {} AND cleared = 0",
            JobStatus::terminal_sql_list()
        );
        self.select("get_active_background_jobs", &filter, Vec::new(), mode)
            .await
    }

    /// Active jobs plus anything updated within `window`.
    pub async fn get_recent_and_active_jobs(
        &self,
        window: Duration,
        mode: PayloadMode,
    ) -> Vec<Job> {
        let since = millis_before(to_millis(now_millis()), window);
        let filter = format!(
            "(status NOT IN {} OR updated_at >= ?) AND cleared = 0",
            JobStatus::terminal_sql_list()
        );
        self.select(
            "get_recent_and_active_jobs",
            &filter,
            vec![Value::Integer(since)],
            mode,
        )
        .await
    }

    pub async fn get_background_jobs_by_project_directory(
        &self,
        project_directory: &str,
        mode: PayloadMode,
    ) -> Vec<Job> {
        self.select(
            "get_background_jobs_by_project_directory",
            "project_directory = ? AND cleared = 0",
            vec![Value::Text(project_directory.to_string())],
            mode,
        )
        .await
    }

    pub async fn get_background_jobs_by_task_type(
        &self,
        task_type: &str,
        mode: PayloadMode,
    ) -> Vec<Job> {
        self.select(
            "get_background_jobs_by_task_type",
            "task_type = ? AND cleared = 0",
            vec![Value::Text(task_type.to_string())],
            mode,
        )
        .await
    }

    /// Fetch a set of jobs by id; unknown ids are skipped.
    pub async fn get_background_jobs_by_ids(&self, ids: &[&str]) -> Vec<Job> {
        if ids.is_empty() {
            return Vec::new();
        }
        let filter = format!("id IN {}", placeholders(ids.len()));
        let values = ids.iter().map(|id| Value::Text(id.to_string())).collect();
        self.select("get_background_jobs_by_ids", &filter, values, PayloadMode::Full)
            .await
    }

    pub async fn get_background_jobs_by_status(
        &self,
        statuses: &[JobStatus],
        mode: PayloadMode,
    ) -> Vec<Job> {
        if statuses.is_empty() {
            return Vec::new();
        }
        let filter = format!("status IN {} AND cleared = 0", placeholders(statuses.len()));
        let values = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        self.select("get_background_jobs_by_status", &filter, values, mode)
            .await
    }

    /// Jobs whose metadata has `value` at `field`.
    ///
    /// `field` is a dotted path of plain identifiers (`workflow_id`,
    /// `task_data.stage`); anything else is rejected. Only scalar values match.
    pub async fn get_background_jobs_by_metadata_field(
        &self,
        field: &str,
        value: &Json,
        mode: PayloadMode,
    ) -> Vec<Job> {
        if !is_metadata_path(field) {
            warn!(field, "Rejected metadata field name");
            return Vec::new();
        }
        let bound = match value {
            Json::String(s) => Value::Text(s.clone()),
            Json::Bool(b) => Value::Integer(i64::from(*b)),
            Json::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Value::Integer(i),
                (None, Some(f)) => Value::Real(f),
                (None, None) => return Vec::new(),
            },
            _ => {
                warn!(field, "Metadata lookups only match scalar values");
                return Vec::new();
            }
        };
        self.select(
            "get_background_jobs_by_metadata_field",
            "CASE WHEN json_valid(metadata) THEN json_extract(metadata, ?) END = ? AND cleared = 0",
            vec![Value::Text(format!("$.{field}")), bound],
            mode,
        )
        .await
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn select(
        &self,
        operation: &str,
        filter: &str,
        values: Vec<Value>,
        mode: PayloadMode,
    ) -> Vec<Job> {
        let sql = format!(
            "SELECT {} FROM {JOBS_TABLE} WHERE {filter} ORDER BY {}",
            select_columns(mode),
            listing_order()
        );
        let (sql, values) = (&sql, &values);

        let result = self
            .pool
            .with_connection(AccessMode::ReadOnly, |conn| async move {
                let rows = conn
                    .query(sql, Params::Positional(values.clone()))
                    .await
                    .map_err(|e| DatabaseError::from_libsql(operation, e))?;
                collect_jobs(rows, operation).await
            })
            .await;

        match result {
            Ok(jobs) => jobs,
            // Nothing has been written yet; the first write creates the table.
            Err(e) if e.to_string().contains("no such table") => {
                debug!(operation, "Job table not created yet");
                Vec::new()
            }
            Err(e) => {
                warn!(operation, "Job query failed: {e}");
                Vec::new()
            }
        }
    }
}

fn is_metadata_path(field: &str) -> bool {
    !field.is_empty()
        && field.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
