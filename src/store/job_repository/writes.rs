//! Job creation, upsert, streaming append and status updates.

use libsql::params::Params;
use libsql::{Connection, Value, params};
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

use super::rows::{
    collect_jobs, insert_columns, job_values, metadata_text, parse_metadata, placeholders,
    select_columns, to_millis,
};
use super::{BULK_CANCEL_MESSAGE, BackgroundJobRepository};
use crate::error::{DatabaseError, JobError, Result};
use crate::jobs::model::{merge_metadata, now_millis};
use crate::jobs::{Job, JobStatus, JobStatusUpdate, NewJob, PayloadMode};
use crate::store::pool::AccessMode;
use crate::store::schema::JOBS_TABLE;

impl BackgroundJobRepository {
    /// Create and persist a job with zeroed counters.
    pub async fn create_background_job(&self, request: NewJob) -> Result<Job> {
        if request.session_id.trim().is_empty() {
            return Err(JobError::Validation("session_id is required".into()).into());
        }

        let mut job = Job::new(
            request.session_id,
            request.api_type,
            request.task_type,
            request.prompt,
            request.initial_status,
        );
        job.config = request.config;
        job.metadata = request.metadata;

        let job = self.save_background_job(&job).await?;
        info!(
            job_id = %job.id,
            task_type = %job.task_type,
            status = %job.status,
            "Background job created"
        );
        Ok(job)
    }

    /// Insert or fully overwrite a job. Returns the record as stored.
    pub async fn save_background_job(&self, job: &Job) -> Result<Job> {
        if job.session_id.trim().is_empty() {
            return Err(JobError::Validation("session_id is required".into()).into());
        }
        self.ensure_schema().await?;

        let mut stored = job.clone();
        stored.normalize();

        let columns = insert_columns();
        let updates = columns
            .split(", ")
            .filter(|c| *c != "id")
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {JOBS_TABLE} ({columns}) VALUES {} ON CONFLICT(id) DO UPDATE SET {updates}",
            placeholders(columns.split(", ").count())
        );
        let sql = &sql;
        let stored_ref = &stored;

        self.pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                conn.execute(sql, Params::Positional(job_values(stored_ref)))
                    .await
                    .map_err(|e| DatabaseError::from_libsql("save_background_job", e))?;
                Ok(())
            })
            .await?;

        debug!(job_id = %stored.id, status = %stored.status, "Background job saved");
        Ok(stored)
    }

    /// Append a streamed chunk and bump counters; the job moves to `running`.
    ///
    /// Returns `false` for an empty chunk or when no active job has this id.
    pub async fn append_to_job_response(
        &self,
        job_id: &str,
        chunk: &str,
        tokens_received: i64,
        chars_received: i64,
    ) -> Result<bool> {
        if chunk.is_empty() {
            return Ok(false);
        }
        self.ensure_schema().await?;

        let now = to_millis(now_millis());
        let sql = format!(
            "UPDATE {JOBS_TABLE} SET
                response = response || ?1,
                tokens_received = tokens_received + ?2,
                total_tokens = MAX(total_tokens, tokens_sent + tokens_received + ?2),
                chars_received = MAX(chars_received, ?3),
                status = 'running',
                start_time = COALESCE(start_time, ?4),
                updated_at = ?4,
                last_update = ?4
             WHERE id = ?5 AND status NOT IN {}",
            JobStatus::terminal_sql_list()
        );
        let sql = &sql;

        let changed = self
            .pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                let changed = conn
                    .execute(
                        sql,
                        params![chunk, tokens_received, chars_received, now, job_id],
                    )
                    .await
                    .map_err(|e| DatabaseError::from_libsql("append_to_job_response", e))?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            debug!(job_id, "Append ignored: job missing or finished");
        }
        Ok(changed > 0)
    }

    /// Replace the whole response, for content that is post-processed as a unit.
    pub async fn update_background_job_response(&self, job_id: &str, response: &str) -> Result<()> {
        self.ensure_schema().await?;
        let now = to_millis(now_millis());

        let changed = self
            .pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                let changed = conn
                    .execute(
                        "UPDATE background_jobs
                         SET response = ?1, updated_at = ?2, last_update = ?2
                         WHERE id = ?3",
                        params![response, now, job_id],
                    )
                    .await
                    .map_err(|e| DatabaseError::from_libsql("update_background_job_response", e))?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(JobError::NotFound { id: job_id.to_string() }.into());
        }
        debug!(job_id, len = response.len(), "Background job response replaced");
        Ok(())
    }

    /// Apply a partial update. Fields left `None` are not written; metadata is merged.
    pub async fn update_background_job_status(&self, update: &JobStatusUpdate) -> Result<Job> {
        self.ensure_schema().await?;
        let now = to_millis(now_millis());

        let job = self
            .pool
            .with_transaction(|conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                let (current, mut metadata) = load_status(&conn, &update.job_id).await?;

                if !current.can_transition_to(update.status) {
                    return Err(JobError::InvalidTransition {
                        id: update.job_id.clone(),
                        state: current.to_string(),
                        target: update.status.to_string(),
                    }
                    .into());
                }

                let mut set = SetClause::default();
                set.push("status = ?", Value::Text(update.status.as_str().to_string()));
                if let Some(message) = &update.status_message {
                    set.push("status_message = ?", Value::Text(message.clone()));
                }
                if let Some(message) = &update.error_message {
                    set.push("error_message = ?", Value::Text(message.clone()));
                }
                // Counters only move forward.
                for (column, value) in [
                    ("tokens_sent", update.tokens_sent),
                    ("tokens_received", update.tokens_received),
                    ("total_tokens", update.total_tokens),
                    ("chars_received", update.chars_received),
                ] {
                    if let Some(n) = value {
                        set.push(&format!("{column} = MAX({column}, ?)"), Value::Integer(n));
                    }
                }
                if let Some(model) = &update.model_used {
                    set.push("model_used = ?", Value::Text(model.clone()));
                }
                if let Some(response) = &update.response {
                    set.push("response = ?", Value::Text(response.clone()));
                }
                if let Some(patch) = &update.metadata {
                    merge_metadata(&mut metadata, patch.clone());
                    set.push("metadata = ?", Value::Text(metadata_text(&metadata)));
                }
                if update.status.is_running_like() {
                    set.push("start_time = COALESCE(start_time, ?)", Value::Integer(now));
                }
                if update.status.is_terminal() {
                    match update.end_time {
                        Some(end) => set.push("end_time = ?", Value::Integer(to_millis(end))),
                        None => set.push("end_time = COALESCE(end_time, ?)", Value::Integer(now)),
                    }
                } else {
                    set.raw("end_time = NULL");
                }
                set.push("updated_at = ?", Value::Integer(now));
                set.push("last_update = ?", Value::Integer(now));

                set.execute(&conn, &update.job_id).await?;
                reload(&conn, &update.job_id).await
            })
            .await?;

        debug!(job_id = %job.id, status = %job.status, "Background job status updated");
        Ok(job)
    }

    /// Finish a job with its final response in a single write.
    pub async fn mark_job_completed(
        &self,
        job_id: &str,
        response: &str,
        model_used: Option<&str>,
    ) -> Result<Job> {
        let mut update = JobStatusUpdate::new(job_id, JobStatus::Completed).with_response(response);
        if let Some(model) = model_used {
            update = update.with_model_used(model);
        }
        let job = self.update_background_job_status(&update).await?;
        info!(job_id, len = response.len(), "Background job completed");
        Ok(job)
    }

    /// Fail a job with its error message in a single write.
    pub async fn mark_job_failed(
        &self,
        job_id: &str,
        error_message: &str,
        model_used: Option<&str>,
    ) -> Result<Job> {
        let mut update =
            JobStatusUpdate::new(job_id, JobStatus::Failed).with_error_message(error_message);
        if let Some(model) = model_used {
            update = update.with_model_used(model);
        }
        let job = self.update_background_job_status(&update).await?;
        info!(job_id, error = error_message, "Background job failed");
        Ok(job)
    }

    /// Merge `patch` into a job's metadata without touching anything else.
    pub async fn update_job_metadata(&self, job_id: &str, patch: &Map<String, Json>) -> Result<()> {
        self.ensure_schema().await?;
        let now = to_millis(now_millis());

        self.pool
            .with_transaction(|conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                let (_, mut metadata) = load_status(&conn, job_id).await?;
                merge_metadata(&mut metadata, patch.clone());
                conn.execute(
                    "UPDATE background_jobs SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                    params![metadata_text(&metadata), now, job_id],
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("update_job_metadata", e))?;
                Ok(())
            })
            .await?;

        debug!(job_id, keys = patch.len(), "Job metadata merged");
        Ok(())
    }

    /// Cancel one job. Returns `false` if it had already finished.
    pub async fn cancel_background_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        self.ensure_schema().await?;
        let now = to_millis(now_millis());

        let canceled = self
            .pool
            .with_transaction(|conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                let (current, _) = load_status(&conn, job_id).await?;
                if current.is_terminal() {
                    return Ok(false);
                }
                conn.execute(
                    "UPDATE background_jobs
                     SET status = 'canceled', error_message = ?1, end_time = ?2, updated_at = ?2, last_update = ?2
                     WHERE id = ?3",
                    params![reason, now, job_id],
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("cancel_background_job", e))?;
                Ok(true)
            })
            .await?;

        if canceled {
            info!(job_id, reason, "Background job canceled");
        }
        Ok(canceled)
    }

    /// Cancel every active job in a session, optionally sparing one task type.
    pub async fn cancel_all_session_background_jobs(
        &self,
        session_id: &str,
        exclude_task_type: Option<&str>,
    ) -> Result<u64> {
        self.ensure_schema().await?;
        let now = to_millis(now_millis());

        let mut sql = format!(
            "UPDATE {JOBS_TABLE}
             SET status = 'canceled', error_message = COALESCE(error_message, ?1),
                 end_time = ?2, updated_at = ?2, last_update = ?2
             WHERE session_id = ?3 AND status NOT IN {}",
            JobStatus::terminal_sql_list()
        );
        if exclude_task_type.is_some() {
            sql.push_str(" AND task_type != ?4");
        }
        let sql = &sql;

        let count = self
            .pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                let mut values = vec![
                    Value::Text(BULK_CANCEL_MESSAGE.to_string()),
                    Value::Integer(now),
                    Value::Text(session_id.to_string()),
                ];
                if let Some(task_type) = exclude_task_type {
                    values.push(Value::Text(task_type.to_string()));
                }
                conn.execute(sql, Params::Positional(values))
                    .await
                    .map_err(|e| {
                        DatabaseError::from_libsql("cancel_all_session_background_jobs", e)
                    })
                    .map_err(Into::into)
            })
            .await?;

        info!(session_id, count, excluded = ?exclude_task_type, "Canceled session jobs");
        Ok(count)
    }

    /// Hard-delete one job. Returns whether it existed.
    pub async fn delete_background_job(&self, job_id: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let changed = self
            .pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                conn.execute("DELETE FROM background_jobs WHERE id = ?1", params![job_id])
                    .await
                    .map_err(|e| DatabaseError::from_libsql("delete_background_job", e))
                    .map_err(Into::into)
            })
            .await?;

        debug!(job_id, deleted = changed > 0, "Background job delete");
        Ok(changed > 0)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Current status and metadata of a job, or `NotFound`.
async fn load_status(conn: &Connection, job_id: &str) -> Result<(JobStatus, Map<String, Json>)> {
    let mut rows = conn
        .query(
            "SELECT status, metadata FROM background_jobs WHERE id = ?1",
            params![job_id],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("load_status", e))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql("load_status", e))?
        .ok_or_else(|| JobError::NotFound { id: job_id.to_string() })?;

    let status: String = row.get(0)?;
    let metadata: Option<String> = row.get(1).ok();
    Ok((status.parse()?, parse_metadata(metadata.as_deref())))
}

async fn reload(conn: &Connection, job_id: &str) -> Result<Job> {
    let rows = conn
        .query(
            &format!(
                "SELECT {} FROM {JOBS_TABLE} WHERE id = ?1",
                select_columns(PayloadMode::Full)
            ),
            params![job_id],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("reload", e))?;
    collect_jobs(rows, "reload")
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| JobError::NotFound { id: job_id.to_string() }.into())
}

/// Dynamic `SET` list with positional binds.
#[derive(Default)]
struct SetClause {
    parts: Vec<String>,
    values: Vec<Value>,
}

impl SetClause {
    fn push(&mut self, part: &str, value: Value) {
        self.parts.push(part.to_string());
        self.values.push(value);
    }

    fn raw(&mut self, part: &str) {
        self.parts.push(part.to_string());
    }

    async fn execute(self, conn: &Connection, job_id: &str) -> Result<u64> {
        let sql = format!(
            "UPDATE {JOBS_TABLE} SET {} WHERE id = ?",
            self.parts.join(", ")
        );
        let mut values = self.values;
        values.push(Value::Text(job_id.to_string()));
        let changed = conn
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::from_libsql("update_background_job_status", e))?;
        if changed == 0 {
            return Err(JobError::NotFound { id: job_id.to_string() }.into());
        }
        Ok(changed)
    }
}
