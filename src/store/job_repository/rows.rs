//! Row mapping between `background_jobs` and [`Job`].
//!
//! Timestamps are stored as Unix milliseconds; this is the only place that
//! converts between the two representations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Row, Rows, Value};
use serde_json::{Map, Value as Json};

use crate::error::{DatabaseError, JobError, Result};
use crate::jobs::{Job, JobConfig, JobStatus, PayloadMode};

const COLUMNS_BEFORE_RESPONSE: &str = "id, session_id, api_type, task_type, status, prompt";

const COLUMNS_AFTER_RESPONSE: &str = "error_message, status_message, tokens_sent, tokens_received, total_tokens, chars_received, model_used, max_output_tokens, temperature, include_syntax, output_file_path, project_directory, cleared, visible, metadata, created_at, updated_at, last_update, start_time, end_time";

/// Active statuses first, then most recently updated.
pub(super) fn listing_order() -> String {
    format!(
        "CASE WHEN status IN {} THEN 1 ELSE 0 END ASC, updated_at DESC",
        JobStatus::terminal_sql_list()
    )
}

/// Claim order: priority hint descending, then oldest first.
pub(super) const CLAIM_ORDER: &str =
    "COALESCE(CAST(json_extract(metadata, '$.priority') AS INTEGER), 1) DESC, created_at ASC, id ASC";

/// Column list for a SELECT; listings may swap the response for an empty string.
pub(super) fn select_columns(mode: PayloadMode) -> String {
    let response = match mode {
        PayloadMode::Full => "response",
        PayloadMode::ExcludeResponse => "'' AS response",
    };
    format!("{COLUMNS_BEFORE_RESPONSE}, {response}, {COLUMNS_AFTER_RESPONSE}")
}

/// Every column, in SELECT order, for an upsert.
pub(super) fn insert_columns() -> String {
    select_columns(PayloadMode::Full)
}

/// Column order matches `select_columns`:
/// 0:id 1:session_id 2:api_type 3:task_type 4:status 5:prompt 6:response
/// 7:error_message 8:status_message 9:tokens_sent 10:tokens_received
/// 11:total_tokens 12:chars_received 13:model_used 14:max_output_tokens
/// 15:temperature 16:include_syntax 17:output_file_path 18:project_directory
/// 19:cleared 20:visible 21:metadata 22:created_at 23:updated_at
/// 24:last_update 25:start_time 26:end_time
pub(super) fn row_to_job(row: &Row) -> Result<Job> {
    let status_str: String = row.get(4)?;
    let status: JobStatus = status_str.parse()?;
    let metadata_str: Option<String> = row.get(21).ok();

    Ok(Job {
        id: row.get(0)?,
        session_id: row.get(1)?,
        api_type: row.get(2)?,
        task_type: row.get(3)?,
        status,
        prompt: row.get(5)?,
        response: row.get::<String>(6).unwrap_or_default(),
        error_message: row.get(7).ok(),
        status_message: row.get(8).ok(),
        tokens_sent: row.get::<i64>(9).unwrap_or(0),
        tokens_received: row.get::<i64>(10).unwrap_or(0),
        total_tokens: row.get::<i64>(11).unwrap_or(0),
        chars_received: row.get::<i64>(12).unwrap_or(0),
        config: JobConfig {
            model_used: row.get(13).ok(),
            max_output_tokens: row.get(14).ok(),
            temperature: row.get(15).ok(),
            include_syntax: row.get::<i64>(16).unwrap_or(0) != 0,
            output_file_path: row.get(17).ok(),
            project_directory: row.get(18).ok(),
        },
        cleared: row.get::<i64>(19).unwrap_or(0) != 0,
        visible: row.get::<i64>(20).unwrap_or(1) != 0,
        metadata: parse_metadata(metadata_str.as_deref()),
        created_at: from_millis(row.get(22)?)?,
        updated_at: from_millis(row.get(23)?)?,
        last_update: opt_from_millis(row.get(24).ok())?,
        start_time: opt_from_millis(row.get(25).ok())?,
        end_time: opt_from_millis(row.get(26).ok())?,
    })
}

/// Drain `rows` into jobs, skipping rows that do not parse.
pub(super) async fn collect_jobs(mut rows: Rows, operation: &str) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::from_libsql(operation, e))?
    {
        match row_to_job(&row) {
            Ok(job) => jobs.push(job),
            Err(e) => tracing::warn!(operation, "Skipping job row: {e}"),
        }
    }
    Ok(jobs)
}

/// Bind values for `insert_columns`, in the same order.
pub(super) fn job_values(job: &Job) -> Vec<Value> {
    vec![
        Value::Text(job.id.clone()),
        Value::Text(job.session_id.clone()),
        Value::Text(job.api_type.clone()),
        Value::Text(job.task_type.clone()),
        Value::Text(job.status.as_str().to_string()),
        Value::Text(job.prompt.clone()),
        Value::Text(job.response.clone()),
        opt_text(job.error_message.as_deref()),
        opt_text(job.status_message.as_deref()),
        Value::Integer(job.tokens_sent),
        Value::Integer(job.tokens_received),
        Value::Integer(job.total_tokens),
        Value::Integer(job.chars_received),
        opt_text(job.config.model_used.as_deref()),
        job.config
            .max_output_tokens
            .map_or(Value::Null, Value::Integer),
        job.config.temperature.map_or(Value::Null, Value::Real),
        Value::Integer(job.config.include_syntax as i64),
        opt_text(job.config.output_file_path.as_deref()),
        opt_text(job.config.project_directory.as_deref()),
        Value::Integer(job.cleared as i64),
        Value::Integer(job.visible as i64),
        Value::Text(metadata_text(&job.metadata)),
        Value::Integer(to_millis(job.created_at)),
        Value::Integer(to_millis(job.updated_at)),
        opt_millis(job.last_update),
        opt_millis(job.start_time),
        opt_millis(job.end_time),
    ]
}

// ── Helpers ─────────────────────────────────────────────────────────

pub(super) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(super) fn opt_millis(dt: Option<DateTime<Utc>>) -> Value {
    dt.map_or(Value::Null, |dt| Value::Integer(to_millis(dt)))
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// `now` minus `span`, saturating instead of wrapping.
pub(super) fn millis_before(now: i64, span: Duration) -> i64 {
    now.saturating_sub(i64::try_from(span.as_millis()).unwrap_or(i64::MAX))
}

/// `now` minus `days` whole days, saturating instead of overflowing.
pub(super) fn days_before(now: i64, days: i64) -> i64 {
    now.saturating_sub(days.saturating_mul(DAY_MS))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| JobError::Validation(format!("timestamp out of range: {ms}")).into())
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

pub(super) fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

pub(super) fn metadata_text(metadata: &Map<String, Json>) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

/// Parse a stored metadata blob. Anything that is not a JSON object reads as empty.
pub(super) fn parse_metadata(raw: Option<&str>) -> Map<String, Json> {
    match raw.map(serde_json::from_str::<Json>) {
        Some(Ok(Json::Object(map))) => map,
        Some(Err(e)) => {
            tracing::warn!("Unparseable job metadata: {e}");
            Map::new()
        }
        _ => Map::new(),
    }
}

/// `(?, ?, ?)` with `n` placeholders.
pub(super) fn placeholders(n: usize) -> String {
    let marks = vec!["?"; n];
    format!("({})", marks.join(", "))
}
