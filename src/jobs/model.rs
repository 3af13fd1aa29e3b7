//! Background job data model: status enum, job record, and update requests.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::JobError;

/// Metadata key read by the claim query to order queued work.
pub const PRIORITY_METADATA_KEY: &str = "priority";

/// Priority assumed for jobs without a hint.
pub const DEFAULT_PRIORITY: i64 = 1;

/// Lifecycle status of a background job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Created,
    Queued,
    AcknowledgedByWorker,
    Preparing,
    PreparingInput,
    GeneratingStream,
    ProcessingStream,
    Running,
    Completed,
    CompletedByTag,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 13] = [
        Self::Idle,
        Self::Created,
        Self::Queued,
        Self::AcknowledgedByWorker,
        Self::Preparing,
        Self::PreparingInput,
        Self::GeneratingStream,
        Self::ProcessingStream,
        Self::Running,
        Self::Completed,
        Self::CompletedByTag,
        Self::Failed,
        Self::Canceled,
    ];

    pub const TERMINAL: [JobStatus; 4] = [
        Self::Completed,
        Self::CompletedByTag,
        Self::Failed,
        Self::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Created => "created",
            Self::Queued => "queued",
            Self::AcknowledgedByWorker => "acknowledged_by_worker",
            Self::Preparing => "preparing",
            Self::PreparingInput => "preparing_input",
            Self::GeneratingStream => "generating_stream",
            Self::ProcessingStream => "processing_stream",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedByTag => "completed_by_tag",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// States in which output is being produced; entering one stamps `start_time`.
    pub fn is_running_like(&self) -> bool {
        matches!(
            self,
            Self::GeneratingStream | Self::ProcessingStream | Self::Running
        )
    }

    /// Check if this state allows transitioning to another state.
    ///
    /// Terminal states are final: the only accepted "transition" is
    /// re-asserting the same status (e.g. to attach a message).
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        if self.is_terminal() {
            return *self == target;
        }
        true
    }

    /// SQL list literal of the terminal statuses, e.g. `('completed', ...)`.
    pub fn terminal_sql_list() -> String {
        sql_list(&Self::TERMINAL)
    }

    /// SQL list literal of every status.
    pub fn all_sql_list() -> String {
        sql_list(&Self::ALL)
    }
}

fn sql_list(statuses: &[JobStatus]) -> String {
    let quoted: Vec<String> = statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
    format!("({})", quoted.join(", "))
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::InvalidStatus(s.to_string()))
    }
}

/// Generation settings captured when the job was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub include_syntax: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_directory: Option<String>,
}

/// A persisted background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Owning session/workspace.
    pub session_id: String,
    pub api_type: String,
    pub task_type: String,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    /// Set once, on the first move into a running-like state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Set iff the status is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    pub prompt: String,
    /// Accumulated output. Empty in listings that exclude the response.
    #[serde(default)]
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    #[serde(default)]
    pub tokens_sent: i64,
    #[serde(default)]
    pub tokens_received: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub chars_received: i64,

    #[serde(default)]
    pub config: JobConfig,

    /// Hidden from default listings, still stored.
    #[serde(default)]
    pub cleared: bool,
    #[serde(default = "default_visible")]
    pub visible: bool,

    /// Open extension map; opaque to the repository except for the priority hint.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_visible() -> bool {
    true
}

impl Job {
    /// Create a fresh job with zeroed counters.
    pub fn new(
        session_id: impl Into<String>,
        api_type: impl Into<String>,
        task_type: impl Into<String>,
        prompt: impl Into<String>,
        status: JobStatus,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            api_type: api_type.into(),
            task_type: task_type.into(),
            status,
            created_at: now,
            updated_at: now,
            last_update: None,
            start_time: None,
            end_time: status.is_terminal().then_some(now),
            prompt: prompt.into(),
            response: String::new(),
            error_message: None,
            status_message: None,
            tokens_sent: 0,
            tokens_received: 0,
            total_tokens: 0,
            chars_received: 0,
            config: JobConfig::default(),
            cleared: false,
            visible: true,
            metadata: Map::new(),
        }
    }

    /// Priority hint used when claiming queued work.
    pub fn priority(&self) -> i64 {
        self.metadata
            .get(PRIORITY_METADATA_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// Bring timestamps to storage precision and make `end_time` agree with the status.
    pub fn normalize(&mut self) {
        self.created_at = truncate_millis(self.created_at);
        self.updated_at = truncate_millis(self.updated_at);
        self.last_update = self.last_update.map(truncate_millis);
        self.start_time = self.start_time.map(truncate_millis);
        self.end_time = if self.status.is_terminal() {
            Some(truncate_millis(self.end_time.unwrap_or(self.updated_at)))
        } else {
            None
        };
    }
}

/// Request to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub session_id: String,
    pub api_type: String,
    pub task_type: String,
    pub prompt: String,
    pub config: JobConfig,
    pub initial_status: JobStatus,
    pub metadata: Map<String, Value>,
}

impl NewJob {
    pub fn new(
        session_id: impl Into<String>,
        api_type: impl Into<String>,
        task_type: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            api_type: api_type.into(),
            task_type: task_type.into(),
            prompt: prompt.into(),
            config: JobConfig::default(),
            initial_status: JobStatus::Idle,
            metadata: Map::new(),
        }
    }

    /// Builder: set the generation config snapshot.
    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder: set the initial status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.initial_status = status;
        self
    }

    /// Builder: set the claim priority hint.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.metadata
            .insert(PRIORITY_METADATA_KEY.to_string(), Value::from(priority));
        self
    }

    /// Builder: add an arbitrary metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Partial status update. Fields left `None` are not touched.
#[derive(Debug, Clone)]
pub struct JobStatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub tokens_sent: Option<i64>,
    pub tokens_received: Option<i64>,
    pub total_tokens: Option<i64>,
    pub chars_received: Option<i64>,
    pub model_used: Option<String>,
    /// Final response, written together with the status.
    pub response: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    /// Merged into the stored metadata, never replacing it.
    pub metadata: Option<Map<String, Value>>,
}

impl JobStatusUpdate {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            status_message: None,
            error_message: None,
            tokens_sent: None,
            tokens_received: None,
            total_tokens: None,
            chars_received: None,
            model_used: None,
            response: None,
            end_time: None,
            metadata: None,
        }
    }

    pub fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_tokens(mut self, sent: i64, received: i64) -> Self {
        self.tokens_sent = Some(sent);
        self.tokens_received = Some(received);
        self.total_tokens = Some(sent + received);
        self
    }

    pub fn with_chars_received(mut self, chars: i64) -> Self {
        self.chars_received = Some(chars);
        self
    }

    pub fn with_model_used(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_metadata(mut self, patch: Map<String, Value>) -> Self {
        self.metadata = Some(patch);
        self
    }
}

/// Whether listings carry the (possibly large) `response` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadMode {
    #[default]
    Full,
    ExcludeResponse,
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryCleanup {
    /// Rows hard-deleted.
    pub deleted: u64,
    /// Rows soft-hidden.
    pub cleared: u64,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Deep-merge `patch` into `target`: nested objects merge, anything else replaces.
pub fn merge_metadata(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_metadata(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Current time at storage precision.
pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub fn truncate_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_strings_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "acknowledgedByWorker".parse::<JobStatus>(),
            Err(JobError::InvalidStatus(_))
        ));
    }

    #[test]
    fn terminal_and_active_partition_the_set() {
        let terminal: Vec<_> = JobStatus::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal.len(), 4);
        assert!(JobStatus::AcknowledgedByWorker.is_active());
        assert!(JobStatus::CompletedByTag.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Canceled.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn sql_lists_quote_values() {
        assert_eq!(
            JobStatus::terminal_sql_list(),
            "('completed', 'completed_by_tag', 'failed', 'canceled')"
        );
    }

    #[test]
    fn serde_uses_snake_case() {
        let v = serde_json::to_value(JobStatus::AcknowledgedByWorker).unwrap();
        assert_eq!(v, json!("acknowledged_by_worker"));
    }

    #[test]
    fn priority_defaults_to_one() {
        let mut job = Job::new("s", "api", "task", "p", JobStatus::Queued);
        assert_eq!(job.priority(), 1);
        job.metadata.insert(PRIORITY_METADATA_KEY.into(), json!(5));
        assert_eq!(job.priority(), 5);
    }

    #[test]
    fn normalize_enforces_end_time_invariant() {
        let mut job = Job::new("s", "api", "task", "p", JobStatus::Running);
        job.end_time = Some(Utc::now());
        job.normalize();
        assert!(job.end_time.is_none());

        job.status = JobStatus::Failed;
        job.normalize();
        assert_eq!(job.end_time, Some(job.updated_at));
    }

    #[test]
    fn normalize_truncates_to_millis() {
        let mut job = Job::new("s", "api", "task", "p", JobStatus::Idle);
        job.created_at = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        job.normalize();
        assert_eq!(job.created_at.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn merge_metadata_is_deep() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}})
            .as_object()
            .cloned()
            .unwrap();
        let patch = json!({"b": 2, "nested": {"y": 3}})
            .as_object()
            .cloned()
            .unwrap();
        merge_metadata(&mut target, patch);
        assert_eq!(
            Value::Object(target),
            json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}})
        );
    }

    #[test]
    fn new_job_builder() {
        let req = NewJob::new("s", "openrouter", "implementation_plan", "hello")
            .with_status(JobStatus::Queued)
            .with_priority(3);
        assert_eq!(req.initial_status, JobStatus::Queued);
        assert_eq!(req.metadata.get(PRIORITY_METADATA_KEY), Some(&json!(3)));
    }
}
