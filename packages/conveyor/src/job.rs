//! Job model and payload envelope.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Queue used when the caller does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Retry ceiling applied when the caller does not set one.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Job class a payload without a `jobClass` key is dispatched under.
pub const LEGACY_JOB_CLASS: &str = "LegacyJob";

/// Error marker written by the cancel operation.
pub const CANCELLED_MARKER: &str = "Cancelled";

/// Error marker written by the pause operation.
pub const PAUSED_MARKER: &str = "Paused";

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its `scheduled_for`/`next_run_at` instant; not claimable.
    Scheduled,
    /// Ready to be claimed by a worker.
    #[default]
    Pending,
    /// Claimed by a worker; the worker owns the row until ack/fail.
    Processing,
    /// Terminal success.
    Completed,
    /// Terminal failure. Recurring templates reuse this status with the
    /// `Paused` error marker while paused.
    Failed,
}

impl JobStatus {
    /// Check if the status is terminal (won't change without admin action).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How a failure should be treated by [`fail`](crate::store::JobStore::fail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient failure - retry while attempts remain.
    Retryable,
    /// Permanent failure - go terminal regardless of remaining attempts.
    NonRetryable,
}

impl FailureKind {
    /// Whether this failure kind should trigger a retry.
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

// ============================================================================
// Job record
// ============================================================================

/// A single row in the `jobs` table: one unit of work, or one recurring
/// template that spawns instances.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    /// Opaque serialized `{jobClass, args}` envelope.
    pub payload: String,
    pub status: JobStatus,
    /// Higher runs earlier within a queue.
    pub priority: i64,
    /// Incremented on each claim.
    pub attempts: i64,
    pub max_attempts: i64,
    /// Last failure message, or an admin marker (`Cancelled`, `Paused`).
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when claimed; cleared when the row is returned for retry.
    pub processed_at: Option<DateTime<Utc>>,
    /// Set on the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// One-shot delayed jobs fire at this instant.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Recurring templates are never executed themselves.
    pub is_recurring: bool,
    pub cron_expression: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Spawned instances point back at their recurring template.
    pub parent_job_id: Option<i64>,
}

impl Job {
    /// Check if the row is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the row is a paused recurring template.
    pub fn is_paused(&self) -> bool {
        self.is_recurring
            && self.status == JobStatus::Failed
            && self.error.as_deref() == Some(PAUSED_MARKER)
    }

    /// Parse the stored payload into its envelope.
    pub fn parse_payload(&self) -> JobPayload {
        JobPayload::parse(&self.payload)
    }
}

/// Insert shape for a new row. The store assigns `id`, `created_at`, and
/// starts `attempts` at zero.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub payload: String,
    pub status: JobStatus,
    pub priority: i64,
    pub max_attempts: i64,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub cron_expression: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub parent_job_id: Option<i64>,
}

// ============================================================================
// Payload envelope
// ============================================================================

/// The `{jobClass, args}` envelope serialized into a job row's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub job_class: String,
    #[serde(default)]
    pub args: Value,
}

impl JobPayload {
    pub fn new(job_class: impl Into<String>, args: Value) -> Self {
        Self {
            job_class: job_class.into(),
            args,
        }
    }

    /// Serialize the envelope to the string the store persists.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a stored payload.
    ///
    /// Payloads without a `jobClass` key (or that are not JSON at all) are
    /// accepted as legacy payloads: the whole payload becomes the args of a
    /// synthetic [`LEGACY_JOB_CLASS`] job.
    pub fn parse(raw: &str) -> Self {
        if let Ok(payload) = serde_json::from_str::<JobPayload>(raw) {
            return payload;
        }
        let args = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        Self::new(LEGACY_JOB_CLASS, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job {
            id: 1,
            queue: DEFAULT_QUEUE.to_string(),
            payload: r#"{"jobClass":"SendEmail","args":{"to":"a@b.c"}}"#.to_string(),
            status: JobStatus::Pending,
            priority: 0,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            scheduled_for: None,
            is_recurring: false,
            cron_expression: None,
            next_run_at: None,
            last_run_at: None,
            parent_job_id: None,
        }
    }

    #[test]
    fn pending_is_not_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn completed_and_failed_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn retryable_failure_should_retry() {
        assert!(FailureKind::Retryable.should_retry());
        assert!(!FailureKind::NonRetryable.should_retry());
    }

    #[test]
    fn paused_template_is_detected() {
        let mut job = sample_job();
        job.is_recurring = true;
        job.status = JobStatus::Failed;
        job.error = Some(PAUSED_MARKER.to_string());
        assert!(job.is_paused());
    }

    #[test]
    fn failed_one_shot_is_not_paused() {
        let mut job = sample_job();
        job.status = JobStatus::Failed;
        job.error = Some("boom".to_string());
        assert!(!job.is_paused());
    }

    #[test]
    fn envelope_round_trips_args_exactly() {
        let payload = JobPayload::new("Resize", json!({"width": 640, "height": 480}));
        let encoded = payload.encode().unwrap();
        assert_eq!(JobPayload::parse(&encoded), payload);
    }

    #[test]
    fn payload_without_job_class_is_legacy() {
        let parsed = JobPayload::parse(r#"{"user_id": 42}"#);
        assert_eq!(parsed.job_class, LEGACY_JOB_CLASS);
        assert_eq!(parsed.args, json!({"user_id": 42}));
    }

    #[test]
    fn non_json_payload_is_legacy_string_args() {
        let parsed = JobPayload::parse("not json at all");
        assert_eq!(parsed.job_class, LEGACY_JOB_CLASS);
        assert_eq!(parsed.args, json!("not json at all"));
    }

    #[test]
    fn envelope_uses_camel_case_key() {
        let encoded = JobPayload::new("X", Value::Null).encode().unwrap();
        assert!(encoded.contains("\"jobClass\""));
    }
}
