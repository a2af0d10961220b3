//! SQLite-backed job store.
//!
//! The store owns every job row. It provides the atomic claim, the
//! retry-aware failure transition, the due-row queries the scheduler runs,
//! and the admin transitions (cancel/pause/resume/reset-stale/cleanup).
//!
//! # Claim atomicity
//!
//! Claiming is a single conditional `UPDATE ... WHERE id = (SELECT ...) AND
//! status = 'pending' ... RETURNING *`. SQLite serializes writers, so two
//! concurrent claimers get disjoint rows or one gets nothing; there is no
//! window in which both observe the same row as pending.
//!
//! # Contention
//!
//! Operations that hit SQLite contention ("database is locked"/"busy") or
//! pool exhaustion are retried with exponential backoff (base 100 ms,
//! cap 2 s, jitter up to 50 ms) before the error is surfaced.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::cron;
use crate::error::{Error, Result};
use crate::job::{FailureKind, Job, JobStatus, NewJob, CANCELLED_MARKER, PAUSED_MARKER};

/// Upper bound on the serialized payload accepted by [`JobStore::insert`].
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(2);
const RETRY_JITTER_MS: u64 = 50;

fn retry_jitter() -> Duration {
    Duration::from_millis(fastrand::u64(..=RETRY_JITTER_MS))
}

/// Retry `$call` on transient store errors with exponential backoff.
macro_rules! with_retry {
    ($op:expr, $call:expr) => {{
        let mut delay = RETRY_BASE;
        let mut attempt: u32 = 1;
        loop {
            match $call {
                Ok(value) => break Ok(value),
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    warn!(op = $op, attempt, error = %e, "transient store error, retrying");
                    tokio::time::sleep(delay + retry_jitter()).await;
                    delay = std::cmp::min(delay * 2, RETRY_CAP);
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

/// Trait for the durable job store.
///
/// All timestamps and cutoffs are passed in by the caller, which keeps the
/// operations deterministic under test.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row and return its assigned id.
    async fn insert(&self, job: NewJob) -> Result<i64>;

    /// Atomically claim the next pending row in `queue`.
    ///
    /// The claimed row is moved to `processing`, `processed_at` is set, and
    /// `attempts` is incremented. Rows are ordered by priority (descending)
    /// then insertion order.
    async fn claim(&self, queue: &str) -> Result<Option<Job>>;

    /// Transition a processing row to terminal `completed`.
    async fn ack(&self, id: i64) -> Result<()>;

    /// Record a failure for a processing row.
    ///
    /// Retryable failures return the row to `pending` while attempts remain;
    /// otherwise the row goes to terminal `failed` with `completed_at` set.
    async fn fail(&self, id: i64, error: &str, kind: FailureKind) -> Result<()>;

    /// Promote due one-shot delayed rows to `pending`. Returns the count.
    async fn promote_due_delayed(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Recurring templates whose `next_run_at` has arrived, in id order.
    async fn find_due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Insert a pending instance row copying the template's payload, queue,
    /// priority, and retry ceiling. Returns the instance id.
    async fn spawn_instance(&self, parent: &Job) -> Result<i64>;

    /// Record a spawn on a template: `last_run_at = now`,
    /// `next_run_at = next_run_at`.
    async fn advance_recurring(
        &self,
        id: i64,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Return processing rows claimed before `older_than` to `pending`.
    /// Attempts are not decremented. Returns the count.
    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Delete terminal rows completed before `older_than`. Recurring
    /// templates are never deleted here. Returns the count.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Cancel a `scheduled` or `pending` row: terminal `failed` with the
    /// `Cancelled` marker.
    async fn cancel(&self, id: i64) -> Result<()>;

    /// Pause a recurring template.
    async fn pause(&self, id: i64) -> Result<()>;

    /// Resume a paused recurring template, recomputing `next_run_at` from
    /// its cron expression.
    async fn resume(&self, id: i64) -> Result<()>;

    /// Delete a recurring template.
    async fn delete_recurring(&self, id: i64) -> Result<()>;

    /// Fetch a row by id.
    async fn find_by_id(&self, id: i64) -> Result<Job>;
}

/// SQLite implementation of [`JobStore`].
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a store over an existing pool. Call [`migrate`](Self::migrate)
    /// before first use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the jobs table and its indices.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                queue           TEXT    NOT NULL DEFAULT 'default',
                payload         TEXT    NOT NULL,
                status          TEXT    NOT NULL DEFAULT 'pending',
                priority        INTEGER NOT NULL DEFAULT 0,
                attempts        INTEGER NOT NULL DEFAULT 0,
                max_attempts    INTEGER NOT NULL DEFAULT 3,
                error           TEXT,
                created_at      TEXT    NOT NULL,
                processed_at    TEXT,
                completed_at    TEXT,
                scheduled_for   TEXT,
                is_recurring    INTEGER NOT NULL DEFAULT 0,
                cron_expression TEXT,
                next_run_at     TEXT,
                last_run_at     TEXT,
                parent_job_id   INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indices = [
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (queue, status, priority, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (status, scheduled_for)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_recurring ON jobs (is_recurring, status, next_run_at)",
        ];
        for statement in indices {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Row counts per status.
    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'scheduled')  AS scheduled,
                COUNT(*) FILTER (WHERE status = 'pending')    AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed')  AS completed,
                COUNT(*) FILTER (WHERE status = 'failed')     AS failed
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            scheduled: row.get("scheduled"),
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }

    async fn try_insert(&self, job: &NewJob) -> Result<i64> {
        if job.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::PayloadTooLarge {
                size: job.payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO jobs (
                queue, payload, status, priority, attempts, max_attempts,
                created_at, scheduled_for, is_recurring, cron_expression,
                next_run_at, parent_job_id
            )
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            RETURNING id
            "#,
        )
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(Utc::now())
        .bind(job.scheduled_for)
        .bind(job.is_recurring)
        .bind(&job.cron_expression)
        .bind(job.next_run_at)
        .bind(job.parent_job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn try_claim(&self, queue: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = ?1,
                processed_at = ?2,
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?3
                  AND status = ?4
                  AND attempts < max_attempts
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            AND status = ?4
            RETURNING *
            "#,
        )
        .bind(JobStatus::Processing)
        .bind(Utc::now())
        .bind(queue)
        .bind(JobStatus::Pending)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn try_ack(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?1, completed_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(JobStatus::Completed)
        .bind(Utc::now())
        .bind(id)
        .bind(JobStatus::Processing)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(job_id = id, "ack skipped; row is no longer processing");
        }
        Ok(())
    }

    async fn try_fail(&self, id: i64, error: &str, kind: FailureKind) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound(id))?;

        if job.status != JobStatus::Processing {
            warn!(job_id = id, status = %job.status, "fail skipped; row is no longer processing");
            return Ok(());
        }

        if kind.should_retry() && job.attempts < job.max_attempts {
            sqlx::query(
                "UPDATE jobs SET status = ?1, processed_at = NULL, error = ?2 WHERE id = ?3",
            )
            .bind(JobStatus::Pending)
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4",
            )
            .bind(JobStatus::Failed)
            .bind(Utc::now())
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn try_promote_due_delayed(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1
            WHERE status = ?2
              AND is_recurring = 0
              AND scheduled_for IS NOT NULL
              AND scheduled_for <= ?3
            "#,
        )
        .bind(JobStatus::Pending)
        .bind(JobStatus::Scheduled)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn try_find_due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE is_recurring = 1
              AND status = ?1
              AND next_run_at IS NOT NULL
              AND next_run_at <= ?2
            ORDER BY id ASC
            "#,
        )
        .bind(JobStatus::Scheduled)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn try_spawn_instance(&self, parent: &Job) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO jobs (
                queue, payload, status, priority, attempts, max_attempts,
                created_at, is_recurring, parent_job_id
            )
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, 0, ?7)
            RETURNING id
            "#,
        )
        .bind(&parent.queue)
        .bind(&parent.payload)
        .bind(JobStatus::Pending)
        .bind(parent.priority)
        .bind(parent.max_attempts)
        .bind(Utc::now())
        .bind(parent.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn try_advance_recurring(
        &self,
        id: i64,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3 AND is_recurring = 1",
        )
        .bind(now)
        .bind(next_run_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1, processed_at = NULL
            WHERE status = ?2
              AND processed_at IS NOT NULL
              AND processed_at < ?3
            "#,
        )
        .bind(JobStatus::Pending)
        .bind(JobStatus::Processing)
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn try_cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN (?1, ?2)
              AND is_recurring = 0
              AND completed_at IS NOT NULL
              AND completed_at < ?3
            "#,
        )
        .bind(JobStatus::Completed)
        .bind(JobStatus::Failed)
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn try_cancel(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound(id))?;

        if !matches!(job.status, JobStatus::Scheduled | JobStatus::Pending) {
            return Err(Error::InvalidTransition {
                op: "cancel",
                id,
                status: job.status,
            });
        }

        sqlx::query(
            "UPDATE jobs SET status = ?1, error = ?2, completed_at = ?3 WHERE id = ?4",
        )
        .bind(JobStatus::Failed)
        .bind(CANCELLED_MARKER)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn try_pause(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound(id))?;

        if !job.is_recurring {
            return Err(Error::InvalidTransition {
                op: "pause",
                id,
                status: job.status,
            });
        }

        sqlx::query("UPDATE jobs SET status = ?1, error = ?2 WHERE id = ?3")
            .bind(JobStatus::Failed)
            .bind(PAUSED_MARKER)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn try_resume(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound(id))?;

        if !job.is_paused() {
            return Err(Error::InvalidTransition {
                op: "resume",
                id,
                status: job.status,
            });
        }

        let expression = job
            .cron_expression
            .as_deref()
            .ok_or_else(|| Error::InvalidCron("recurring template has no expression".into()))?;
        let next_run_at = cron::next_after(expression, Utc::now())?;

        sqlx::query(
            "UPDATE jobs SET status = ?1, error = NULL, next_run_at = ?2 WHERE id = ?3",
        )
        .bind(JobStatus::Scheduled)
        .bind(next_run_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn try_delete_recurring(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound(id))?;

        if !job.is_recurring {
            return Err(Error::InvalidTransition {
                op: "delete",
                id,
                status: job.status,
            });
        }

        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn try_find_by_id(&self, id: i64) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound(id))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: NewJob) -> Result<i64> {
        with_retry!("insert", self.try_insert(&job).await)
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>> {
        with_retry!("claim", self.try_claim(queue).await)
    }

    async fn ack(&self, id: i64) -> Result<()> {
        with_retry!("ack", self.try_ack(id).await)
    }

    async fn fail(&self, id: i64, error: &str, kind: FailureKind) -> Result<()> {
        with_retry!("fail", self.try_fail(id, error, kind).await)
    }

    async fn promote_due_delayed(&self, now: DateTime<Utc>) -> Result<u64> {
        with_retry!("promote_due_delayed", self.try_promote_due_delayed(now).await)
    }

    async fn find_due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        with_retry!("find_due_recurring", self.try_find_due_recurring(now).await)
    }

    async fn spawn_instance(&self, parent: &Job) -> Result<i64> {
        with_retry!("spawn_instance", self.try_spawn_instance(parent).await)
    }

    async fn advance_recurring(
        &self,
        id: i64,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        with_retry!(
            "advance_recurring",
            self.try_advance_recurring(id, now, next_run_at).await
        )
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        with_retry!("reset_stale", self.try_reset_stale(older_than).await)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        with_retry!("cleanup", self.try_cleanup(older_than).await)
    }

    async fn cancel(&self, id: i64) -> Result<()> {
        with_retry!("cancel", self.try_cancel(id).await)
    }

    async fn pause(&self, id: i64) -> Result<()> {
        with_retry!("pause", self.try_pause(id).await)
    }

    async fn resume(&self, id: i64) -> Result<()> {
        with_retry!("resume", self.try_resume(id).await)
    }

    async fn delete_recurring(&self, id: i64) -> Result<()> {
        with_retry!("delete_recurring", self.try_delete_recurring(id).await)
    }

    async fn find_by_id(&self, id: i64) -> Result<Job> {
        with_retry!("find_by_id", self.try_find_by_id(id).await)
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub scheduled: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}
