//! Public enqueue API.
//!
//! [`JobQueue`] is the single entry point collaborators use to insert work:
//! immediate jobs, one-shot delayed jobs, and recurring templates. It
//! validates options, decides the initial status, and hands the row to the
//! store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::cron;
use crate::error::{Error, Result};
use crate::job::{JobPayload, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};
use crate::store::JobStore;

/// Options recognized by [`JobQueue::enqueue`].
///
/// If both `cron_expression` and `scheduled_for` are supplied, the cron
/// expression wins and the record is recurring. If neither is set the job is
/// immediate.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueOptions {
    /// Logical partition; workers poll one queue each.
    #[builder(default = DEFAULT_QUEUE.to_string())]
    pub queue: String,

    /// Higher runs earlier within a queue.
    #[builder(default = 0)]
    pub priority: i64,

    /// Retry ceiling; must be at least 1.
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i64,

    /// One-shot delayed execution at this instant.
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Recurring execution driven by a 5-field cron expression.
    #[builder(default, setter(strip_option))]
    pub cron_expression: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EnqueueOptions {
    /// Options for an immediate job on the default queue.
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Options for a one-shot job at `when`.
    pub fn at(when: DateTime<Utc>) -> Self {
        Self::builder().scheduled_for(when).build()
    }

    /// Options for a recurring template firing on `expression`.
    pub fn every(expression: impl Into<String>) -> Self {
        Self::builder().cron_expression(expression.into()).build()
    }
}

/// The public enqueue surface over a [`JobStore`].
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
}

impl JobQueue {
    /// Create a queue over a store.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Get the underlying store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Insert a job whose payload is already serialized.
    ///
    /// The payload is opaque to the queue; the store only sees a string.
    pub async fn enqueue(&self, payload: String, options: EnqueueOptions) -> Result<i64> {
        if options.max_attempts < 1 {
            return Err(Error::InvalidMaxAttempts(options.max_attempts));
        }

        let job = if let Some(expression) = &options.cron_expression {
            // Cron wins over scheduled_for: the record is a recurring
            // template and is never itself executed.
            let next_run_at = cron::next_after(expression, Utc::now())?;
            NewJob {
                queue: options.queue,
                payload,
                status: JobStatus::Scheduled,
                priority: options.priority,
                max_attempts: options.max_attempts,
                scheduled_for: None,
                is_recurring: true,
                cron_expression: Some(expression.clone()),
                next_run_at: Some(next_run_at),
                parent_job_id: None,
            }
        } else if let Some(when) = options.scheduled_for {
            NewJob {
                queue: options.queue,
                payload,
                status: JobStatus::Scheduled,
                priority: options.priority,
                max_attempts: options.max_attempts,
                scheduled_for: Some(when),
                is_recurring: false,
                cron_expression: None,
                next_run_at: None,
                parent_job_id: None,
            }
        } else {
            NewJob {
                queue: options.queue,
                payload,
                status: JobStatus::Pending,
                priority: options.priority,
                max_attempts: options.max_attempts,
                scheduled_for: None,
                is_recurring: false,
                cron_expression: None,
                next_run_at: None,
                parent_job_id: None,
            }
        };

        let id = self.store.insert(job).await?;
        debug!(job_id = id, "enqueued job");
        Ok(id)
    }

    /// Build the `{jobClass, args}` envelope for `job_class` and enqueue it.
    pub async fn enqueue_job(
        &self,
        job_class: &str,
        args: Value,
        options: EnqueueOptions,
    ) -> Result<i64> {
        let payload = JobPayload::new(job_class, args).encode()?;
        self.enqueue(payload, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_target_the_default_queue() {
        let options = EnqueueOptions::default();
        assert_eq!(options.queue, DEFAULT_QUEUE);
        assert_eq!(options.priority, 0);
        assert_eq!(options.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(options.scheduled_for.is_none());
        assert!(options.cron_expression.is_none());
    }

    #[test]
    fn at_sets_scheduled_for() {
        let when = Utc::now();
        let options = EnqueueOptions::at(when);
        assert_eq!(options.scheduled_for, Some(when));
    }

    #[test]
    fn every_sets_cron_expression() {
        let options = EnqueueOptions::every("*/5 * * * *");
        assert_eq!(options.cron_expression.as_deref(), Some("*/5 * * * *"));
    }

    #[test]
    fn builder_accepts_all_options() {
        let options = EnqueueOptions::builder()
            .queue("mail")
            .priority(10)
            .max_attempts(5)
            .build();
        assert_eq!(options.queue, "mail");
        assert_eq!(options.priority, 10);
        assert_eq!(options.max_attempts, 5);
    }
}
