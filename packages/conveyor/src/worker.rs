//! Worker loop for processing queued jobs.
//!
//! The `Worker` is a long-running service that:
//! - Runs a scheduler tick (stale recovery, delayed promotion, recurring spawn)
//! - Claims the next pending job from its queue
//! - Dispatches it to the handler registered for its job class
//! - Acks on success, records the failure otherwise
//!
//! # Architecture
//!
//! ```text
//! Worker
//!     │
//!     ├─► Scheduler.tick()
//!     ├─► store.claim(queue)
//!     ├─► JobPayload::parse → registry.lookup(job_class)
//!     ├─► handler(args, JobContext)
//!     └─► store.ack / store.fail
//! ```
//!
//! Store errors put the loop into backoff: one extra second per consecutive
//! error, capped at 30 seconds, reset on the first success. Errors from the
//! final ack/fail are logged only; stale recovery reconciles the row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{FailureKind, Job};
use crate::registry::{JobContext, SharedJobRegistry};
use crate::scheduler::{Scheduler, DEFAULT_STALE_AGE};
use crate::store::JobStore;

const BACKOFF_STEP: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue this worker polls.
    pub queue: String,
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Age after which a processing row is reclaimed.
    pub stale_age: Duration,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: crate::job::DEFAULT_QUEUE.to_string(),
            poll_interval: Duration::from_secs(1),
            stale_age: DEFAULT_STALE_AGE,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Create a config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// A worker that claims and executes jobs from one queue.
pub struct Worker {
    store: Arc<dyn JobStore>,
    registry: SharedJobRegistry,
    scheduler: Scheduler,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    on_empty: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Worker {
    /// Create a worker with the default configuration.
    pub fn new(store: Arc<dyn JobStore>, registry: SharedJobRegistry) -> Self {
        Self::with_config(store, registry, WorkerConfig::default())
    }

    /// Create a worker with custom configuration.
    pub fn with_config(
        store: Arc<dyn JobStore>,
        registry: SharedJobRegistry,
        config: WorkerConfig,
    ) -> Self {
        let scheduler = Scheduler::with_stale_age(store.clone(), config.stale_age);
        Self {
            store,
            registry,
            scheduler,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            on_empty: None,
        }
    }

    /// Install a callback invoked whenever a poll finds the queue empty.
    pub fn on_empty(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_empty = Some(Arc::new(callback));
        self
    }

    /// Get a shutdown handle for graceful shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Request shutdown of the worker.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run one poll cycle: tick the scheduler, then claim and execute at
    /// most one job. Returns whether a job was processed. Store errors
    /// propagate; the caller decides how to back off.
    pub async fn run_once(&self) -> Result<bool> {
        self.scheduler.tick().await?;

        let Some(job) = self.store.claim(&self.config.queue).await? else {
            if let Some(callback) = &self.on_empty {
                callback();
            }
            return Ok(false);
        };

        self.dispatch(job).await;
        Ok(true)
    }

    /// Run until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker starting"
        );

        let mut backoff = Duration::ZERO;
        loop {
            if self.is_shutdown_requested() {
                break;
            }

            match self.run_once().await {
                Ok(true) => {
                    backoff = Duration::ZERO;
                }
                Ok(false) => {
                    backoff = Duration::ZERO;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    backoff = std::cmp::min(backoff + BACKOFF_STEP, BACKOFF_CAP);
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "store error in worker loop"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Run until a Ctrl+C shutdown signal is received.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown_handle();

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.run().await
    }

    /// Execute one claimed job and record the outcome.
    async fn dispatch(&self, job: Job) {
        let job_id = job.id;
        let payload = job.parse_payload();

        let Some(handler) = self.registry.lookup(&payload.job_class) else {
            // An unknown class can never succeed on retry; fail terminally.
            let message = format!(
                "Unknown job class: {}. Registered: {}",
                payload.job_class,
                self.registry.names().join(", ")
            );
            warn!(job_id, job_class = %payload.job_class, "unknown job class");
            if let Err(e) = self
                .store
                .fail(job_id, &message, FailureKind::NonRetryable)
                .await
            {
                error!(job_id, error = %e, "failed to mark job as failed");
            }
            return;
        };

        debug!(job_id, job_class = %payload.job_class, attempt = job.attempts, "executing job");

        let context = JobContext { job_id };
        match handler(payload.args, context).await {
            Ok(()) => {
                debug!(job_id, job_class = %payload.job_class, "job succeeded");
                if let Err(e) = self.store.ack(job_id).await {
                    error!(job_id, error = %e, "failed to mark job as completed");
                }
            }
            Err(e) => {
                warn!(job_id, job_class = %payload.job_class, error = %e, "job failed");
                if let Err(mark_err) = self
                    .store
                    .fail(job_id, &e.to_string(), FailureKind::Retryable)
                    .await
                {
                    error!(job_id, error = %mark_err, "failed to mark job as failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue, "default");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.stale_age, Duration::from_secs(300));
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = WorkerConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
    }
}
