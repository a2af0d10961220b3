//! Persistent job queue and scheduler with a Sidekiq-like API.
//!
//! Client code declares named job classes with typed argument shapes; the
//! runtime stores jobs in a relational store, hands them to workers, retries
//! on failure, and supports one-time delayed execution and cron-driven
//! recurring execution.
//!
//! - [`JobQueue`] - enqueue immediate, delayed, and recurring jobs
//! - [`JobRegistry`] - map job class names to async handlers
//! - [`Worker`] - poll, claim, dispatch, ack/fail one job at a time
//! - [`Scheduler`] - promote due delayed jobs, spawn recurring instances
//! - [`SqliteJobStore`] - durable rows with an atomic claim
//!
//! # Architecture
//!
//! ```text
//! clients ──► JobQueue.enqueue ──► store
//!
//! Worker (× N, no coordination beyond the store)
//!     │
//!     ├─► Scheduler.tick    (stale recovery, delayed promotion, recurring spawn)
//!     ├─► store.claim       (atomic pending → processing)
//!     ├─► JobRegistry.lookup(job_class)
//!     ├─► handler(args, JobContext)
//!     └─► store.ack / store.fail
//! ```
//!
//! Delivery is at-least-once; handlers are expected to be idempotent.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(SqliteJobStore::new(pool));
//! store.migrate().await?;
//!
//! let mut registry = JobRegistry::new();
//! let send_email = registry.define("SendEmail", |args, ctx| async move {
//!     mailer::deliver(&args).await
//! });
//!
//! let queue = JobQueue::new(store.clone());
//! send_email.perform_later(&queue, json!({"to": "a@b.c"}), EnqueueOptions::default()).await?;
//!
//! Worker::new(store, Arc::new(registry)).run_until_shutdown().await?;
//! ```

pub mod cron;
mod error;
mod job;
mod queue;
mod registry;
mod scheduler;
mod store;
pub mod testing;
mod worker;

pub use error::{Error, Result};
pub use job::{
    FailureKind, Job, JobPayload, JobStatus, NewJob, CANCELLED_MARKER, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_QUEUE, LEGACY_JOB_CLASS, PAUSED_MARKER,
};
pub use queue::{EnqueueOptions, JobQueue};
pub use registry::{JobClass, JobContext, JobHandler, JobRegistry, SharedJobRegistry};
pub use scheduler::{Scheduler, TickStats, DEFAULT_STALE_AGE};
pub use store::{JobStore, QueueStats, SqliteJobStore, MAX_PAYLOAD_BYTES};
pub use worker::{Worker, WorkerConfig};
