//! Job class registry.
//!
//! The registry maps job class names (e.g. `"SendEmail"`) to the async
//! handlers that execute them. Registration is explicit: nothing is
//! discovered by scanning, so tests can build isolated registries and the
//! set of runnable classes is visible at startup.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = JobRegistry::new();
//! let send_email = registry.define("SendEmail", |args, ctx| async move {
//!     tracing::info!(job_id = ctx.job_id, "sending {}", args["to"]);
//!     Ok(())
//! });
//!
//! // Later, with a queue:
//! send_email.perform_later(&queue, json!({"to": "a@b.c"}), EnqueueOptions::default()).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::queue::{EnqueueOptions, JobQueue};

/// Context passed to every handler invocation.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    /// Id of the job row being executed.
    pub job_id: i64,
}

/// Type alias for the boxed async handler function.
///
/// Handlers receive the job's args and a [`JobContext`]. Returning `Ok`
/// acknowledges the job; returning `Err` records the failure and consumes
/// an attempt.
pub type JobHandler =
    Arc<dyn Fn(Value, JobContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Registry that maps job class names to handlers.
///
/// Definitions happen at startup through `&mut self`; afterwards the
/// registry is shared immutably (usually as [`SharedJobRegistry`]), which is
/// what makes concurrent lookups safe. Re-defining a name replaces the
/// previous handler - the last definition wins.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a job class with its handler.
    ///
    /// Returns a [`JobClass`] handle exposing the enqueue shortcuts for the
    /// class.
    pub fn define<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> JobClass
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let boxed: JobHandler = Arc::new(move |args, ctx| Box::pin(handler(args, ctx)));
        self.handlers.insert(name.clone(), boxed);
        JobClass { name }
    }

    /// Look up the handler for a job class.
    pub fn lookup(&self, name: &str) -> Option<JobHandler> {
        self.handlers.get(name).cloned()
    }

    /// Check if a job class is registered.
    pub fn is_defined(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All registered class names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;

/// Handle for a defined job class.
///
/// Each shortcut builds the `{jobClass, args}` envelope and hands it to the
/// enqueue API.
#[derive(Debug, Clone)]
pub struct JobClass {
    name: String,
}

impl JobClass {
    /// The registered class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue for immediate execution, or as directed by `options`.
    pub async fn perform_later(
        &self,
        queue: &JobQueue,
        args: Value,
        options: EnqueueOptions,
    ) -> crate::error::Result<i64> {
        queue.enqueue_job(&self.name, args, options).await
    }

    /// Enqueue for one-shot execution at `when`.
    pub async fn perform_at(
        &self,
        queue: &JobQueue,
        when: DateTime<Utc>,
        args: Value,
        mut options: EnqueueOptions,
    ) -> crate::error::Result<i64> {
        options.scheduled_for = Some(when);
        queue.enqueue_job(&self.name, args, options).await
    }

    /// Enqueue as a recurring template firing on `expression`.
    pub async fn perform_every(
        &self,
        queue: &JobQueue,
        expression: impl Into<String>,
        args: Value,
        mut options: EnqueueOptions,
    ) -> crate::error::Result<i64> {
        options.cron_expression = Some(expression.into());
        queue.enqueue_job(&self.name, args, options).await
    }
}
