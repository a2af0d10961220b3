//! Test support: in-memory stores and scripted handlers.
//!
//! Used by the crate's own suites; embedding applications can use the same
//! fixtures to test their handlers without a real database file.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;

use crate::registry::{JobClass, JobRegistry};
use crate::store::SqliteJobStore;

/// A migrated store over an in-memory SQLite database.
///
/// The pool is capped at one connection: every connection to
/// `sqlite::memory:` opens its own database, so a larger pool would split
/// the table across connections.
pub async fn memory_store() -> SqliteJobStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    let store = SqliteJobStore::new(pool);
    store.migrate().await.expect("migrate job store");
    store
}

/// Handler that records every invocation.
pub struct RecordingHandler {
    calls: Mutex<Vec<(i64, Value)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Register this handler under `name`.
    pub fn define(self: &Arc<Self>, registry: &mut JobRegistry, name: &str) -> JobClass {
        let this = self.clone();
        registry.define(name, move |args, ctx| {
            let this = this.clone();
            async move {
                this.calls
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((ctx.job_id, args));
                Ok(())
            }
        })
    }

    /// All `(job_id, args)` invocations so far.
    pub fn calls(&self) -> Vec<(i64, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Handler that fails a scripted number of times, then succeeds.
pub struct FlakyHandler {
    failures_left: AtomicI64,
    calls: AtomicUsize,
}

impl FlakyHandler {
    /// Fail the first `failures` invocations, succeed afterwards. Pass
    /// `i64::MAX` for a handler that always fails.
    pub fn failing_first(failures: i64) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicI64::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    /// Register this handler under `name`.
    pub fn define(self: &Arc<Self>, registry: &mut JobRegistry, name: &str) -> JobClass {
        let this = self.clone();
        registry.define(name, move |_args, _ctx| {
            let this = this.clone();
            async move {
                let call = this.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if this.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                    anyhow::bail!("simulated failure on call {call}");
                }
                Ok(())
            }
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
