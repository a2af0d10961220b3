//! Scheduler tick.
//!
//! One tick runs at the top of each worker poll cycle:
//!
//! ```text
//! tick
//!   ├─► reset_stale           (processing rows past the stale age → pending)
//!   ├─► promote_due_delayed   (scheduled one-shots whose time arrived → pending)
//!   └─► for each due recurring template
//!           ├─► spawn_instance
//!           └─► advance_recurring(now, next fire time)
//! ```
//!
//! A template whose spawn or advance fails is logged and skipped; the tick
//! continues with the next template. Missed ticks do not backfill: however
//! far in the past `next_run_at` is, exactly one instance is spawned and
//! `next_run_at` moves to the next fire time after `now`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::cron;
use crate::error::Result;
use crate::job::Job;
use crate::store::JobStore;

/// Default age after which a processing row is considered stale.
pub const DEFAULT_STALE_AGE: Duration = Duration::from_secs(5 * 60);

/// Counts of what a tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Stale processing rows returned to pending.
    pub stale_reset: u64,
    /// Due one-shot rows promoted to pending.
    pub promoted: u64,
    /// Instances spawned from due recurring templates.
    pub spawned: u64,
}

/// Promotes due work. Shared by every worker polling the store.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    stale_age: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            stale_age: DEFAULT_STALE_AGE,
        }
    }

    pub fn with_stale_age(store: Arc<dyn JobStore>, stale_age: Duration) -> Self {
        Self { store, stale_age }
    }

    /// Run one tick. Store errors propagate to the caller, which applies
    /// DB-error backoff; per-template spawn failures do not abort the tick.
    pub async fn tick(&self) -> Result<TickStats> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(self.stale_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let stale_reset = self.store.reset_stale(stale_cutoff).await?;
        if stale_reset > 0 {
            warn!(count = stale_reset, "reset stale processing jobs");
        }

        let promoted = self.store.promote_due_delayed(now).await?;
        if promoted > 0 {
            debug!(count = promoted, "promoted due delayed jobs");
        }

        let due = self.store.find_due_recurring(now).await?;
        let mut spawned = 0;
        for template in &due {
            match self.spawn_from(template).await {
                Ok(instance_id) => {
                    debug!(
                        template_id = template.id,
                        instance_id, "spawned recurring instance"
                    );
                    spawned += 1;
                }
                Err(e) => {
                    warn!(
                        template_id = template.id,
                        error = %e,
                        "failed to spawn recurring instance; continuing"
                    );
                }
            }
        }

        Ok(TickStats {
            stale_reset,
            promoted,
            spawned,
        })
    }

    async fn spawn_from(&self, template: &Job) -> Result<i64> {
        let expression = template.cron_expression.as_deref().ok_or_else(|| {
            crate::error::Error::InvalidCron("recurring template has no expression".into())
        })?;

        let instance_id = self.store.spawn_instance(template).await?;

        // Advance from now, not from the old next_run_at: a template that
        // missed many ticks catches up with a single instance.
        let now = Utc::now();
        let next_run_at = cron::next_after(expression, now)?;
        self.store
            .advance_recurring(template.id, now, next_run_at)
            .await?;

        Ok(instance_id)
    }
}
