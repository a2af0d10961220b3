//! Integration tests for the scheduler tick: delayed promotion, recurring
//! spawn, catch-up semantics, and stale recovery.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use conveyor::testing::memory_store;
use conveyor::{
    EnqueueOptions, JobQueue, JobStatus, JobStore, Scheduler, SqliteJobStore, DEFAULT_QUEUE,
};

async fn setup() -> (Arc<SqliteJobStore>, JobQueue, Scheduler) {
    let store = Arc::new(memory_store().await);
    let queue = JobQueue::new(store.clone());
    let scheduler = Scheduler::new(store.clone());
    (store, queue, scheduler)
}

async fn force_next_run_at(store: &SqliteJobStore, id: i64, at: DateTime<Utc>) {
    sqlx::query("UPDATE jobs SET next_run_at = ?1 WHERE id = ?2")
        .bind(at)
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();
}

async fn child_ids(store: &SqliteJobStore, parent_id: i64) -> Vec<i64> {
    sqlx::query_scalar("SELECT id FROM jobs WHERE parent_job_id = ?1 ORDER BY id")
        .bind(parent_id)
        .fetch_all(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn tick_with_nothing_due_promotes_nothing() {
    let (store, queue, scheduler) = setup().await;
    queue
        .enqueue_job(
            "TestJob",
            json!({}),
            EnqueueOptions::at(Utc::now() + Duration::hours(1)),
        )
        .await
        .unwrap();

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.promoted, 0);
    assert_eq!(stats.spawned, 0);
    assert_eq!(store.stats().await.unwrap().scheduled, 1);
}

#[tokio::test]
async fn promote_due_delayed_is_idempotent_when_nothing_is_due() {
    let (store, _queue, _scheduler) = setup().await;
    assert_eq!(store.promote_due_delayed(Utc::now()).await.unwrap(), 0);
    assert_eq!(store.promote_due_delayed(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn due_delayed_job_is_promoted_to_pending() {
    let (store, queue, scheduler) = setup().await;
    let id = queue
        .enqueue_job(
            "TestJob",
            json!({}),
            EnqueueOptions::at(Utc::now() - Duration::seconds(1)),
        )
        .await
        .unwrap();
    assert_eq!(store.find_by_id(id).await.unwrap().status, JobStatus::Scheduled);

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.promoted, 1);
    assert_eq!(store.find_by_id(id).await.unwrap().status, JobStatus::Pending);
    assert!(store.claim(DEFAULT_QUEUE).await.unwrap().is_some());
}

#[tokio::test]
async fn future_delayed_job_stays_scheduled() {
    let (store, queue, scheduler) = setup().await;
    let id = queue
        .enqueue_job(
            "TestJob",
            json!({}),
            EnqueueOptions::at(Utc::now() + Duration::hours(1)),
        )
        .await
        .unwrap();

    scheduler.tick().await.unwrap();

    assert_eq!(store.find_by_id(id).await.unwrap().status, JobStatus::Scheduled);
    assert!(store.claim(DEFAULT_QUEUE).await.unwrap().is_none());
}

#[tokio::test]
async fn due_template_spawns_exactly_one_instance() {
    let (store, queue, scheduler) = setup().await;
    let id = queue
        .enqueue_job(
            "Report",
            json!({"kind": "daily"}),
            EnqueueOptions::builder()
                .priority(5)
                .max_attempts(7i64)
                .cron_expression("*/1 * * * *".to_string())
                .build(),
        )
        .await
        .unwrap();
    force_next_run_at(&store, id, Utc::now() - Duration::minutes(1)).await;

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.spawned, 1);

    let children = child_ids(&store, id).await;
    assert_eq!(children.len(), 1);

    let child = store.find_by_id(children[0]).await.unwrap();
    assert_eq!(child.status, JobStatus::Pending);
    assert!(!child.is_recurring);
    assert_eq!(child.parent_job_id, Some(id));
    assert_eq!(child.priority, 5);
    assert_eq!(child.max_attempts, 7);
    assert_eq!(child.payload, store.find_by_id(id).await.unwrap().payload);

    let parent = store.find_by_id(id).await.unwrap();
    assert_eq!(parent.status, JobStatus::Scheduled);
    assert!(parent.is_recurring);
    assert!(parent.last_run_at.is_some());
    assert!(parent.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn template_far_in_the_past_catches_up_with_one_instance() {
    let (store, queue, scheduler) = setup().await;
    let id = queue
        .enqueue_job("Report", json!({}), EnqueueOptions::every("*/1 * * * *"))
        .await
        .unwrap();
    force_next_run_at(&store, id, Utc::now() - Duration::hours(6)).await;

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.spawned, 1);
    assert_eq!(child_ids(&store, id).await.len(), 1);

    let parent = store.find_by_id(id).await.unwrap();
    assert!(parent.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn advanced_template_does_not_spawn_again_until_due() {
    let (store, queue, scheduler) = setup().await;
    let id = queue
        .enqueue_job("Report", json!({}), EnqueueOptions::every("*/1 * * * *"))
        .await
        .unwrap();
    force_next_run_at(&store, id, Utc::now() - Duration::minutes(1)).await;

    scheduler.tick().await.unwrap();
    let stats = scheduler.tick().await.unwrap();

    assert_eq!(stats.spawned, 0);
    assert_eq!(child_ids(&store, id).await.len(), 1);
}

#[tokio::test]
async fn paused_template_is_skipped_by_the_tick() {
    let (store, queue, scheduler) = setup().await;
    let id = queue
        .enqueue_job("Report", json!({}), EnqueueOptions::every("*/1 * * * *"))
        .await
        .unwrap();
    store.pause(id).await.unwrap();
    force_next_run_at(&store, id, Utc::now() - Duration::minutes(5)).await;

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.spawned, 0);
    assert!(child_ids(&store, id).await.is_empty());
}

#[tokio::test]
async fn pausing_a_template_does_not_affect_a_pending_instance() {
    let (store, queue, scheduler) = setup().await;
    let id = queue
        .enqueue_job("Report", json!({}), EnqueueOptions::every("*/1 * * * *"))
        .await
        .unwrap();
    force_next_run_at(&store, id, Utc::now() - Duration::minutes(1)).await;
    scheduler.tick().await.unwrap();

    store.pause(id).await.unwrap();

    let claimed = store.claim(DEFAULT_QUEUE).await.unwrap().unwrap();
    assert_eq!(claimed.parent_job_id, Some(id));
    assert_eq!(claimed.status, JobStatus::Processing);
}

#[tokio::test]
async fn broken_template_does_not_abort_the_tick() {
    let (store, queue, scheduler) = setup().await;

    // A template with an unparseable expression can only exist through
    // manual edits, but the tick must survive it.
    sqlx::query(
        r#"
        INSERT INTO jobs (queue, payload, status, priority, attempts, max_attempts,
                          created_at, is_recurring, cron_expression, next_run_at)
        VALUES ('default', '{}', 'scheduled', 0, 0, 3, ?1, 1, 'not a cron', ?2)
        "#,
    )
    .bind(Utc::now())
    .bind(Utc::now() - Duration::minutes(1))
    .execute(store.pool())
    .await
    .unwrap();

    let good = queue
        .enqueue_job("Report", json!({}), EnqueueOptions::every("*/1 * * * *"))
        .await
        .unwrap();
    force_next_run_at(&store, good, Utc::now() - Duration::minutes(1)).await;

    let stats = scheduler.tick().await.unwrap();
    assert_eq!(stats.spawned, 1);
    assert_eq!(child_ids(&store, good).await.len(), 1);
}

#[tokio::test]
async fn tick_recovers_stale_processing_rows() {
    let (store, queue, _scheduler) = setup().await;
    let id = queue
        .enqueue_job("TestJob", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    store.claim(DEFAULT_QUEUE).await.unwrap().unwrap();

    // Zero stale age: anything processing is already stale.
    let scheduler = Scheduler::with_stale_age(store.clone(), StdDuration::ZERO);
    let stats = scheduler.tick().await.unwrap();

    assert_eq!(stats.stale_reset, 1);
    let job = store.find_by_id(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
}
