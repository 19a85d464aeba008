//! Behaviour every durable driver must share, run against real backends by
//! `tests/postgres.rs` and `tests/redis.rs`.

#![allow(dead_code)]

use claims::{assert_none, assert_ok, assert_some};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use workforce::clock::ManualClock;
use workforce::store::{
    BatchCallback, DistributedLock, Driver, FailedJobQuery, FailedJobStore, JobStore, Released,
};
use workforce::{NewJob, QueueManager};

pub struct Fixture {
    pub manager: QueueManager,
    pub driver: Arc<dyn Driver>,
    pub clock: ManualClock,
}

impl Fixture {
    pub fn new(driver: Arc<dyn Driver>, clock: ManualClock) -> Self {
        let manager = QueueManager::builder()
            .shared_connection(driver.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        Self {
            manager,
            driver,
            clock,
        }
    }
}

pub async fn concurrent_reservers_get_each_job_once(f: Fixture) -> anyhow::Result<()> {
    let jobs = (0..50).map(|i| NewJob::new("test", json!(i))).collect();
    let ids = f.manager.bulk(jobs, None).await?;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let driver = f.driver.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(job) = driver.reserve("default").await? {
                    seen.push(job.id);
                }
                anyhow::Ok(seen)
            })
        })
        .collect();

    let mut reserved = Vec::new();
    for handle in handles {
        reserved.extend(handle.await??);
    }

    assert_eq!(reserved.len(), 50);
    let unique: HashSet<_> = reserved.into_iter().collect();
    assert_eq!(unique, ids.into_iter().collect::<HashSet<_>>());
    Ok(())
}

pub async fn reserves_by_priority_then_age(f: Fixture) -> anyhow::Result<()> {
    for priority in [1, 5, 3] {
        f.manager
            .dispatch(NewJob::new("test", json!(priority)).priority(priority))
            .await?;
        f.clock.advance(Duration::from_millis(5));
    }
    let late = f.manager.dispatch(NewJob::new("test", json!("late")).priority(3)).await?;

    let mut order = Vec::new();
    while let Some(job) = f.driver.reserve("default").await? {
        order.push((job.priority, job.id));
    }
    let priorities: Vec<_> = order.iter().map(|(priority, _)| *priority).collect();
    assert_eq!(priorities, vec![5, 3, 3, 1]);
    assert_eq!(order[2].1, late);
    Ok(())
}

pub async fn delayed_jobs_become_visible_on_time(f: Fixture) -> anyhow::Result<()> {
    f.manager
        .later(Duration::from_secs(60), "test", json!(null), None, None)
        .await?;

    assert_none!(f.driver.reserve("default").await?);
    assert_eq!(f.driver.stats("default").await?.delayed, 1);

    f.clock.advance(Duration::from_secs(59));
    assert_none!(f.driver.reserve("default").await?);
    f.clock.advance(Duration::from_secs(1));
    let job = assert_some!(f.driver.reserve("default").await?);
    assert_eq!(job.attempts, 1);
    Ok(())
}

pub async fn expired_reservations_are_recovered(f: Fixture, retry_after: Duration) -> anyhow::Result<()> {
    let id = f.manager.push("test", json!(null), None, None).await?;

    assert_some!(f.driver.reserve("default").await?);
    assert_none!(f.driver.reserve("default").await?);
    assert_eq!(f.driver.stats("default").await?.reserved, 1);

    f.clock.advance(retry_after + Duration::from_secs(1));
    let again = assert_some!(f.driver.reserve("default").await?);
    assert_eq!(again.id, id);
    assert_eq!(again.attempts, 2);

    assert!(assert_ok!(f.driver.acknowledge(&id).await));
    assert_eq!(f.driver.stats("default").await?.total, 0);
    Ok(())
}

pub async fn lapsed_reservations_cannot_be_settled(
    f: Fixture,
    retry_after: Duration,
) -> anyhow::Result<()> {
    f.manager
        .dispatch(NewJob::new("test", json!(null)).max_attempts(1))
        .await?;

    let stale = assert_some!(f.driver.reserve("default").await?);
    f.clock.advance(retry_after + Duration::from_secs(1));
    let current = assert_some!(f.driver.reserve("default").await?);
    assert_eq!(current.attempts, 2);

    // Out of attempts, but the stale holder must not fail or requeue it.
    assert_none!(f.driver.release(&stale, Duration::ZERO, "late").await?);
    assert!(!f.driver.fail(&stale, "late").await?);
    assert_eq!(f.driver.stats("default").await?.reserved, 1);
    assert!(f.driver.failed_jobs(&FailedJobQuery::default()).await?.is_empty());

    assert!(f.driver.acknowledge(&current.id).await?);
    assert!(!f.driver.acknowledge(&stale.id).await?);
    assert_eq!(f.driver.stats("default").await?.total, 0);
    Ok(())
}

pub async fn release_requeues_then_fails(f: Fixture) -> anyhow::Result<()> {
    let id = f
        .manager
        .dispatch(NewJob::new("test", json!({"n": 1})).max_attempts(2))
        .await?;

    let job = assert_some!(f.driver.reserve("default").await?);
    assert_eq!(job.id, id);
    let released = f.driver.release(&job, Duration::from_secs(10), "boom").await?;
    assert!(matches!(released, Some(Released::Requeued(_))));
    assert_none!(f.driver.reserve("default").await?);
    assert_eq!(f.driver.stats("default").await?.delayed, 1);

    f.clock.advance(Duration::from_secs(10));
    let job = assert_some!(f.driver.reserve("default").await?);
    assert_eq!(job.attempts, 2);
    let released = f.driver.release(&job, Duration::ZERO, "boom again").await?;
    assert_eq!(released, Some(Released::Failed));

    assert_eq!(f.driver.stats("default").await?.total, 0);
    let failed = f.driver.failed_jobs(&FailedJobQuery::default()).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error, "boom again");
    assert_eq!(failed[0].job.payload, json!({"n": 1}));
    assert_eq!(failed[0].connection, f.manager.default_connection());
    Ok(())
}

pub async fn bulk_matches_sequential_order(f: Fixture) -> anyhow::Result<()> {
    let jobs = (0..5).map(|i| NewJob::new("test", json!(i))).collect();
    let ids = f.manager.bulk(jobs, None).await?;

    let mut reserved = Vec::new();
    while let Some(job) = f.driver.reserve("default").await? {
        reserved.push(job.id);
    }
    assert_eq!(reserved, ids);
    Ok(())
}

pub async fn failed_jobs_are_retried_forgotten_and_pruned(f: Fixture) -> anyhow::Result<()> {
    for name in ["first", "second", "third"] {
        f.manager
            .dispatch(NewJob::new(name, json!(null)).max_attempts(1))
            .await?;
        let job = assert_some!(f.driver.reserve("default").await?);
        assert!(f.driver.fail(&job, name).await?);
        f.clock.advance(Duration::from_secs(3600));
    }

    let failed = f.manager.failed_jobs(&FailedJobQuery::default(), None).await?;
    let errors: Vec<_> = failed.iter().map(|record| record.error.as_str()).collect();
    assert_eq!(errors, vec!["third", "second", "first"]);

    let limited = FailedJobQuery {
        queue: Some("default".into()),
        limit: Some(1),
    };
    assert_eq!(f.manager.failed_jobs(&limited, None).await?.len(), 1);

    let retried = assert_some!(f.manager.retry_failed(&failed[0].id, None).await?);
    let job = assert_some!(f.driver.reserve("default").await?);
    assert_eq!(job.id, retried);
    assert_eq!(job.attempts, 1);

    assert!(f.manager.forget_failed(&failed[1].id, None).await?);
    assert!(!f.manager.forget_failed(&failed[1].id, None).await?);

    // "first" failed three hours ago.
    let pruned = f
        .manager
        .prune_failed(Duration::from_secs(2 * 3600 + 60), None)
        .await?;
    assert_eq!(pruned, 1);
    assert!(f.manager.failed_jobs(&FailedJobQuery::default(), None).await?.is_empty());
    Ok(())
}

pub async fn batch_callback_is_dispatched_once(f: Fixture) -> anyhow::Result<()> {
    let jobs = (0..3).map(|i| NewJob::new("part", json!(i))).collect();
    let then = BatchCallback {
        handler: "done".into(),
        payload: json!({"notify": "ops"}),
        queue: Some("callbacks".into()),
    };
    let batch = f
        .manager
        .dispatch_batch(Some("nightly".into()), jobs, Some(then), None)
        .await?;

    let tracker = f.manager.batches(None)?;
    let mut finished = Vec::new();
    while let Some(job) = f.driver.reserve("default").await? {
        assert_eq!(job.batch_id.as_deref(), Some(batch.id.as_str()));
        let success = job.payload != json!(1);
        if success {
            assert!(f.driver.acknowledge(&job.id).await?);
        } else {
            assert!(f.driver.fail(&job, "part failed").await?);
        }
        finished.push(tracker.record_outcome(&batch.id, success).await?);
    }

    assert_eq!(finished.iter().filter(|batch| batch.is_some()).count(), 1);
    assert_some!(finished.last().cloned().flatten());

    let callback = assert_some!(f.driver.reserve("callbacks").await?);
    assert_eq!(callback.handler, "done");
    assert_eq!(callback.payload["data"], json!({"notify": "ops"}));
    assert_eq!(callback.payload["batch"]["failed_jobs"], json!(1));
    assert_none!(f.driver.reserve("callbacks").await?);

    let stored = assert_some!(f.manager.batch(&batch.id, None).await?);
    assert_eq!((stored.completed_jobs, stored.failed_jobs), (2, 1));
    assert!(stored.is_finished());
    Ok(())
}

pub async fn locks_are_exclusive(f: Fixture) -> anyhow::Result<()> {
    let lock = f.manager.lock(None)?;
    let lease = assert_some!(lock.acquire("workforce:test", Duration::from_secs(30)).await?);
    assert_none!(lock.acquire("workforce:test", Duration::from_secs(30)).await?);
    assert_some!(lock.acquire("workforce:other", Duration::from_secs(30)).await?);

    assert!(lock.release(&lease).await?);
    assert!(!lock.release(&lease).await?);
    assert_some!(lock.acquire("workforce:test", Duration::from_secs(30)).await?);
    Ok(())
}

pub async fn health_and_stats(f: Fixture) -> anyhow::Result<()> {
    let report = f.manager.test_connection(None).await?;
    assert!(report.healthy, "{}", report.message);

    f.manager.push("test", json!(null), Some("mail"), None).await?;
    f.manager.push("test", json!(null), Some("mail"), None).await?;
    f.manager.push("test", json!(null), None, None).await?;
    assert_some!(f.driver.reserve("mail").await?);

    f.clock.advance(Duration::from_secs(4));
    let mail = f.manager.stats(Some("mail"), None).await?;
    assert_eq!((mail.pending, mail.reserved, mail.total), (1, 1, 2));
    assert!((mail.avg_wait_secs - 4.0).abs() < 0.5);

    let all = f.manager.stats(None, None).await?;
    assert_eq!((all.pending, all.reserved, all.total), (2, 1, 3));

    let mut queues = f.driver.queues().await?;
    queues.sort();
    assert_eq!(queues, vec!["default".to_string(), "mail".to_string()]);
    Ok(())
}
