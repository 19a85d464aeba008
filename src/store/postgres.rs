//! Relational driver over Postgres.
//!
//! Reservation is a single `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP
//! LOCKED)`: the subquery locks the row it picks, so concurrent reservers
//! skip it and move on to the next visible row.
//!
//! A reservation is identified by its `reserved_until`. Release and fail only
//! touch a row that still carries the caller's value.

use super::{
    BULK_CHUNK_SIZE, Batch, BatchProgress, BatchStore, DistributedLock, Driver, FailedJob,
    FailedJobQuery, FailedJobStore, JobStore, Lease, QueueStats, Released,
};
use crate::clock::{self, Clock, to_delta};
use crate::errors::StoreError;
use crate::job::Job;
use crate::schema::{BatchRow, FailedJobRow, JOB_COLUMNS, JobRow, job_snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const FAILED_COLUMNS: &str = "id, connection, queue, job, error, batch_id, failed_at";
const BATCH_COLUMNS: &str =
    "id, name, total_jobs, completed_jobs, failed_jobs, callback, created_at, finished_at";

/// Create the tables and indexes this driver needs.
pub async fn setup_database(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Inserts jobs with a single multi-row statement.
async fn insert_jobs<'c>(executor: impl PgExecutor<'c>, jobs: &[Job]) -> Result<(), sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO jobs (id, queue, handler, payload, priority, attempts, max_attempts, \
         batch_id, created_at, available_at) ",
    );
    builder.push_values(jobs, |mut row, job| {
        row.push_bind(job.id.clone())
            .push_bind(job.queue.clone())
            .push_bind(job.handler.clone())
            .push_bind(job.payload.clone())
            .push_bind(job.priority)
            .push_bind(job.attempts)
            .push_bind(job.max_attempts)
            .push_bind(job.batch_id.clone())
            .push_bind(job.created_at)
            .push_bind(job.available_at);
    });
    builder.build().execute(executor).await?;
    Ok(())
}

/// Finds the next visible job on `queue` and marks it reserved.
async fn reserve_next_job(
    pool: &PgPool,
    queue: &str,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as::<_, JobRow>(&format!(
        r"
        UPDATE jobs
        SET attempts = attempts + 1, reserved_at = $2, reserved_until = $3
        WHERE id = (
            SELECT id
            FROM jobs
            WHERE queue = $1
              AND available_at <= $2
              AND (reserved_until IS NULL OR reserved_until < $2)
            ORDER BY priority DESC, available_at ASC, seq ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "
    ))
    .bind(queue)
    .bind(now)
    .bind(until)
    .fetch_optional(pool)
    .await
}

/// Moves a job from `jobs` into `failed_jobs`, provided the row still carries
/// the reservation the snapshot was taken under.
async fn move_to_failed(
    tx: &mut Transaction<'_, Postgres>,
    failed: &FailedJob,
) -> Result<bool, StoreError> {
    let deleted = sqlx::query(
        "DELETE FROM jobs WHERE id = $1 AND reserved_until IS NOT DISTINCT FROM $2",
    )
    .bind(&failed.job.id)
    .bind(failed.job.reserved_until)
    .execute(&mut **tx)
    .await?;
    if deleted.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        r"
        INSERT INTO failed_jobs (id, job_id, connection, queue, job, error, batch_id, failed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ",
    )
    .bind(&failed.id)
    .bind(&failed.job.id)
    .bind(&failed.connection)
    .bind(&failed.queue)
    .bind(job_snapshot(&failed.job)?)
    .bind(&failed.error)
    .bind(&failed.batch_id)
    .bind(failed.failed_at)
    .execute(&mut **tx)
    .await?;

    Ok(true)
}

/// The Postgres backend.
#[derive(Debug, Clone)]
pub struct PgDriver {
    pool: PgPool,
    connection: String,
    retry_after: Duration,
    clock: Arc<dyn Clock>,
}

impl PgDriver {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, connection: impl Into<String>) -> Self {
        Self {
            pool,
            connection: connection.into(),
            retry_after: super::DEFAULT_RETRY_AFTER,
            clock: clock::system(),
        }
    }

    /// Open a pool against `url`.
    pub async fn connect(url: &str, connection: impl Into<String>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self::new(pool, connection))
    }

    /// Set how long reservations are held.
    pub fn retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Use another clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgDriver {
    #[instrument(name = "workforce.pg.enqueue", skip_all, fields(job.id = %job.id))]
    async fn enqueue(&self, job: Job) -> Result<String, StoreError> {
        insert_jobs(&self.pool, std::slice::from_ref(&job)).await?;
        Ok(job.id)
    }

    async fn bulk_enqueue(&self, jobs: Vec<Job>) -> Result<Vec<String>, StoreError> {
        for chunk in jobs.chunks(BULK_CHUNK_SIZE) {
            insert_jobs(&self.pool, chunk).await?;
            debug!(count = chunk.len(), "Inserted job chunk");
        }
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    async fn reserve(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let until = now + to_delta(self.retry_after);
        let row = reserve_next_job(&self.pool, queue, now, until).await?;
        Ok(row.map(Job::from))
    }

    async fn acknowledge(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(
        &self,
        reserved: &Job,
        delay: Duration,
        error: &str,
    ) -> Result<Option<Released>, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE id = $1 AND reserved_until IS NOT DISTINCT FROM $2 FOR UPDATE"
        ))
        .bind(&reserved.id)
        .bind(reserved.reserved_until)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };
        let job = Job::from(row);

        if job.attempts_exhausted() {
            let failed = FailedJob::new(&self.connection, &job, error, now);
            move_to_failed(&mut tx, &failed).await?;
            tx.commit().await?;
            return Ok(Some(Released::Failed));
        }

        let available_at = now + to_delta(delay);
        sqlx::query(
            "UPDATE jobs SET reserved_at = NULL, reserved_until = NULL, available_at = $2 \
             WHERE id = $1",
        )
        .bind(&job.id)
        .bind(available_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(Released::Requeued(available_at)))
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<bool, StoreError> {
        let failed = FailedJob::new(&self.connection, job, error, self.clock.now());
        let mut tx = self.pool.begin().await?;
        if !move_to_failed(&mut tx, &failed).await? {
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let now = self.clock.now();
        let (pending, reserved, delayed, avg_wait_secs) =
            sqlx::query_as::<_, (i64, i64, i64, f64)>(
                r"
                SELECT
                    COUNT(*) FILTER (WHERE (reserved_until IS NULL OR reserved_until < $2)
                                       AND available_at <= $2),
                    COUNT(*) FILTER (WHERE reserved_until IS NOT NULL AND reserved_until >= $2),
                    COUNT(*) FILTER (WHERE (reserved_until IS NULL OR reserved_until < $2)
                                       AND available_at > $2),
                    COALESCE(
                        AVG(EXTRACT(EPOCH FROM ($2 - available_at)))
                            FILTER (WHERE (reserved_until IS NULL OR reserved_until < $2)
                                      AND available_at <= $2),
                        0
                    )::FLOAT8
                FROM jobs
                WHERE queue = $1
                ",
            )
            .bind(queue)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        let failed = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM failed_jobs WHERE connection = $1 AND queue = $2",
        )
        .bind(&self.connection)
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let count = |n: i64| u64::try_from(n).unwrap_or_default();
        Ok(QueueStats {
            queue: queue.to_string(),
            total: count(pending + reserved + delayed),
            pending: count(pending),
            reserved: count(reserved),
            delayed: count(delayed),
            failed: count(failed),
            avg_wait_secs,
        })
    }

    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT DISTINCT queue FROM jobs ORDER BY queue")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FailedJobStore for PgDriver {
    async fn failed_jobs(&self, query: &FailedJobQuery) -> Result<Vec<FailedJob>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {FAILED_COLUMNS} FROM failed_jobs WHERE connection = "
        ));
        builder.push_bind(self.connection.clone());

        if let Some(queue) = &query.queue {
            builder.push(" AND queue = ").push_bind(queue.clone());
        }

        builder.push(" ORDER BY failed_at DESC");

        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = builder
            .build_query_as::<FailedJobRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FailedJob::from).collect())
    }

    async fn find_failed(&self, id: &str) -> Result<Option<FailedJob>, StoreError> {
        let row = sqlx::query_as::<_, FailedJobRow>(&format!(
            "SELECT {FAILED_COLUMNS} FROM failed_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FailedJob::from))
    }

    async fn retry_failed(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(Json(job)) = sqlx::query_scalar::<_, Json<Job>>(
            "DELETE FROM failed_jobs WHERE id = $1 AND connection = $2 RETURNING job",
        )
        .bind(id)
        .bind(&self.connection)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let job = job.reset_for_retry();
        insert_jobs(&mut *tx, std::slice::from_ref(&job)).await?;
        tx.commit().await?;

        Ok(Some(job.id))
    }

    async fn forget_failed(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM failed_jobs WHERE id = $1 AND connection = $2")
            .bind(id)
            .bind(&self.connection)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM failed_jobs WHERE connection = $1 AND failed_at < $2")
                .bind(&self.connection)
                .bind(before)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BatchStore for PgDriver {
    async fn create_batch(&self, batch: Batch) -> Result<Batch, StoreError> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            r"
            INSERT INTO job_batches (id, name, callback, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {BATCH_COLUMNS}
            "
        ))
        .bind(&batch.id)
        .bind(&batch.name)
        .bind(batch.then.clone().map(Json))
        .bind(batch.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn add_batch_jobs(&self, id: &str, count: i64) -> Result<(), StoreError> {
        let updated = sqlx::query_scalar::<_, String>(
            r"
            UPDATE job_batches SET total_jobs = total_jobs + $2
            WHERE id = $1 AND finished_at IS NULL
            RETURNING id
            ",
        )
        .bind(id)
        .bind(count)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(_) => Ok(()),
            None if self.find_batch(id).await?.is_some() => {
                Err(StoreError::BatchFinished(id.to_string()))
            }
            None => Err(StoreError::BatchNotFound(id.to_string())),
        }
    }

    async fn record_batch_outcome(
        &self,
        id: &str,
        success: bool,
    ) -> Result<BatchProgress, StoreError> {
        sqlx::query(
            r"
            UPDATE job_batches
            SET completed_jobs = completed_jobs + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_jobs = failed_jobs + CASE WHEN $2 THEN 0 ELSE 1 END
            WHERE id = $1 AND completed_jobs + failed_jobs < total_jobs
            ",
        )
        .bind(id)
        .bind(success)
        .execute(&self.pool)
        .await?;

        // Compare-and-set: only one caller can move `finished_at` off NULL.
        let finished = sqlx::query_as::<_, BatchRow>(&format!(
            r"
            UPDATE job_batches SET finished_at = $2
            WHERE id = $1 AND finished_at IS NULL AND completed_jobs + failed_jobs >= total_jobs
            RETURNING {BATCH_COLUMNS}
            "
        ))
        .bind(id)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = finished {
            return Ok(BatchProgress {
                batch: row.into(),
                just_finished: true,
            });
        }

        let batch = self
            .find_batch(id)
            .await?
            .ok_or_else(|| StoreError::BatchNotFound(id.to_string()))?;
        Ok(BatchProgress {
            batch,
            just_finished: false,
        })
    }

    async fn find_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM job_batches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Batch::from))
    }
}

#[async_trait]
impl DistributedLock for PgDriver {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let now = self.clock.now();
        let lease = Lease {
            name: name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: now + to_delta(ttl),
        };

        let acquired = sqlx::query_scalar::<_, String>(
            r"
            INSERT INTO locks (name, token, expires_at) VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE locks.expires_at <= $4
            RETURNING token
            ",
        )
        .bind(&lease.name)
        .bind(&lease.token)
        .bind(lease.expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.map(|_| lease))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM locks WHERE name = $1 AND token = $2")
            .bind(&lease.name)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl Driver for PgDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn lock(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }
}
