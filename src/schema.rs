//! Database schema definitions for SQLx.
//!
//! Row types for the Postgres backend and their conversions into the
//! backend-agnostic records.

use crate::errors::StoreError;
use crate::job::Job;
use crate::store::{Batch, BatchCallback, FailedJob};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

/// Columns selected whenever a full job row is read.
pub(crate) const JOB_COLUMNS: &str = "id, queue, handler, payload, priority, attempts, \
     max_attempts, batch_id, created_at, available_at, reserved_at, reserved_until";

/// A row of the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    /// Unique identifier for the job
    pub id: String,
    /// Queue the job waits on
    pub queue: String,
    /// Handler identifier (used for dispatch)
    pub handler: String,
    /// JSON data containing the job payload
    pub payload: Value,
    /// Priority of the job (higher = more important)
    pub priority: i16,
    /// Attempts started so far
    pub attempts: i32,
    /// Attempts allowed
    pub max_attempts: i32,
    /// Batch the job belongs to
    pub batch_id: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp from which the job may be reserved
    pub available_at: DateTime<Utc>,
    /// Timestamp of the current reservation
    pub reserved_at: Option<DateTime<Utc>>,
    /// Timestamp at which the current reservation lapses
    pub reserved_until: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            queue: row.queue,
            handler: row.handler,
            payload: row.payload,
            priority: row.priority,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            available_at: row.available_at,
            reserved_at: row.reserved_at,
            reserved_until: row.reserved_until,
            batch_id: row.batch_id,
        }
    }
}

/// A row of the `failed_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct FailedJobRow {
    /// Identifier of the failure record
    pub id: String,
    /// Connection the job ran on
    pub connection: String,
    /// Queue the job ran on
    pub queue: String,
    /// Snapshot of the job
    pub job: Json<Job>,
    /// Last error
    pub error: String,
    /// Batch the job belonged to
    pub batch_id: Option<String>,
    /// Timestamp of the failure
    pub failed_at: DateTime<Utc>,
}

impl From<FailedJobRow> for FailedJob {
    fn from(row: FailedJobRow) -> Self {
        Self {
            id: row.id,
            job: row.job.0,
            connection: row.connection,
            queue: row.queue,
            error: row.error,
            batch_id: row.batch_id,
            failed_at: row.failed_at,
        }
    }
}

/// A row of the `job_batches` table.
#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    /// Batch identifier
    pub id: String,
    /// Optional label
    pub name: Option<String>,
    /// Jobs enqueued under the batch
    pub total_jobs: i64,
    /// Acknowledged jobs
    pub completed_jobs: i64,
    /// Failed jobs
    pub failed_jobs: i64,
    /// Completion job
    pub callback: Option<Json<BatchCallback>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<BatchRow> for Batch {
    fn from(row: BatchRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            total_jobs: row.total_jobs,
            completed_jobs: row.completed_jobs,
            failed_jobs: row.failed_jobs,
            then: row.callback.map(|c| c.0),
            created_at: row.created_at,
            finished_at: row.finished_at,
        }
    }
}

/// Serialize a job snapshot for the `failed_jobs.job` column.
pub(crate) fn job_snapshot(job: &Job) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(job)?)
}
