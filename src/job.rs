//! The job envelope and the handler result type.

use crate::clock::to_delta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Attempts allowed when neither the job nor the configuration says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// A unit of work as it lives in a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identifier.
    pub id: String,
    /// Queue the job is waiting on.
    pub queue: String,
    /// Name of the handler that executes the job.
    pub handler: String,
    /// Handler input, opaque to the engine.
    pub payload: Value,
    /// Higher runs first.
    pub priority: i16,
    /// Number of attempts started so far.
    pub attempts: i32,
    /// Attempts allowed before the job is moved to the failed-job store.
    pub max_attempts: i32,
    /// When the job was first enqueued.
    pub created_at: DateTime<Utc>,
    /// The job is invisible to `reserve` before this instant.
    pub available_at: DateTime<Utc>,
    /// When the current reservation was taken.
    pub reserved_at: Option<DateTime<Utc>>,
    /// When the current reservation lapses.
    pub reserved_until: Option<DateTime<Utc>>,
    /// Batch the job belongs to.
    pub batch_id: Option<String>,
}

impl Job {
    /// Whether `reserve` may hand out this job at `now`.
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        now >= self.available_at && !self.is_reserved(now)
    }

    /// Whether a live (unexpired) reservation is held on the job.
    pub fn is_reserved(&self, now: DateTime<Utc>) -> bool {
        match (self.reserved_at, self.reserved_until) {
            (Some(_), Some(until)) => now <= until,
            _ => false,
        }
    }

    /// Whether the job is waiting for its delay to pass.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        !self.is_reserved(now) && now < self.available_at
    }

    /// Whether no further attempt may be started.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Reset the job for a manual retry out of the failed-job store.
    ///
    /// The job keeps its id and priority, and becomes available as of its
    /// creation time so it sorts ahead of everything enqueued after it.
    pub(crate) fn reset_for_retry(mut self) -> Self {
        self.attempts = 0;
        self.reserved_at = None;
        self.reserved_until = None;
        self.available_at = self.created_at;
        self
    }
}

/// A job that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Name of the handler.
    pub handler: String,
    /// Handler input.
    pub payload: Value,
    /// Target queue, the manager's default when `None`.
    pub queue: Option<String>,
    /// Delay before the job becomes visible.
    #[serde(default, with = "duration_secs")]
    pub delay: Duration,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i16,
    /// Attempts allowed, the manager's default when `None`.
    pub max_attempts: Option<i32>,
    /// Batch the job belongs to.
    #[serde(skip)]
    pub(crate) batch_id: Option<String>,
}

impl NewJob {
    /// A job for `handler` with the given payload and all defaults.
    pub fn new(handler: impl Into<String>, payload: Value) -> Self {
        Self {
            handler: handler.into(),
            payload,
            queue: None,
            delay: Duration::ZERO,
            priority: 0,
            max_attempts: None,
            batch_id: None,
        }
    }

    /// Route the job to a specific queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Hide the job for `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Materialize the envelope at `now`.
    pub(crate) fn into_job(
        self,
        now: DateTime<Utc>,
        default_queue: &str,
        default_max_attempts: i32,
    ) -> Job {
        Job {
            id: Uuid::new_v4().to_string(),
            queue: self.queue.unwrap_or_else(|| default_queue.to_string()),
            handler: self.handler,
            payload: self.payload,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            created_at: now,
            available_at: now + to_delta(self.delay),
            reserved_at: None,
            reserved_until: None,
            batch_id: self.batch_id,
        }
    }
}

/// How a handler failed.
#[derive(Debug, Error)]
pub enum JobError {
    /// Worth trying again later.
    #[error("{0:#}")]
    Retryable(anyhow::Error),

    /// Retrying will not help; the job goes straight to the failed-job store.
    #[error("{0:#}")]
    Terminal(anyhow::Error),
}

impl JobError {
    /// A terminal failure with the given message.
    pub fn terminal(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Terminal(anyhow::Error::msg(message))
    }

    /// A retryable failure with the given message.
    pub fn retryable(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Retryable(anyhow::Error::msg(message))
    }

    /// Whether the job should be released for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::Retryable(error)
    }
}

/// `min(max, base * 2^attempt)`, saturating.
pub fn backoff_delay(attempt: i32, base: Duration, max: Duration) -> Duration {
    let exponent = u32::try_from(attempt.max(0)).unwrap_or(0).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
