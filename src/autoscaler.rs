//! Periodic control loop that sizes worker pools from queue and pool metrics.

use crate::clock::{Clock, to_delta};
use crate::errors::{ConfigError, QueueError};
use crate::manager::QueueManager;
use crate::process::{ProcessManager, ProcessOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the distributed lock held for the duration of a tick.
pub const LOCK_NAME: &str = "workforce:autoscaler";

const UTILIZATION_HIGH: f64 = 0.85;
const UTILIZATION_LOW: f64 = 0.30;
const INCOMING_SURGE: f64 = 1.5;
const PROCESSING_SURPLUS: f64 = 2.0;
const CALM_WAIT_SECS: f64 = 10.0;
const SMALL_QUEUE: u64 = 5;
const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Bounds and thresholds for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    /// Never run fewer workers.
    pub min_workers: usize,
    /// Never run more workers.
    pub max_workers: usize,
    /// Scale up once more jobs than this are waiting.
    pub scale_up_threshold: u64,
    /// Scale down once fewer jobs than this are waiting.
    pub scale_down_threshold: u64,
    /// Workers added per scale-up.
    pub scale_up_step: usize,
    /// Workers removed per scale-down.
    pub scale_down_step: usize,
    /// Minimum time between two scaling actions.
    #[serde(with = "secs")]
    pub cooldown: Duration,
    /// Scale up when jobs wait longer than this on average.
    #[serde(with = "secs")]
    pub max_wait_time: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 100,
            scale_down_threshold: 10,
            scale_up_step: 1,
            scale_down_step: 1,
            cooldown: Duration::from_secs(60),
            max_wait_time: Duration::from_secs(60),
        }
    }
}

impl ScalingPolicy {
    /// Reject inconsistent policies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err(ConfigError::Invalid("scaling steps must be at least 1".into()));
        }
        if self.scale_down_threshold > self.scale_up_threshold {
            return Err(ConfigError::Invalid(format!(
                "scale_down_threshold ({}) exceeds scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        Ok(())
    }

    /// The worker count these metrics call for, and why. Ignores cooldown.
    pub fn evaluate(&self, current: usize, metrics: &ScalingMetrics) -> (usize, String) {
        if current < self.min_workers {
            return (self.min_workers, format!("below the minimum of {}", self.min_workers));
        }
        if current > self.max_workers {
            return (self.max_workers, format!("above the maximum of {}", self.max_workers));
        }

        if let Some(pressure) = self.pressure(metrics) {
            if current >= self.max_workers {
                return (current, format!("{pressure}, already at the maximum"));
            }
            let target = (current + self.scale_up_step).min(self.max_workers);
            return (target, pressure);
        }

        if let Some(slack) = self.slack(metrics) {
            if current <= self.min_workers {
                return (current, format!("{slack}, already at the minimum"));
            }
            let target = current
                .saturating_sub(self.scale_down_step)
                .max(self.min_workers);
            return (target, slack);
        }

        (current, "within thresholds".into())
    }

    fn pressure(&self, m: &ScalingMetrics) -> Option<String> {
        if m.queue_size > self.scale_up_threshold {
            Some(format!(
                "queue size {} above {}",
                m.queue_size, self.scale_up_threshold
            ))
        } else if m.incoming_rate > m.processing_rate * INCOMING_SURGE {
            Some(format!(
                "incoming {:.2}/s outpaces processing {:.2}/s",
                m.incoming_rate, m.processing_rate
            ))
        } else if m.avg_worker_utilization > UTILIZATION_HIGH {
            Some(format!(
                "utilization {:.0}% above {:.0}%",
                m.avg_worker_utilization * 100.0,
                UTILIZATION_HIGH * 100.0
            ))
        } else if m.avg_wait_secs > self.max_wait_time.as_secs_f64() {
            Some(format!(
                "average wait {:.1}s above {}s",
                m.avg_wait_secs,
                self.max_wait_time.as_secs()
            ))
        } else {
            None
        }
    }

    fn slack(&self, m: &ScalingMetrics) -> Option<String> {
        if m.queue_size < self.scale_down_threshold
            && m.avg_worker_utilization < UTILIZATION_LOW
            && m.avg_wait_secs < CALM_WAIT_SECS
        {
            Some(format!(
                "queue size {} below {} and workers mostly idle",
                m.queue_size, self.scale_down_threshold
            ))
        } else if m.processing_rate > m.incoming_rate * PROCESSING_SURPLUS
            && m.queue_size < SMALL_QUEUE
        {
            Some(format!(
                "processing {:.2}/s far ahead of incoming {:.2}/s",
                m.processing_rate, m.incoming_rate
            ))
        } else {
            None
        }
    }
}

/// Observed load of one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScalingMetrics {
    /// Jobs pending, reserved or delayed.
    pub queue_size: u64,
    /// Mean utilization of live workers, in `0..=1`.
    pub avg_worker_utilization: f64,
    /// Jobs finished per second since the previous tick.
    pub processing_rate: f64,
    /// Jobs arriving per second since the previous tick.
    pub incoming_rate: f64,
    /// Mean seconds pending jobs have waited.
    pub avg_wait_secs: f64,
}

/// One evaluation, whether or not it changed anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    /// Evaluated queue.
    pub queue: String,
    /// When the evaluation ran.
    pub at: DateTime<Utc>,
    /// Live workers before.
    pub previous: usize,
    /// Live workers asked for.
    pub target: usize,
    /// What the decision was based on.
    pub metrics: ScalingMetrics,
    /// Why.
    pub reason: String,
}

impl ScalingDecision {
    /// Whether the pool size changed.
    pub fn is_change(&self) -> bool {
        self.previous != self.target
    }
}

#[derive(Debug, Clone)]
struct ScaledQueue {
    policy: ScalingPolicy,
    options: ProcessOptions,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    backlog: u64,
    processed: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    last_scaled: Option<DateTime<Utc>>,
    last_sample: Option<Sample>,
    history: VecDeque<ScalingDecision>,
}

/// Drives [`ProcessManager::scale`] from queue metrics.
#[derive(Debug)]
pub struct AutoScaler {
    manager: Arc<QueueManager>,
    processes: ProcessManager,
    queues: BTreeMap<String, ScaledQueue>,
    lock_connection: Option<String>,
    lock_ttl: Duration,
    history_limit: usize,
    state: Mutex<BTreeMap<String, QueueState>>,
}

impl AutoScaler {
    /// Scale pools of `processes` from the queues of `manager`.
    pub fn new(manager: Arc<QueueManager>, processes: ProcessManager) -> Self {
        Self {
            manager,
            processes,
            queues: BTreeMap::new(),
            lock_connection: None,
            lock_ttl: Duration::from_secs(30),
            history_limit: DEFAULT_HISTORY_LIMIT,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// Auto-scale `queue`. Fails if `policy` is inconsistent.
    pub fn queue(
        mut self,
        queue: impl Into<String>,
        policy: ScalingPolicy,
        options: ProcessOptions,
    ) -> Result<Self, ConfigError> {
        policy.validate()?;
        self.queues
            .insert(queue.into(), ScaledQueue { policy, options });
        Ok(self)
    }

    /// Take the tick lock on this connection instead of the default one.
    pub fn lock_connection(mut self, connection: impl Into<String>) -> Self {
        self.lock_connection = Some(connection.into());
        self
    }

    /// How long a tick may hold the lock.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Keep at most `limit` decisions per queue.
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Start every queue at its minimum.
    pub async fn bootstrap(&self) {
        for (queue, scaled) in &self.queues {
            let previous = self.processes.pool_stats(queue).await.live;
            let target = scaled.policy.min_workers.max(previous);
            let live = self
                .processes
                .scale(queue, target, scaled.options.clone())
                .await;
            info!(%queue, workers = live, "Bootstrapped worker pool");
            self.record(ScalingDecision {
                queue: queue.clone(),
                at: self.manager.clock().now(),
                previous,
                target,
                metrics: ScalingMetrics::default(),
                reason: "bootstrap".into(),
            })
            .await;
        }
    }

    /// Evaluate every queue once, unless another node holds the tick lock.
    pub async fn tick(&self) -> Result<Vec<ScalingDecision>, QueueError> {
        let lock = self.manager.lock(self.lock_connection.as_deref())?;
        let Some(lease) = lock.acquire(LOCK_NAME, self.lock_ttl).await? else {
            debug!("Another auto-scaler holds the lock, skipping this tick");
            return Ok(Vec::new());
        };

        let mut decisions = Vec::new();
        for (queue, scaled) in &self.queues {
            match self.evaluate_queue(queue, scaled).await {
                Ok(decision) => decisions.push(decision),
                Err(error) => warn!(%queue, %error, "Failed to evaluate queue"),
            }
        }

        if let Err(error) = lock.release(&lease).await {
            warn!(%error, "Failed to release the auto-scaler lock");
        }
        Ok(decisions)
    }

    async fn metrics(&self, queue: &str, scaled: &ScaledQueue) -> Result<(ScalingMetrics, usize), QueueError> {
        let stats = self
            .manager
            .stats(Some(queue), scaled.options.connection.as_deref())
            .await?;
        let pool = self.processes.pool_stats(queue).await;
        let now = self.manager.clock().now();

        let sample = Sample {
            at: now,
            backlog: stats.total,
            processed: pool.jobs_processed,
        };
        let previous = {
            let mut state = self.state.lock().await;
            state
                .entry(queue.to_string())
                .or_default()
                .last_sample
                .replace(sample)
        };

        let (processing_rate, incoming_rate) = match previous {
            Some(previous) => {
                let elapsed = (now - previous.at).num_milliseconds() as f64 / 1000.0;
                if elapsed > 0.0 {
                    let processed = sample.processed.saturating_sub(previous.processed) as f64;
                    let arrived = (sample.backlog as f64 - previous.backlog as f64 + processed).max(0.0);
                    (processed / elapsed, arrived / elapsed)
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };

        let metrics = ScalingMetrics {
            queue_size: stats.total,
            avg_worker_utilization: pool.avg_utilization,
            processing_rate,
            incoming_rate,
            avg_wait_secs: stats.avg_wait_secs,
        };
        Ok((metrics, pool.live))
    }

    async fn evaluate_queue(
        &self,
        queue: &str,
        scaled: &ScaledQueue,
    ) -> Result<ScalingDecision, QueueError> {
        let (metrics, current) = self.metrics(queue, scaled).await?;
        let (proposed, reason) = scaled.policy.evaluate(current, &metrics);
        let now = self.manager.clock().now();

        let cooling_down = {
            let state = self.state.lock().await;
            state
                .get(queue)
                .and_then(|state| state.last_scaled)
                .is_some_and(|at| now < at + to_delta(scaled.policy.cooldown))
        };

        let (target, reason) = if proposed != current && cooling_down {
            debug!(%queue, current, proposed, "Cooling down");
            (current, format!("cooldown: {reason}"))
        } else {
            (proposed, reason)
        };

        if target != current {
            info!(%queue, from = current, to = target, %reason, "Scaling worker pool");
            self.processes
                .scale(queue, target, scaled.options.clone())
                .await;
            self.state
                .lock()
                .await
                .entry(queue.to_string())
                .or_default()
                .last_scaled = Some(now);
        }

        let decision = ScalingDecision {
            queue: queue.to_string(),
            at: now,
            previous: current,
            target,
            metrics,
            reason,
        };
        self.record(decision.clone()).await;
        Ok(decision)
    }

    /// Scale `queue` to `target` right away, ignoring the cooldown. The
    /// target is clamped to the policy's bounds. Returns `None` for a queue
    /// that is not auto-scaled.
    pub async fn force_scale(&self, queue: &str, target: usize, reason: &str) -> Option<ScalingDecision> {
        let scaled = self.queues.get(queue)?;
        let bounded = target.clamp(scaled.policy.min_workers, scaled.policy.max_workers);
        let previous = self.processes.pool_stats(queue).await.live;
        let now = self.manager.clock().now();

        let reason = if bounded == target {
            format!("forced: {reason}")
        } else {
            format!("forced: {reason} (clamped from {target})")
        };
        info!(%queue, from = previous, to = bounded, %reason, "Forcing worker pool size");
        self.processes
            .scale(queue, bounded, scaled.options.clone())
            .await;
        self.state
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .last_scaled = Some(now);

        let decision = ScalingDecision {
            queue: queue.to_string(),
            at: now,
            previous,
            target: bounded,
            metrics: ScalingMetrics::default(),
            reason,
        };
        self.record(decision.clone()).await;
        Some(decision)
    }

    async fn record(&self, decision: ScalingDecision) {
        let mut state = self.state.lock().await;
        let history = &mut state.entry(decision.queue.clone()).or_default().history;
        history.push_back(decision);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Decisions for `queue`, oldest first.
    pub async fn history(&self, queue: &str) -> Vec<ScalingDecision> {
        let state = self.state.lock().await;
        state
            .get(queue)
            .map(|state| state.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Bootstrap, then tick every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        self.bootstrap().await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.tick().await {
                        warn!(%error, "Auto-scaler tick failed");
                    }
                }
            }
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
