//! Key-value driver over Redis.
//!
//! # Key layout
//!
//! Every key lives under a configurable prefix `{p}`:
//!
//! - `{p}:job:{id}`: hash with the job's fields (timestamps in epoch ms)
//! - `{p}:queue:{q}:ready`: visible jobs, scored by `-priority`; members are
//!   `"{available_ms:015}:{seq:015}:{id}"` so equal scores sort by
//!   availability, then by creation
//! - `{p}:queue:{q}:ready-since`: running sum of the ready members'
//!   `available_at`, for the mean wait in `stats`
//! - `{p}:queue:{q}:delayed`: delayed jobs by `available_at`
//! - `{p}:queue:{q}:reserved`: reserved jobs by reservation expiry
//! - `{p}:failed`, `{p}:failed:queue:{q}`: failed-record ids by `failed_at`
//! - `{p}:failed-job:{id}`: failed record as JSON
//! - `{p}:batch:{id}`: batch hash with counters
//!
//! Every mutation that touches more than one key runs as a Lua script, so
//! Redis's single-threaded execution makes it atomic. `reserve` first moves
//! due delayed jobs and lapsed reservations into the ready set, then pops the
//! head.
//!
//! A reservation is identified by the `reserved_until` it was handed out
//! with. `release` and `fail` compare it inside their scripts and leave a job
//! alone once another worker has reserved it again.

use super::{
    BULK_CHUNK_SIZE, Batch, BatchProgress, BatchStore, DistributedLock, Driver, FailedJob,
    FailedJobQuery, FailedJobStore, JobStore, Lease, QueueStats, Released,
};
use crate::clock::{self, Clock, from_millis, to_delta, to_millis};
use crate::errors::StoreError;
use crate::job::Job;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script, ScriptInvocation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::debug;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "workforce";

/// Functions shared by every script that adds to or removes from a ready set.
///
/// `{base}:ready-since` holds the sum of `available_at - WAIT_EPOCH` over the
/// set's members, so the mean wait is one `GET` away.
const READY_SET: &str = r"
local WAIT_EPOCH = 1600000000000
local function ready_add(base, priority, member)
  if redis.call('ZADD', base .. ':ready', -priority, member) == 1 then
    redis.call('INCRBY', base .. ':ready-since', tonumber(string.sub(member, 1, 15)) - WAIT_EPOCH)
  end
end
local function ready_remove(base, member)
  if member and redis.call('ZREM', base .. ':ready', member) == 1 then
    redis.call('DECRBY', base .. ':ready-since', tonumber(string.sub(member, 1, 15)) - WAIT_EPOCH)
  end
end
";

fn ready_script(body: &str) -> Script {
    Script::new(&format!("{READY_SET}{body}"))
}

/// Inserts jobs; `ARGV[3]`, when non-empty, names a failed record that must
/// be consumed in the same step (manual retry).
static ENQUEUE: LazyLock<Script> = LazyLock::new(|| {
    ready_script(
        r"
local p, now = ARGV[1], tonumber(ARGV[2])
local consume = ARGV[3]
if consume ~= '' then
  if redis.call('DEL', p .. ':failed-job:' .. consume) == 0 then return -1 end
  redis.call('ZREM', p .. ':failed', consume)
  redis.call('ZREM', p .. ':failed:queue:' .. ARGV[5], consume)
end
local n = 0
for i = 4, #ARGV, 10 do
  local id, queue = ARGV[i], ARGV[i + 1]
  local priority = tonumber(ARGV[i + 4])
  local available = tonumber(ARGV[i + 8])
  local seq = redis.call('INCR', p .. ':seq')
  local member = string.format('%015d:%015d:%s', available, seq, id)
  redis.call('HSET', p .. ':job:' .. id,
    'id', id, 'queue', queue, 'handler', ARGV[i + 2], 'payload', ARGV[i + 3],
    'priority', ARGV[i + 4], 'attempts', ARGV[i + 5], 'max_attempts', ARGV[i + 6],
    'created_at', ARGV[i + 7], 'available_at', ARGV[i + 8], 'batch_id', ARGV[i + 9],
    'reserved_at', '', 'reserved_until', '', 'seq', seq, 'member', member)
  redis.call('SADD', p .. ':queues', queue)
  if available > now then
    redis.call('ZADD', p .. ':queue:' .. queue .. ':delayed', available, id)
  else
    ready_add(p .. ':queue:' .. queue, priority, member)
  end
  n = n + 1
end
return n
",
    )
});

static RESERVE: LazyLock<Script> = LazyLock::new(|| {
    ready_script(
        r"
local p, queue = ARGV[1], ARGV[2]
local base = p .. ':queue:' .. queue
local function make_ready(id)
  local f = redis.call('HMGET', p .. ':job:' .. id, 'priority', 'member')
  if f[1] then ready_add(base, tonumber(f[1]), f[2]) end
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', base .. ':delayed', '-inf', ARGV[3])) do
  redis.call('ZREM', base .. ':delayed', id)
  make_ready(id)
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', base .. ':reserved', '-inf', '(' .. ARGV[3])) do
  redis.call('ZREM', base .. ':reserved', id)
  make_ready(id)
end
while true do
  local head = redis.call('ZRANGE', base .. ':ready', 0, 0)
  if #head == 0 then return false end
  ready_remove(base, head[1])
  local id = string.sub(head[1], 33)
  local key = p .. ':job:' .. id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HINCRBY', key, 'attempts', 1)
    redis.call('HSET', key, 'reserved_at', ARGV[3], 'reserved_until', ARGV[4])
    redis.call('ZADD', base .. ':reserved', tonumber(ARGV[4]), id)
    return redis.call('HGETALL', key)
  end
end
",
    )
});

/// Returns 1 if the job was deleted, 0 if it was already gone.
static ACKNOWLEDGE: LazyLock<Script> = LazyLock::new(|| {
    ready_script(
        r"
local p, id = ARGV[1], ARGV[2]
local key = p .. ':job:' .. id
local f = redis.call('HMGET', key, 'queue', 'member')
if not f[1] then return 0 end
local base = p .. ':queue:' .. f[1]
ready_remove(base, f[2])
redis.call('ZREM', base .. ':delayed', id)
redis.call('ZREM', base .. ':reserved', id)
redis.call('DEL', key)
return 1
",
    )
});

/// Requeues a reserved job, or fails it once its attempts are used up.
///
/// `ARGV[3]` is the caller's `reserved_until`. Returns 0 if the job no longer
/// carries it, 1 if requeued and 2 if the prepared failed record in
/// `ARGV[6..8]` was stored.
static RELEASE: LazyLock<Script> = LazyLock::new(|| {
    ready_script(
        r"
local p, id, held = ARGV[1], ARGV[2], ARGV[3]
local now, available = tonumber(ARGV[4]), tonumber(ARGV[5])
local key = p .. ':job:' .. id
local f = redis.call('HMGET', key, 'queue', 'priority', 'seq', 'member',
  'reserved_until', 'attempts', 'max_attempts')
if not f[1] or f[5] ~= held then return 0 end
local base = p .. ':queue:' .. f[1]
redis.call('ZREM', base .. ':reserved', id)
ready_remove(base, f[4])
if tonumber(f[6]) >= tonumber(f[7]) then
  local fid, record, at = ARGV[6], ARGV[7], ARGV[8]
  redis.call('DEL', key)
  redis.call('SET', p .. ':failed-job:' .. fid, record)
  redis.call('ZADD', p .. ':failed', at, fid)
  redis.call('ZADD', p .. ':failed:queue:' .. f[1], at, fid)
  return 2
end
local member = string.format('%015d:%015d:%s', available, tonumber(f[3]), id)
redis.call('HSET', key, 'available_at', ARGV[5], 'member', member,
  'reserved_at', '', 'reserved_until', '')
if available > now then
  redis.call('ZADD', base .. ':delayed', available, id)
else
  ready_add(base, tonumber(f[2]), member)
end
return 1
",
    )
});

/// Moves a reserved job into the failed-job store. `ARGV[3]` is the caller's
/// `reserved_until`; returns 0 if the job no longer carries it.
static FAIL: LazyLock<Script> = LazyLock::new(|| {
    ready_script(
        r"
local p, id, held = ARGV[1], ARGV[2], ARGV[3]
local fid, record, at = ARGV[4], ARGV[5], ARGV[6]
local key = p .. ':job:' .. id
local f = redis.call('HMGET', key, 'queue', 'member', 'reserved_until')
if not f[1] or f[3] ~= held then return 0 end
local base = p .. ':queue:' .. f[1]
ready_remove(base, f[2])
redis.call('ZREM', base .. ':delayed', id)
redis.call('ZREM', base .. ':reserved', id)
redis.call('DEL', key)
redis.call('SET', p .. ':failed-job:' .. fid, record)
redis.call('ZADD', p .. ':failed', at, fid)
redis.call('ZADD', p .. ':failed:queue:' .. f[1], at, fid)
return 1
",
    )
});

/// Returns `{pending, reserved, delayed, failed, waited_ms}`.
///
/// Only due delayed jobs and lapsed reservations are walked; everything else
/// is a counter or a `ZCOUNT`.
static STATS: LazyLock<Script> = LazyLock::new(|| {
    ready_script(
        r"
local p, queue, now = ARGV[1], ARGV[2], tonumber(ARGV[3])
local base = p .. ':queue:' .. queue
local ready = redis.call('ZCARD', base .. ':ready')
local since = tonumber(redis.call('GET', base .. ':ready-since') or '0')
local pending, waited = ready, ready * (now - WAIT_EPOCH) - since
local due = redis.call('ZRANGEBYSCORE', base .. ':delayed', '-inf', ARGV[3], 'WITHSCORES')
for i = 2, #due, 2 do
  pending = pending + 1
  waited = waited + math.max(0, now - tonumber(due[i]))
end
local expired = redis.call('ZRANGEBYSCORE', base .. ':reserved', '-inf', '(' .. ARGV[3])
for _, id in ipairs(expired) do
  pending = pending + 1
  local available = redis.call('HGET', p .. ':job:' .. id, 'available_at')
  if available then waited = waited + math.max(0, now - tonumber(available)) end
end
local delayed = redis.call('ZCOUNT', base .. ':delayed', '(' .. ARGV[3], '+inf')
local reserved = redis.call('ZCOUNT', base .. ':reserved', ARGV[3], '+inf')
local failed = redis.call('ZCARD', p .. ':failed:queue:' .. queue)
return {pending, reserved, delayed, failed, math.floor(math.max(0, waited))}
",
    )
});

/// Returns -1 if the batch is missing, 0 if it already finished.
static ADD_BATCH_JOBS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local key = ARGV[1]
if redis.call('EXISTS', key) == 0 then return -1 end
local finished = redis.call('HGET', key, 'finished_at')
if finished and finished ~= '' then return 0 end
redis.call('HINCRBY', key, 'total', tonumber(ARGV[2]))
return 1
",
    )
});

/// Returns -1 if the batch is missing, 1 for the caller that completed it.
static BATCH_OUTCOME: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local key = ARGV[1]
if redis.call('EXISTS', key) == 0 then return -1 end
local f = redis.call('HMGET', key, 'total', 'completed', 'failed', 'finished_at')
local total, completed, failed = tonumber(f[1]), tonumber(f[2]), tonumber(f[3])
if completed + failed < total then
  if ARGV[2] == '1' then
    completed = redis.call('HINCRBY', key, 'completed', 1)
  else
    failed = redis.call('HINCRBY', key, 'failed', 1)
  end
end
if completed + failed >= total and (not f[4] or f[4] == '') then
  redis.call('HSET', key, 'finished_at', ARGV[3])
  return 1
end
return 0
",
    )
});

static UNLOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', ARGV[1]) == ARGV[2] then
  return redis.call('DEL', ARGV[1])
end
return 0
",
    )
});

/// The Redis backend.
#[derive(Clone)]
pub struct RedisDriver {
    redis: ConnectionManager,
    connection: String,
    prefix: String,
    retry_after: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDriver")
            .field("connection", &self.connection)
            .field("prefix", &self.prefix)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

impl RedisDriver {
    /// Connect to `url`. The connection manager reconnects on its own.
    pub async fn connect(url: &str, connection: impl Into<String>) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis, connection))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, connection: impl Into<String>) -> Self {
        Self {
            redis,
            connection: connection.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            retry_after: super::DEFAULT_RETRY_AFTER,
            clock: clock::system(),
        }
    }

    /// Namespace every key under `prefix`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
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

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn failed_key(&self, id: &str) -> String {
        format!("{}:failed-job:{id}", self.prefix)
    }

    fn failed_index(&self, queue: Option<&str>) -> String {
        match queue {
            Some(queue) => format!("{}:failed:queue:{queue}", self.prefix),
            None => format!("{}:failed", self.prefix),
        }
    }

    fn batch_key(&self, id: &str) -> String {
        format!("{}:batch:{id}", self.prefix)
    }

    fn queue_key(&self, queue: &str, set: &str) -> String {
        format!("{}:queue:{queue}:{set}", self.prefix)
    }

    /// Runs the enqueue script for `jobs`, optionally consuming a failed record.
    async fn insert_jobs(&self, jobs: &[Job], consume: Option<&str>) -> Result<i64, StoreError> {
        let mut invocation = ENQUEUE.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(to_millis(self.clock.now()))
            .arg(consume.unwrap_or_default());
        for job in jobs {
            push_job_args(&mut invocation, job)?;
        }

        let mut conn = self.redis.clone();
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(inserted)
    }
}

/// The `reserved_until` field as the scripts store it.
fn reservation_token(job: &Job) -> String {
    job.reserved_until
        .map(|until| to_millis(until).to_string())
        .unwrap_or_default()
}

fn push_job_args(invocation: &mut ScriptInvocation<'_>, job: &Job) -> Result<(), StoreError> {
    invocation
        .arg(&job.id)
        .arg(&job.queue)
        .arg(&job.handler)
        .arg(serde_json::to_string(&job.payload)?)
        .arg(job.priority)
        .arg(job.attempts)
        .arg(job.max_attempts)
        .arg(to_millis(job.created_at))
        .arg(to_millis(job.available_at))
        .arg(job.batch_id.as_deref().unwrap_or_default());
    Ok(())
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Corrupt(format!("job hash is missing `{name}`")))
}

fn parse<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T, StoreError> {
    field(fields, name)?
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("job hash has a malformed `{name}`")))
}

fn optional_time(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    match fields.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(_) => Ok(Some(from_millis(parse(fields, name)?))),
    }
}

fn job_from_fields(fields: &HashMap<String, String>) -> Result<Job, StoreError> {
    let batch_id = field(fields, "batch_id").unwrap_or_default();
    Ok(Job {
        id: field(fields, "id")?.to_string(),
        queue: field(fields, "queue")?.to_string(),
        handler: field(fields, "handler")?.to_string(),
        payload: serde_json::from_str(field(fields, "payload")?)?,
        priority: parse(fields, "priority")?,
        attempts: parse(fields, "attempts")?,
        max_attempts: parse(fields, "max_attempts")?,
        created_at: from_millis(parse(fields, "created_at")?),
        available_at: from_millis(parse(fields, "available_at")?),
        reserved_at: optional_time(fields, "reserved_at")?,
        reserved_until: optional_time(fields, "reserved_until")?,
        batch_id: (!batch_id.is_empty()).then(|| batch_id.to_string()),
    })
}

fn batch_from_fields(fields: &HashMap<String, String>) -> Result<Batch, StoreError> {
    let mut batch: Batch = serde_json::from_str(field(fields, "meta")?)?;
    batch.total_jobs = parse(fields, "total")?;
    batch.completed_jobs = parse(fields, "completed")?;
    batch.failed_jobs = parse(fields, "failed")?;
    batch.finished_at = optional_time(fields, "finished_at")?;
    Ok(batch)
}

#[async_trait]
impl JobStore for RedisDriver {
    async fn enqueue(&self, job: Job) -> Result<String, StoreError> {
        self.insert_jobs(std::slice::from_ref(&job), None).await?;
        Ok(job.id)
    }

    async fn bulk_enqueue(&self, jobs: Vec<Job>) -> Result<Vec<String>, StoreError> {
        for chunk in jobs.chunks(BULK_CHUNK_SIZE) {
            let inserted = self.insert_jobs(chunk, None).await?;
            debug!(count = inserted, "Inserted job chunk");
        }
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    async fn reserve(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let until = now + to_delta(self.retry_after);

        let mut conn = self.redis.clone();
        let fields: Option<HashMap<String, String>> = RESERVE
            .arg(&self.prefix)
            .arg(queue)
            .arg(to_millis(now))
            .arg(to_millis(until))
            .invoke_async(&mut conn)
            .await?;

        fields.as_ref().map(job_from_fields).transpose()
    }

    async fn acknowledge(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = ACKNOWLEDGE
            .arg(&self.prefix)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn release(
        &self,
        reserved: &Job,
        delay: Duration,
        error: &str,
    ) -> Result<Option<Released>, StoreError> {
        let now = self.clock.now();
        let available_at = now + to_delta(delay);
        let failed = FailedJob::new(&self.connection, reserved, error, now);

        let mut conn = self.redis.clone();
        let outcome: i64 = RELEASE
            .arg(&self.prefix)
            .arg(&reserved.id)
            .arg(reservation_token(reserved))
            .arg(to_millis(now))
            .arg(to_millis(available_at))
            .arg(&failed.id)
            .arg(serde_json::to_string(&failed)?)
            .arg(to_millis(now))
            .invoke_async(&mut conn)
            .await?;

        Ok(match outcome {
            1 => Some(Released::Requeued(available_at)),
            2 => Some(Released::Failed),
            _ => None,
        })
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<bool, StoreError> {
        let failed = FailedJob::new(&self.connection, job, error, self.clock.now());
        let mut conn = self.redis.clone();
        let moved: i64 = FAIL
            .arg(&self.prefix)
            .arg(&job.id)
            .arg(reservation_token(job))
            .arg(&failed.id)
            .arg(serde_json::to_string(&failed)?)
            .arg(to_millis(failed.failed_at))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved > 0)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let mut conn = self.redis.clone();
        let counts: Vec<i64> = STATS
            .arg(&self.prefix)
            .arg(queue)
            .arg(to_millis(self.clock.now()))
            .invoke_async(&mut conn)
            .await?;

        let [pending, reserved, delayed, failed, waited_ms] = counts[..] else {
            return Err(StoreError::Corrupt(format!(
                "stats script returned {} values",
                counts.len()
            )));
        };

        let count = |n: i64| u64::try_from(n).unwrap_or_default();
        Ok(QueueStats {
            queue: queue.to_string(),
            total: count(pending + reserved + delayed),
            pending: count(pending),
            reserved: count(reserved),
            delayed: count(delayed),
            failed: count(failed),
            avg_wait_secs: if pending > 0 {
                waited_ms as f64 / 1000.0 / pending as f64
            } else {
                0.0
            },
        })
    }

    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut names: Vec<String> = conn.smembers(format!("{}:queues", self.prefix)).await?;
        names.sort();

        let mut live = Vec::with_capacity(names.len());
        for name in names {
            let mut pipe = ::redis::pipe();
            pipe.zcard(self.queue_key(&name, "ready"))
                .zcard(self.queue_key(&name, "delayed"))
                .zcard(self.queue_key(&name, "reserved"));
            let (ready, delayed, reserved): (u64, u64, u64) = pipe.query_async(&mut conn).await?;
            if ready + delayed + reserved > 0 {
                live.push(name);
            }
        }
        Ok(live)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl FailedJobStore for RedisDriver {
    async fn failed_jobs(&self, query: &FailedJobQuery) -> Result<Vec<FailedJob>, StoreError> {
        let stop = query
            .limit
            .map_or(-1, |limit| isize::try_from(limit).unwrap_or(isize::MAX) - 1);
        if query.limit == Some(0) {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrevrange(self.failed_index(query.queue.as_deref()), 0, stop)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.failed_key(id)).collect();
        let records: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        records
            .into_iter()
            .flatten()
            .map(|record| Ok(serde_json::from_str(&record)?))
            .collect()
    }

    async fn find_failed(&self, id: &str) -> Result<Option<FailedJob>, StoreError> {
        let mut conn = self.redis.clone();
        let record: Option<String> = conn.get(self.failed_key(id)).await?;
        Ok(record.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    async fn retry_failed(&self, id: &str) -> Result<Option<String>, StoreError> {
        let Some(failed) = self.find_failed(id).await? else {
            return Ok(None);
        };

        let job = failed.job.reset_for_retry();
        if self.insert_jobs(std::slice::from_ref(&job), Some(id)).await? < 0 {
            return Ok(None);
        }
        Ok(Some(job.id))
    }

    async fn forget_failed(&self, id: &str) -> Result<bool, StoreError> {
        let Some(failed) = self.find_failed(id).await? else {
            return Ok(false);
        };

        let mut conn = self.redis.clone();
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .del(self.failed_key(id))
            .zrem(self.failed_index(None), id)
            .zrem(self.failed_index(Some(&failed.queue)), id);
        let (deleted, _, _): (u64, u64, u64) = pipe.query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let upper = format!("({}", to_millis(before));
        let mut conn = self.redis.clone();

        let ids: Vec<String> = conn
            .zrangebyscore(self.failed_index(None), "-inf", &upper)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let queues: Vec<String> = conn.smembers(format!("{}:queues", self.prefix)).await?;

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.del(self.failed_key(id)).ignore();
        }
        pipe.zrembyscore(self.failed_index(None), "-inf", &upper)
            .ignore();
        for queue in &queues {
            pipe.zrembyscore(self.failed_index(Some(queue)), "-inf", &upper)
                .ignore();
        }
        let () = pipe.query_async(&mut conn).await?;

        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl BatchStore for RedisDriver {
    async fn create_batch(&self, batch: Batch) -> Result<Batch, StoreError> {
        let meta = serde_json::to_string(&batch)?;
        let mut conn = self.redis.clone();
        let () = conn
            .hset_multiple(
                self.batch_key(&batch.id),
                &[
                    ("meta", meta),
                    ("total", batch.total_jobs.to_string()),
                    ("completed", batch.completed_jobs.to_string()),
                    ("failed", batch.failed_jobs.to_string()),
                    ("finished_at", String::new()),
                ],
            )
            .await?;
        Ok(batch)
    }

    async fn add_batch_jobs(&self, id: &str, count: i64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let status: i64 = ADD_BATCH_JOBS
            .arg(self.batch_key(id))
            .arg(count)
            .invoke_async(&mut conn)
            .await?;

        match status {
            -1 => Err(StoreError::BatchNotFound(id.to_string())),
            0 => Err(StoreError::BatchFinished(id.to_string())),
            _ => Ok(()),
        }
    }

    async fn record_batch_outcome(
        &self,
        id: &str,
        success: bool,
    ) -> Result<BatchProgress, StoreError> {
        let mut conn = self.redis.clone();
        let status: i64 = BATCH_OUTCOME
            .arg(self.batch_key(id))
            .arg(if success { "1" } else { "0" })
            .arg(to_millis(self.clock.now()))
            .invoke_async(&mut conn)
            .await?;

        if status < 0 {
            return Err(StoreError::BatchNotFound(id.to_string()));
        }

        let batch = self
            .find_batch(id)
            .await?
            .ok_or_else(|| StoreError::BatchNotFound(id.to_string()))?;
        Ok(BatchProgress {
            batch,
            just_finished: status == 1,
        })
    }

    async fn find_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.batch_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        batch_from_fields(&fields).map(Some)
    }
}

#[async_trait]
impl DistributedLock for RedisDriver {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let lease = Lease {
            name: name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: self.clock.now() + to_delta(ttl),
        };

        let mut conn = self.redis.clone();
        let set: Option<String> = ::redis::cmd("SET")
            .arg(format!("{}:lock:{name}", self.prefix))
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
            .query_async(&mut conn)
            .await?;

        Ok(set.map(|_| lease))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = UNLOCK
            .arg(format!("{}:lock:{}", self.prefix, lease.name))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

impl Driver for RedisDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn kind(&self) -> &'static str {
        "redis"
    }

    fn lock(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DEFAULT_QUEUE, NewJob};
    use claims::{assert_matches, assert_none};
    use serde_json::json;

    fn fields(job: &Job) -> HashMap<String, String> {
        HashMap::from([
            ("id".into(), job.id.clone()),
            ("queue".into(), job.queue.clone()),
            ("handler".into(), job.handler.clone()),
            ("payload".into(), job.payload.to_string()),
            ("priority".into(), job.priority.to_string()),
            ("attempts".into(), job.attempts.to_string()),
            ("max_attempts".into(), job.max_attempts.to_string()),
            ("created_at".into(), to_millis(job.created_at).to_string()),
            ("available_at".into(), to_millis(job.available_at).to_string()),
            ("reserved_at".into(), String::new()),
            ("reserved_until".into(), String::new()),
            ("batch_id".into(), String::new()),
        ])
    }

    #[test]
    fn job_hash_round_trips_at_millisecond_precision() {
        let now = from_millis(1_700_000_000_000);
        let job = NewJob::new("mail", json!({"to": "a@example.com"}))
            .priority(7)
            .into_job(now, DEFAULT_QUEUE, 3);

        let parsed = job_from_fields(&fields(&job)).unwrap();
        assert_eq!(parsed, job);
        assert_none!(parsed.batch_id);
    }

    #[test]
    fn missing_fields_are_reported_as_corrupt() {
        let job = NewJob::new("mail", json!(null)).into_job(Utc::now(), DEFAULT_QUEUE, 3);
        let mut fields = fields(&job);
        fields.remove("handler");

        assert_matches!(job_from_fields(&fields), Err(StoreError::Corrupt(_)));
    }
}
