//! Redis-backed queue backend.
//!
//! Every queue lives under `{prefix}:{queue}:` and uses these keys:
//!
//! - `meta`: Hash marking the queue as existing (used for discovery)
//! - `id`: Counter for generated job ids
//! - `job:{id}`: JSON-encoded [`JobRecord`]
//! - `wait`, `active`: Lists of job ids, newest at the head
//! - `delayed`: Sorted set of job ids scored by due time
//! - `completed`, `failed`: Sorted sets scored by finish time, capped at
//!   [`HISTORY_LIMIT`]
//! - `repeat`: Hash of repeating-entry key to JSON [`RepeatingEntry`]
//! - `leases`: Sorted set of active job ids scored by lease expiry
//!
//! # Reliability
//!
//! State transitions that touch more than one key run as Lua scripts so a
//! job is never in two lists at once. Adding a job with an id that already
//! exists is a no-op, which makes repeat scheduling safe when several
//! replicas race on the same entry.
//!
//! A job whose lease runs out is pushed back to the fetch end of `wait`. The
//! stored record keeps its last written state until it is fetched again, so
//! enumeration reports the state of the list a job was found in.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::{debug, warn};

use super::backend::{QueueBackend, QueueError, HISTORY_LIMIT};
use super::job::{JobCounts, JobOptions, JobRecord, JobState, RepeatingEntry};
use super::memory::after_delay;

/// Adds a job unless its key already exists.
///
/// KEYS: job, wait, delayed. ARGV: id, json, due time in ms (0 = now).
const ADD_JOB_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if tonumber(ARGV[3]) > 0 then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
  redis.call('LPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

/// Moves active jobs with an expired lease back to the fetch end of wait.
///
/// KEYS: wait, active, leases. ARGV: now in ms. Returns the recovered ids.
const RECOVER_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, 100)
local recovered = {}
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  if redis.call('LREM', KEYS[2], 0, id) > 0 then
    redis.call('RPUSH', KEYS[1], id)
    table.insert(recovered, id)
  end
end
return recovered
"#;

/// Promotes due delayed jobs and moves the oldest waiting job to active
/// under a lease.
///
/// KEYS: wait, active, delayed, leases. ARGV: now in ms, lease expiry in ms.
const FETCH_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('LPUSH', KEYS[1], id)
end
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if id then
  redis.call('ZADD', KEYS[4], ARGV[2], id)
end
return id
"#;

/// Pushes back the expiry of a lease that still exists.
///
/// KEYS: leases. ARGV: id, lease expiry in ms.
const EXTEND_LEASE_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

/// Moves an active job into a capped history set.
///
/// KEYS: active, history, leases. ARGV: id, json, job key prefix, score, limit.
/// Returns -1 without changes if the job is no longer active.
const FINISH_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[3], ARGV[1])
if redis.call('LREM', KEYS[1], 0, ARGV[1]) == 0 then
  return -1
end
redis.call('SET', ARGV[3] .. ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
local limit = tonumber(ARGV[5])
local excess = redis.call('ZRANGE', KEYS[2], 0, -(limit + 1))
for _, id in ipairs(excess) do
  redis.call('DEL', ARGV[3] .. id)
end
if #excess > 0 then
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, #excess - 1)
end
return #excess
"#;

/// Moves an active job back to delayed for another attempt.
///
/// KEYS: active, delayed, job, leases. ARGV: id, json, due time in ms.
/// Returns -1 without changes if the job is no longer active.
const RETRY_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[4], ARGV[1])
if redis.call('LREM', KEYS[1], 0, ARGV[1]) == 0 then
  return -1
end
redis.call('SET', KEYS[3], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// Removes a job that is not active.
///
/// KEYS: wait, delayed, completed, failed, job. ARGV: id.
const REMOVE_JOB_SCRIPT: &str = r#"
local n = redis.call('LREM', KEYS[1], 0, ARGV[1])
n = n + redis.call('ZREM', KEYS[2], ARGV[1])
n = n + redis.call('ZREM', KEYS[3], ARGV[1])
n = n + redis.call('ZREM', KEYS[4], ARGV[1])
if n > 0 then
  redis.call('DEL', KEYS[5])
end
return n
"#;

/// Key names of one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    base: String,
    meta: String,
    id: String,
    wait: String,
    active: String,
    delayed: String,
    completed: String,
    failed: String,
    repeat: String,
    leases: String,
    job_prefix: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{}:{}", prefix, queue);
        Self {
            meta: format!("{}:meta", base),
            id: format!("{}:id", base),
            wait: format!("{}:wait", base),
            active: format!("{}:active", base),
            delayed: format!("{}:delayed", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            repeat: format!("{}:repeat", base),
            leases: format!("{}:leases", base),
            job_prefix: format!("{}:job:", base),
            base,
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix, id)
    }
}

struct Scripts {
    add_job: Script,
    recover: Script,
    fetch: Script,
    extend_lease: Script,
    finish: Script,
    retry: Script,
    remove_job: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            add_job: Script::new(ADD_JOB_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
            fetch: Script::new(FETCH_SCRIPT),
            extend_lease: Script::new(EXTEND_LEASE_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            remove_job: Script::new(REMOVE_JOB_SCRIPT),
        }
    }
}

/// Queue backend storing every queue in Redis.
///
/// Cloning the inner `ConnectionManager` is cheap; each operation works on
/// its own clone so the backend can be shared across workers.
pub struct RedisQueueBackend {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Prefix of every key written by this backend.
    prefix: String,
    scripts: Scripts,
}

impl RedisQueueBackend {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Prefix for every key (e.g., "agents")
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a backend from an existing ConnectionManager.
    ///
    /// Useful when the lock store shares the same connection.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            scripts: Scripts::new(),
        }
    }

    /// Returns a clone of the underlying connection.
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// Returns the key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn load_job(&self, keys: &QueueKeys, id: &str) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(keys.job(id)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn load_jobs(&self, keys: &QueueKeys, ids: &[String]) -> Result<Vec<JobRecord>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let job_keys: Vec<String> = ids.iter().map(|id| keys.job(id)).collect();
        let data: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&job_keys)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(data.len());
        for raw in data.into_iter().flatten() {
            jobs.push(serde_json::from_str(&raw)?);
        }
        Ok(jobs)
    }

    /// Stores a job through the idempotent add script.
    ///
    /// Returns the job that ends up stored under the id.
    async fn store_new(&self, keys: &QueueKeys, job: JobRecord) -> Result<JobRecord, QueueError> {
        let mut conn = self.redis.clone();
        let due_ms = match job.state {
            JobState::Delayed => job.run_at.map(|t| t.timestamp_millis()).unwrap_or(0),
            _ => 0,
        };
        let serialized = serde_json::to_string(&job)?;

        let added: i64 = self
            .scripts
            .add_job
            .key(keys.job(&job.id))
            .key(&keys.wait)
            .key(&keys.delayed)
            .arg(&job.id)
            .arg(serialized)
            .arg(due_ms)
            .invoke_async(&mut conn)
            .await?;

        if added == 0 {
            debug!(queue = %job.queue, job_id = %job.id, "Job id already exists, keeping stored job");
            return Ok(self.load_job(keys, &job.id).await?.unwrap_or(job));
        }
        Ok(job)
    }

    async fn load_entry(&self, keys: &QueueKeys, key: &str) -> Result<Option<RepeatingEntry>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(&keys.repeat, key).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn save_entry(&self, keys: &QueueKeys, entry: &RepeatingEntry) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(entry)?;
        conn.hset::<_, _, _, ()>(&keys.repeat, &entry.key, serialized)
            .await?;
        Ok(())
    }

    /// Schedules the occurrence after `fetched` if it still belongs to a live entry.
    async fn schedule_next_occurrence(
        &self,
        keys: &QueueKeys,
        fetched: &JobRecord,
        key: &str,
    ) -> Result<(), QueueError> {
        let Some(entry) = self.load_entry(keys, key).await? else {
            return Ok(());
        };
        if entry.next_job_id != fetched.id {
            return Ok(());
        }

        let now = Utc::now();
        let base = fetched.run_at.unwrap_or(now).max(now);
        match entry.schedule.next_after(base) {
            Some(next_run) => {
                let next = RepeatingEntry {
                    next_run,
                    next_job_id: RepeatingEntry::occurrence_id(key, next_run),
                    ..entry
                };
                self.store_new(keys, next.occurrence()).await?;
                self.save_entry(keys, &next).await?;
            }
            None => {
                let mut conn = self.redis.clone();
                conn.hdel::<_, _, ()>(&keys.repeat, key).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        conn.hset_nx::<_, _, _, ()>(&keys.meta, "createdAt", Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    async fn discover_queues(&self) -> Result<Vec<String>, QueueError> {
        let pattern = format!("{}:*:meta", self.prefix);
        let head = format!("{}:", self.prefix);

        let mut names: Vec<String> = self
            .scan(&pattern)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&head)
                    .and_then(|rest| rest.strip_suffix(":meta"))
                    .filter(|name| !name.is_empty() && !name.contains(':'))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        let keys = self.keys(queue);
        let now = Utc::now();

        if let Some(repeat) = opts.repeat.clone() {
            let next_run = repeat
                .schedule
                .next_after(now)
                .ok_or_else(|| QueueError::ScheduleExhausted(repeat.schedule.pattern()))?;
            self.remove_repeating(queue, &repeat.key).await?;

            let entry = RepeatingEntry {
                next_job_id: RepeatingEntry::occurrence_id(&repeat.key, next_run),
                key: repeat.key,
                name: name.to_string(),
                queue: queue.to_string(),
                schedule: repeat.schedule,
                next_run,
                data,
                attempts: opts.attempts,
                backoff_ms: opts.backoff_ms,
            };
            let job = self.store_new(&keys, entry.occurrence()).await?;
            self.save_entry(&keys, &entry).await?;
            return Ok(job);
        }

        let id = match opts.job_id.clone() {
            Some(id) => id,
            None => {
                let mut conn = self.redis.clone();
                let next: u64 = conn.incr(&keys.id, 1).await?;
                next.to_string()
            }
        };
        let run_at = opts
            .delay
            .filter(|d| !d.is_zero())
            .map(|d| after_delay(now, d));

        let job = JobRecord::new(queue, name, id, data, run_at, &opts);
        self.store_new(&keys, job).await
    }

    async fn repeating_entries(&self, queue: &str) -> Result<Vec<RepeatingEntry>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn.hvals(&keys.repeat).await?;

        let mut entries = Vec::with_capacity(raw.len());
        for data in raw {
            entries.push(serde_json::from_str::<RepeatingEntry>(&data)?);
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn remove_repeating(&self, queue: &str, key: &str) -> Result<bool, QueueError> {
        let keys = self.keys(queue);
        let Some(entry) = self.load_entry(&keys, key).await? else {
            return Ok(false);
        };

        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(&keys.repeat, key).await?;
        if !self.remove_job(queue, &entry.next_job_id).await? {
            debug!(queue = %queue, job_id = %entry.next_job_id, "Pending occurrence already gone");
        }
        Ok(true)
    }

    async fn jobs(&self, queue: &str, state: JobState) -> Result<Vec<JobRecord>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let ids: Vec<String> = match state {
            JobState::Waiting => conn.lrange(&keys.wait, 0, -1).await?,
            JobState::Active => conn.lrange(&keys.active, 0, -1).await?,
            JobState::Completed => conn.zrevrange(&keys.completed, 0, -1).await?,
            JobState::Failed => conn.zrevrange(&keys.failed, 0, -1).await?,
            JobState::Delayed => conn.zrange(&keys.delayed, 0, -1).await?,
        };

        let mut jobs = self.load_jobs(&keys, &ids).await?;
        for job in &mut jobs {
            job.state = state;
        }
        Ok(jobs)
    }

    async fn remove_job(&self, queue: &str, job_id: &str) -> Result<bool, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let removed: i64 = self
            .scripts
            .remove_job
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.completed)
            .key(&keys.failed)
            .key(keys.job(job_id))
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let (waiting, active, completed, failed, delayed, repeating): (
            usize,
            usize,
            usize,
            usize,
            usize,
            usize,
        ) = redis::pipe()
            .llen(&keys.wait)
            .llen(&keys.active)
            .zcard(&keys.completed)
            .zcard(&keys.failed)
            .zcard(&keys.delayed)
            .hlen(&keys.repeat)
            .query_async(&mut conn)
            .await?;

        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            repeating,
        })
    }

    async fn obliterate(&self, queue: &str) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let found = self.scan(&format!("{}:*", keys.base)).await?;

        let mut conn = self.redis.clone();
        for chunk in found.chunks(500) {
            conn.del::<_, ()>(chunk.to_vec()).await?;
        }
        debug!(queue = %queue, keys = found.len(), "Queue keys deleted");
        Ok(())
    }

    async fn fetch_next(&self, queue: &str, lease: Duration) -> Result<Option<JobRecord>, QueueError> {
        let recovered = self.recover_stalled(queue).await?;
        if !recovered.is_empty() {
            warn!(queue = %queue, jobs = ?recovered, "Recovered stalled jobs");
        }

        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        let now = Utc::now();

        let id: Option<String> = self
            .scripts
            .fetch
            .key(&keys.wait)
            .key(&keys.active)
            .key(&keys.delayed)
            .key(&keys.leases)
            .arg(now.timestamp_millis())
            .arg(after_delay(now, lease).timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let Some(mut job) = self.load_job(&keys, &id).await? else {
            warn!(queue = %queue, job_id = %id, "Fetched job has no stored record, dropping it");
            conn.lrem::<_, _, ()>(&keys.active, 0, &id).await?;
            conn.zrem::<_, _, ()>(&keys.leases, &id).await?;
            return Ok(None);
        };

        job.state = JobState::Active;
        job.processed_at = Some(now);
        conn.set::<_, _, ()>(keys.job(&id), serde_json::to_string(&job)?)
            .await?;

        if let Some(key) = job.repeat_key.clone() {
            if let Err(e) = self.schedule_next_occurrence(&keys, &job, &key).await {
                warn!(queue = %queue, repeat_key = %key, error = %e, "Failed to schedule next occurrence");
            }
        }

        Ok(Some(job))
    }

    async fn extend_lease(&self, job: &JobRecord, lease: Duration) -> Result<bool, QueueError> {
        let keys = self.keys(&job.queue);
        let mut conn = self.redis.clone();

        let extended: i64 = self
            .scripts
            .extend_lease
            .key(&keys.leases)
            .arg(&job.id)
            .arg(after_delay(Utc::now(), lease).timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn recover_stalled(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let recovered: Vec<String> = self
            .scripts
            .recover
            .key(&keys.wait)
            .key(&keys.active)
            .key(&keys.leases)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered)
    }

    async fn complete(&self, job: &JobRecord, result: Value) -> Result<(), QueueError> {
        let keys = self.keys(&job.queue);
        let mut conn = self.redis.clone();
        let now = Utc::now();

        let mut finished = job.clone();
        finished.state = JobState::Completed;
        finished.attempts_made += 1;
        finished.finished_at = Some(now);
        finished.return_value = Some(result);

        let trimmed: i64 = self
            .scripts
            .finish
            .key(&keys.active)
            .key(&keys.completed)
            .key(&keys.leases)
            .arg(&finished.id)
            .arg(serde_json::to_string(&finished)?)
            .arg(&keys.job_prefix)
            .arg(now.timestamp_millis())
            .arg(HISTORY_LIMIT)
            .invoke_async(&mut conn)
            .await?;
        if trimmed < 0 {
            warn!(queue = %job.queue, job_id = %job.id, "Job lost its lease before completing");
        }
        Ok(())
    }

    async fn fail(&self, job: &JobRecord, reason: &str) -> Result<JobState, QueueError> {
        let keys = self.keys(&job.queue);
        let mut conn = self.redis.clone();
        let now = Utc::now();

        let mut failed = job.clone();
        failed.attempts_made += 1;
        failed.failed_reason = Some(reason.to_string());

        if failed.can_retry() {
            let due = after_delay(now, failed.retry_delay());
            failed.state = JobState::Delayed;
            failed.run_at = Some(due);

            let moved: i64 = self
                .scripts
                .retry
                .key(&keys.active)
                .key(&keys.delayed)
                .key(keys.job(&failed.id))
                .key(&keys.leases)
                .arg(&failed.id)
                .arg(serde_json::to_string(&failed)?)
                .arg(due.timestamp_millis())
                .invoke_async(&mut conn)
                .await?;
            if moved < 0 {
                warn!(queue = %job.queue, job_id = %job.id, "Job lost its lease before failing");
                return Ok(JobState::Waiting);
            }
            return Ok(JobState::Delayed);
        }

        failed.state = JobState::Failed;
        failed.finished_at = Some(now);
        let trimmed: i64 = self
            .scripts
            .finish
            .key(&keys.active)
            .key(&keys.failed)
            .key(&keys.leases)
            .arg(&failed.id)
            .arg(serde_json::to_string(&failed)?)
            .arg(&keys.job_prefix)
            .arg(now.timestamp_millis())
            .arg(HISTORY_LIMIT)
            .invoke_async(&mut conn)
            .await?;
        if trimmed < 0 {
            warn!(queue = %job.queue, job_id = %job.id, "Job lost its lease before failing");
            return Ok(JobState::Waiting);
        }
        Ok(JobState::Failed)
    }
}
