//! In-process queue backend.
//!
//! Mirrors the Redis backend's semantics with plain collections behind a
//! mutex. Used by tests and by single-process setups without Redis.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use super::backend::{QueueBackend, QueueError, HISTORY_LIMIT};
use super::job::{JobCounts, JobOptions, JobRecord, JobState, RepeatingEntry};

/// Adds a std duration to a timestamp, saturating at `now` on overflow.
pub(crate) fn after_delay(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

#[derive(Debug, Default)]
struct MemoryQueue {
    jobs: HashMap<String, JobRecord>,
    // Front is newest.
    waiting: VecDeque<String>,
    active: VecDeque<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    delayed: Vec<String>,
    repeating: BTreeMap<String, RepeatingEntry>,
    // Lease expiry of each active job.
    leases: HashMap<String, DateTime<Utc>>,
    next_id: u64,
}

impl MemoryQueue {
    fn insert(&mut self, job: JobRecord) {
        let id = job.id.clone();
        match job.state {
            JobState::Delayed => self.delayed.push(id.clone()),
            _ => self.waiting.push_front(id.clone()),
        }
        self.jobs.insert(id, job);
    }

    fn detach(&mut self, id: &str) {
        self.waiting.retain(|j| j != id);
        self.delayed.retain(|j| j != id);
        self.completed.retain(|j| j != id);
        self.failed.retain(|j| j != id);
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.active.iter().any(|j| j == id) {
            return false;
        }
        self.detach(id);
        self.jobs.remove(id).is_some()
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .delayed
            .iter()
            .filter_map(|id| {
                let run_at = self.jobs.get(id)?.run_at.unwrap_or(now);
                (run_at <= now).then(|| (run_at, id.clone()))
            })
            .collect();
        due.sort();

        for (_, id) in due {
            self.delayed.retain(|j| j != &id);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
            self.waiting.push_front(id);
        }
    }

    /// Moves active jobs with an expired lease to the fetch end of waiting.
    fn recover(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired: Vec<(DateTime<Utc>, String)> = self
            .leases
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, until)| (*until, id.clone()))
            .collect();
        expired.sort();

        let mut recovered = Vec::with_capacity(expired.len());
        for (_, id) in expired {
            self.leases.remove(&id);
            if !self.active.iter().any(|j| j == &id) {
                continue;
            }
            self.active.retain(|j| j != &id);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
            self.waiting.push_back(id.clone());
            recovered.push(id);
        }
        recovered
    }

    /// Releases the lease of an active job. Returns false if the job is not active.
    fn release(&mut self, id: &str) -> bool {
        self.leases.remove(id);
        let held = self.active.iter().any(|j| j == id);
        self.active.retain(|j| j != id);
        held
    }

    fn trim(list: &mut VecDeque<String>, jobs: &mut HashMap<String, JobRecord>) {
        while list.len() > HISTORY_LIMIT {
            if let Some(id) = list.pop_back() {
                jobs.remove(&id);
            }
        }
    }

    fn collect(&self, ids: impl Iterator<Item = String>) -> Vec<JobRecord> {
        ids.filter_map(|id| self.jobs.get(&id).cloned()).collect()
    }
}

/// Queue backend holding every queue in memory.
#[derive(Debug, Default)]
pub struct MemoryQueueBackend {
    queues: Mutex<HashMap<String, MemoryQueue>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn discover_queues(&self) -> Result<Vec<String>, QueueError> {
        let mut names: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let q = queues.entry(queue.to_string()).or_default();

        if let Some(repeat) = opts.repeat.clone() {
            let next_run = repeat
                .schedule
                .next_after(now)
                .ok_or_else(|| QueueError::ScheduleExhausted(repeat.schedule.pattern()))?;
            if let Some(old) = q.repeating.remove(&repeat.key) {
                q.remove(&old.next_job_id);
            }
            let entry = RepeatingEntry {
                next_job_id: RepeatingEntry::occurrence_id(&repeat.key, next_run),
                key: repeat.key.clone(),
                name: name.to_string(),
                queue: queue.to_string(),
                schedule: repeat.schedule,
                next_run,
                data,
                attempts: opts.attempts,
                backoff_ms: opts.backoff_ms,
            };
            let job = entry.occurrence();
            q.insert(job.clone());
            q.repeating.insert(repeat.key, entry);
            return Ok(job);
        }

        let id = match opts.job_id.clone() {
            Some(id) => id,
            None => {
                q.next_id += 1;
                q.next_id.to_string()
            }
        };
        if let Some(existing) = q.jobs.get(&id) {
            return Ok(existing.clone());
        }

        let run_at = opts
            .delay
            .filter(|d| !d.is_zero())
            .map(|d| after_delay(now, d));
        let job = JobRecord::new(queue, name, id, data, run_at, &opts);
        q.insert(job.clone());
        Ok(job)
    }

    async fn repeating_entries(&self, queue: &str) -> Result<Vec<RepeatingEntry>, QueueError> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.repeating.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_repeating(&self, queue: &str, key: &str) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(false);
        };
        match q.repeating.remove(key) {
            Some(entry) => {
                q.remove(&entry.next_job_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn jobs(&self, queue: &str, state: JobState) -> Result<Vec<JobRecord>, QueueError> {
        let queues = self.queues.lock().await;
        let Some(q) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        let jobs = match state {
            JobState::Waiting => q.collect(q.waiting.iter().cloned()),
            JobState::Active => q.collect(q.active.iter().cloned()),
            JobState::Completed => q.collect(q.completed.iter().cloned()),
            JobState::Failed => q.collect(q.failed.iter().cloned()),
            JobState::Delayed => {
                let mut delayed = q.collect(q.delayed.iter().cloned());
                delayed.sort_by_key(|j| j.run_at);
                delayed
            }
        };
        Ok(jobs)
    }

    async fn remove_job(&self, queue: &str, job_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .queues
            .lock()
            .await
            .get_mut(queue)
            .map(|q| q.remove(job_id))
            .unwrap_or(false))
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|q| JobCounts {
                waiting: q.waiting.len(),
                active: q.active.len(),
                completed: q.completed.len(),
                failed: q.failed.len(),
                delayed: q.delayed.len(),
                repeating: q.repeating.len(),
            })
            .unwrap_or_default())
    }

    async fn obliterate(&self, queue: &str) -> Result<(), QueueError> {
        self.queues.lock().await.remove(queue);
        Ok(())
    }

    async fn fetch_next(&self, queue: &str, lease: Duration) -> Result<Option<JobRecord>, QueueError> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let recovered = q.recover(now);
        if !recovered.is_empty() {
            warn!(queue = %queue, jobs = ?recovered, "Recovered stalled jobs");
        }
        q.promote_due(now);
        let Some(id) = q.waiting.pop_back() else {
            return Ok(None);
        };
        let Some(job) = q.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.processed_at = Some(now);
        let fetched = job.clone();
        q.leases.insert(id.clone(), after_delay(now, lease));
        q.active.push_front(id);

        if let Some(key) = fetched.repeat_key.as_deref() {
            if let Some(entry) = q.repeating.get(key).cloned() {
                if entry.next_job_id == fetched.id {
                    let base = fetched.run_at.unwrap_or(now).max(now);
                    match entry.schedule.next_after(base) {
                        Some(next_run) => {
                            let next = RepeatingEntry {
                                next_run,
                                next_job_id: RepeatingEntry::occurrence_id(key, next_run),
                                ..entry
                            };
                            q.insert(next.occurrence());
                            q.repeating.insert(key.to_string(), next);
                        }
                        None => {
                            q.repeating.remove(key);
                        }
                    }
                }
            }
        }

        Ok(Some(fetched))
    }

    async fn extend_lease(&self, job: &JobRecord, lease: Duration) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(&job.queue) else {
            return Ok(false);
        };
        match q.leases.get_mut(&job.id) {
            Some(until) => {
                *until = after_delay(Utc::now(), lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recover_stalled(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(queue)
            .map(|q| q.recover(Utc::now()))
            .unwrap_or_default())
    }

    async fn complete(&self, job: &JobRecord, result: Value) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(&job.queue) else {
            return Ok(());
        };
        if !q.release(&job.id) {
            warn!(queue = %job.queue, job_id = %job.id, "Job lost its lease before completing");
            return Ok(());
        }
        let Some(stored) = q.jobs.get_mut(&job.id) else {
            return Ok(());
        };
        stored.state = JobState::Completed;
        stored.attempts_made += 1;
        stored.finished_at = Some(Utc::now());
        stored.return_value = Some(result);
        q.completed.push_front(job.id.clone());
        MemoryQueue::trim(&mut q.completed, &mut q.jobs);
        Ok(())
    }

    async fn fail(&self, job: &JobRecord, reason: &str) -> Result<JobState, QueueError> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(&job.queue) else {
            return Ok(JobState::Failed);
        };
        if !q.release(&job.id) {
            warn!(queue = %job.queue, job_id = %job.id, "Job lost its lease before failing");
            return Ok(JobState::Waiting);
        }
        let Some(stored) = q.jobs.get_mut(&job.id) else {
            return Ok(JobState::Failed);
        };
        stored.attempts_made += 1;
        stored.failed_reason = Some(reason.to_string());

        if stored.can_retry() {
            stored.state = JobState::Delayed;
            stored.run_at = Some(after_delay(now, stored.retry_delay()));
            q.delayed.push(job.id.clone());
            Ok(JobState::Delayed)
        } else {
            stored.state = JobState::Failed;
            stored.finished_at = Some(now);
            q.failed.push_front(job.id.clone());
            MemoryQueue::trim(&mut q.failed, &mut q.jobs);
            Ok(JobState::Failed)
        }
    }
}
