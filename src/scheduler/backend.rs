//! Queue backend contract.
//!
//! A backend stores named queues of jobs and provides at-least-once delivery,
//! per-job delay and repeat scheduling, and a queryable index of job states.
//! [`RedisQueueBackend`](super::queue::RedisQueueBackend) is the production
//! implementation; [`MemoryQueueBackend`](super::memory::MemoryQueueBackend)
//! keeps everything in process.
//!
//! # Ordering
//!
//! Every enumeration is newest-first, except delayed jobs which are returned
//! in the order they become due.
//!
//! # Leases
//!
//! A fetched job is leased to its worker for a limited time. The worker
//! extends the lease while it runs; once a lease expires the job is moved
//! back to waiting and delivered again.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::job::{JobCounts, JobOptions, JobRecord, JobState, RepeatingEntry};

/// Errors that can occur during queue backend operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the backend.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a job.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// A repeat pattern could not be parsed.
    #[error("Invalid schedule '{pattern}': {reason}")]
    InvalidSchedule { pattern: String, reason: String },

    /// A repeat pattern never fires again.
    #[error("Schedule '{0}' has no upcoming fire time")]
    ScheduleExhausted(String),
}

/// Storage and delivery of jobs for named queues.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Writes the metadata marker that makes a queue discoverable.
    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Lists every queue that has a metadata marker.
    async fn discover_queues(&self) -> Result<Vec<String>, QueueError>;

    /// Adds a job.
    ///
    /// With `opts.job_id` set and a job of that id already stored, nothing is
    /// added and the stored job is returned. With `opts.repeat` set, the
    /// repeating entry for the key is created or replaced and the returned job
    /// is its first delayed occurrence.
    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<JobRecord, QueueError>;

    /// Lists repeating entries of a queue.
    async fn repeating_entries(&self, queue: &str) -> Result<Vec<RepeatingEntry>, QueueError>;

    /// Removes a repeating entry and its pending occurrence.
    ///
    /// Returns `false` if no entry had that key.
    async fn remove_repeating(&self, queue: &str, key: &str) -> Result<bool, QueueError>;

    /// Lists jobs in one state.
    async fn jobs(&self, queue: &str, state: JobState) -> Result<Vec<JobRecord>, QueueError>;

    /// Lists jobs in several states, concatenated in the order given.
    async fn jobs_in(
        &self,
        queue: &str,
        states: &[JobState],
    ) -> Result<Vec<JobRecord>, QueueError> {
        let mut all = Vec::new();
        for state in states {
            all.extend(self.jobs(queue, *state).await?);
        }
        Ok(all)
    }

    /// Removes a job that is not active.
    ///
    /// Returns `false` if the job does not exist or is being processed.
    async fn remove_job(&self, queue: &str, job_id: &str) -> Result<bool, QueueError>;

    /// Counts jobs per state.
    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError>;

    /// Deletes every job, entry and marker of a queue.
    async fn obliterate(&self, queue: &str) -> Result<(), QueueError>;

    /// Recovers stalled jobs, promotes due delayed jobs and moves the oldest
    /// waiting job to active, leased for `lease`.
    ///
    /// When the fetched job is an occurrence of a repeating entry, the next
    /// occurrence is scheduled before returning.
    async fn fetch_next(&self, queue: &str, lease: Duration) -> Result<Option<JobRecord>, QueueError>;

    /// Pushes the lease of an active job to `lease` from now.
    ///
    /// Returns `false` if the job no longer holds a lease, which means it was
    /// recovered and may be delivered again.
    async fn extend_lease(&self, job: &JobRecord, lease: Duration) -> Result<bool, QueueError>;

    /// Moves active jobs whose lease expired back to waiting.
    ///
    /// Returns the ids of the recovered jobs.
    async fn recover_stalled(&self, queue: &str) -> Result<Vec<String>, QueueError>;

    /// Moves an active job to completed.
    ///
    /// A job that lost its lease is left where recovery put it.
    async fn complete(&self, job: &JobRecord, result: Value) -> Result<(), QueueError>;

    /// Records a failed attempt of an active job.
    ///
    /// Returns the state the job ends up in: `Delayed` when another attempt
    /// is scheduled, `Failed` when attempts are exhausted, `Waiting` when the
    /// job lost its lease and was already recovered.
    async fn fail(&self, job: &JobRecord, reason: &str) -> Result<JobState, QueueError>;
}

/// Lease granted to a fetched job unless the worker asks for another.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Number of completed or failed jobs retained per queue.
pub const HISTORY_LIMIT: usize = 100;
