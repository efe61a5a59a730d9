//! Per-queue workers.
//!
//! A [`QueueWorker`] runs a fixed number of slots against one queue. Each slot
//! is an independent async task that fetches a job, hands it to the shared
//! [`JobProcessor`], and reports the outcome to the backend and the queue's
//! event channel.
//!
//! # Features
//!
//! - Bounded concurrency per queue
//! - Job leases extended while a job runs
//! - Graceful shutdown with broadcast channel
//! - Retry and failure bookkeeping delegated to the backend
//! - Worker statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;

use super::backend::{QueueBackend, DEFAULT_LEASE};
use super::events::JobEvent;
use super::job::{JobRecord, JobState};

/// Errors that can occur while running a queue worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Processes one job; a returned error fails the attempt.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &JobRecord) -> Result<Value, DispatchError>;
}

/// Configuration for a queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of jobs processed at the same time.
    pub concurrency: usize,
    /// How often to poll for new jobs when the queue is empty.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Lease held on a running job; renewed at half this interval.
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            lease: DEFAULT_LEASE,
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration with the given concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the job lease, at least [`MIN_LEASE`].
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(MIN_LEASE);
        self
    }
}

/// Shortest lease a worker takes on a job.
pub const MIN_LEASE: Duration = Duration::from_millis(10);

/// Statistics about a queue worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub concurrency: usize,
    /// Slots currently processing a job.
    pub active_jobs: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub average_job_duration: Duration,
}

impl WorkerStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }
}

/// Shared state for tracking worker statistics.
#[derive(Default)]
struct SharedWorkerStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_jobs: AtomicU64,
}

impl SharedWorkerStats {
    fn record(&self, succeeded: bool, duration: Duration) {
        let counter = if succeeded {
            &self.jobs_completed
        } else {
            &self.jobs_failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn snapshot(&self, concurrency: usize) -> WorkerStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_jobs = completed + failed;
        let average_job_duration = if total_jobs > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total_jobs)
        } else {
            Duration::ZERO
        };

        WorkerStats {
            concurrency,
            active_jobs: self.active_jobs.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration,
        }
    }
}

/// Worker processing jobs of a single queue.
pub struct QueueWorker {
    queue: String,
    config: WorkerConfig,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SharedWorkerStats>,
}

impl QueueWorker {
    /// Spawns `config.concurrency` slots polling `queue`.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue to process
    /// * `backend` - Backend the queue lives in
    /// * `processor` - Handler for every job
    /// * `config` - Concurrency and polling settings
    /// * `events` - Channel receiving one event per finished attempt
    pub fn start(
        queue: &str,
        backend: Arc<dyn QueueBackend>,
        processor: Arc<dyn JobProcessor>,
        config: WorkerConfig,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(SharedWorkerStats::default());

        let handles = (0..config.concurrency)
            .map(|slot| {
                let worker = WorkerSlot {
                    id: format!("{}#{}", queue, slot),
                    queue: queue.to_string(),
                    backend: Arc::clone(&backend),
                    processor: Arc::clone(&processor),
                    shutdown_rx: shutdown_tx.subscribe(),
                    poll_interval: config.poll_interval,
                    lease: config.lease,
                    events: events.clone(),
                    stats: Arc::clone(&stats),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(queue = %queue, concurrency = config.concurrency, "Queue worker started");

        Self {
            queue: queue.to_string(),
            config,
            shutdown_tx,
            handles: Mutex::new(handles),
            stats,
        }
    }

    /// Stops every slot, letting in-flight jobs finish.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ShutdownTimeout` if slots don't stop within the
    /// configured timeout; they are aborted in that case.
    pub async fn close(&self) -> Result<(), WorkerError> {
        // Slots may already be gone.
        let _ = self.shutdown_tx.send(());

        let mut handles = self.handles.lock().await;
        let pending: Vec<JoinHandle<()>> = handles.drain(..).collect();
        let aborts: Vec<_> = pending.iter().map(|h| h.abort_handle()).collect();

        let joined = async {
            for handle in pending {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(queue = %self.queue, error = %e, "Worker slot panicked during shutdown");
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, joined).await {
            Ok(()) => {
                info!(queue = %self.queue, "Queue worker stopped");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                Err(WorkerError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot(self.config.concurrency)
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// One concurrent slot of a queue worker.
struct WorkerSlot {
    id: String,
    queue: String,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn JobProcessor>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    lease: Duration,
    events: broadcast::Sender<JobEvent>,
    stats: Arc<SharedWorkerStats>,
}

impl WorkerSlot {
    /// Polls for jobs until a shutdown signal arrives.
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker slot started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let idle = match self.backend.fetch_next(&self.queue, self.lease).await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to fetch job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        debug!(worker_id = %self.id, "Worker slot stopped");
    }

    async fn process_job(&self, job: JobRecord) {
        let start_time = Instant::now();
        let agent = job.agent_name().to_string();

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            agent = %agent,
            attempt = job.attempts_made + 1,
            "Processing job"
        );

        self.stats.active_jobs.fetch_add(1, Ordering::SeqCst);
        let result = self.process_leased(&job).await;
        self.stats.active_jobs.fetch_sub(1, Ordering::SeqCst);
        self.stats.record(result.is_ok(), start_time.elapsed());

        let event = match result {
            Ok(value) => {
                if let Err(e) = self.backend.complete(&job, value).await {
                    error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to mark job complete");
                }
                JobEvent::Completed {
                    queue: self.queue.clone(),
                    job_id: job.id.clone(),
                    agent,
                }
            }
            Err(err) => {
                let reason = err.to_string();
                let will_retry = match self.backend.fail(&job, &reason).await {
                    Ok(state) => state != JobState::Failed,
                    Err(e) => {
                        error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to record job failure");
                        false
                    }
                };
                JobEvent::Failed {
                    queue: self.queue.clone(),
                    job_id: job.id.clone(),
                    agent,
                    error: reason,
                    will_retry,
                }
            }
        };

        if self.events.send(event).is_err() {
            warn!(worker_id = %self.id, job_id = %job.id, "No event listener for queue");
        }
    }

    /// Runs the processor while extending the job's lease.
    async fn process_leased(&self, job: &JobRecord) -> Result<Value, DispatchError> {
        let processing = self.processor.process(job);
        tokio::pin!(processing);

        let mut heartbeat = tokio::time::interval((self.lease / 2).max(MIN_LEASE / 2));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut processing => return result,
                _ = heartbeat.tick() => match self.backend.extend_lease(job, self.lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(worker_id = %self.id, job_id = %job.id, "Job lease lost while processing");
                    }
                    Err(e) => {
                        warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to extend job lease");
                    }
                },
            }
        }
    }
}
