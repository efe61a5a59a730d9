//! Queue registry: one queue handle, worker and event listener per name.
//!
//! Handles are created lazily on first use and rebuilt at startup by
//! scanning the backend for queue markers, so queues created by another
//! replica (or before a restart) get workers too. Non-default queues are
//! torn down once nothing can run on them any more: after an agent is
//! removed, and after each job that leaves the queue for good.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::error::RegistryError;

use super::backend::QueueBackend;
use super::events::{JobEvent, QueueEvents, SettledHook};
use super::job::DEFAULT_QUEUE;
use super::worker_pool::{JobProcessor, QueueWorker, WorkerConfig, WorkerStats};

/// How a queue handle came to exist in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrigin {
    /// Created on demand by this process.
    Created,
    /// Found in the backend at startup.
    Discovered,
}

/// Configuration for the queue registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Queue that always exists and is never deleted.
    pub default_queue: String,
    /// Queue reserved for the task processor; its worker runs one job at a time.
    pub task_operator_queue: String,
    /// Worker settings for every other queue.
    pub worker: WorkerConfig,
    /// Start workers for queues. Administrative processes turn this off.
    pub run_workers: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            task_operator_queue: "task-operator".to_string(),
            worker: WorkerConfig::default(),
            run_workers: true,
        }
    }
}

impl RegistryConfig {
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_task_operator_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_operator_queue = queue.into();
        self
    }

    pub fn without_workers(mut self) -> Self {
        self.run_workers = false;
        self
    }

    /// Worker settings for the named queue.
    pub fn worker_config_for(&self, queue: &str) -> WorkerConfig {
        if queue == self.task_operator_queue {
            WorkerConfig {
                concurrency: 1,
                ..self.worker.clone()
            }
        } else {
            self.worker.clone()
        }
    }
}

/// A live queue: its worker (when running workers) and event listener.
pub struct QueueHandle {
    name: String,
    origin: QueueOrigin,
    created_at: DateTime<Utc>,
    concurrency: usize,
    worker: Option<QueueWorker>,
    events: QueueEvents,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> QueueOrigin {
        self.origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Configured worker concurrency.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns true if this process runs a worker for the queue.
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.worker.as_ref().map(QueueWorker::stats)
    }

    /// Subscribes to job events of this queue.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if let Some(worker) = &self.worker {
            if let Err(e) = worker.close().await {
                warn!(queue = %self.name, error = %e, "Worker did not stop cleanly");
            }
        }
        self.events.close();
    }
}

/// Returns `Ok` if the name can be used as a queue name.
pub fn validate_queue_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Registry of live queues for this process.
pub struct QueueRegistry {
    this: Weak<QueueRegistry>,
    backend: Arc<dyn QueueBackend>,
    config: RegistryConfig,
    processor: OnceLock<Arc<dyn JobProcessor>>,
    queues: RwLock<HashMap<String, Arc<QueueHandle>>>,
}

impl QueueRegistry {
    /// Creates an empty registry.
    ///
    /// A processor must be installed with [`QueueRegistry::install_processor`]
    /// before any queue is created when `config.run_workers` is set.
    pub fn new(backend: Arc<dyn QueueBackend>, config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            backend,
            config,
            processor: OnceLock::new(),
            queues: RwLock::new(HashMap::new()),
        })
    }

    /// Installs the processor every worker hands jobs to.
    ///
    /// Returns `false` if a processor was already installed.
    pub fn install_processor(&self, processor: Arc<dyn JobProcessor>) -> bool {
        self.processor.set(processor).is_ok()
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    pub fn task_operator_queue(&self) -> &str {
        &self.config.task_operator_queue
    }

    /// Creates the default queue and a handle for every queue found in the backend.
    ///
    /// A queue that fails to start is logged and skipped. Returns the names
    /// of the queues that are live afterwards.
    pub async fn start(&self) -> Result<Vec<String>, RegistryError> {
        self.get_or_create(&self.config.default_queue).await?;

        let discovered = match self.backend.discover_queues().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Queue discovery failed, continuing with default queue only");
                Vec::new()
            }
        };

        for name in &discovered {
            if let Err(e) = self.materialize(name, QueueOrigin::Discovered).await {
                warn!(queue = %name, error = %e, "Skipping discovered queue");
            }
        }

        let live = self.live_queues().await;
        info!(queues = ?live, "Queue registry started");
        Ok(live)
    }

    /// Returns the handle for a queue, creating queue, worker and listener
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidName` for names outside
    /// `[A-Za-z0-9._-]`, or a backend error if the queue marker can't be written.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<QueueHandle>, RegistryError> {
        self.materialize(name, QueueOrigin::Created).await
    }

    async fn materialize(
        &self,
        name: &str,
        origin: QueueOrigin,
    ) -> Result<Arc<QueueHandle>, RegistryError> {
        validate_queue_name(name)?;

        if let Some(handle) = self.queues.read().await.get(name) {
            return Ok(Arc::clone(handle));
        }

        let mut queues = self.queues.write().await;
        if let Some(handle) = queues.get(name) {
            return Ok(Arc::clone(handle));
        }

        self.backend.ensure_queue(name).await?;

        let worker_config = self.config.worker_config_for(name);
        let events = QueueEvents::start(name, self.cleanup_hook(name));
        let worker = if self.config.run_workers {
            let processor = self
                .processor
                .get()
                .ok_or(RegistryError::ProcessorMissing)?;
            Some(QueueWorker::start(
                name,
                Arc::clone(&self.backend),
                Arc::clone(processor),
                worker_config.clone(),
                events.sender(),
            ))
        } else {
            None
        };

        let handle = Arc::new(QueueHandle {
            name: name.to_string(),
            origin,
            created_at: Utc::now(),
            concurrency: worker_config.concurrency,
            worker,
            events,
        });
        queues.insert(name.to_string(), Arc::clone(&handle));

        debug!(queue = %name, origin = ?origin, "Queue handle created");
        Ok(handle)
    }

    /// Hook that checks a non-default queue for cleanup once a job settles.
    ///
    /// The check runs on its own task because deleting the queue closes the
    /// listener that fires the hook.
    fn cleanup_hook(&self, name: &str) -> Option<SettledHook> {
        if name == self.config.default_queue {
            return None;
        }
        let registry = self.this.clone();
        Some(Arc::new(move |queue: String| {
            if let Some(registry) = registry.upgrade() {
                tokio::spawn(async move {
                    registry.check_and_cleanup_empty_queue(&queue).await;
                });
            }
        }))
    }

    /// Returns the handle of a live queue.
    pub async fn get(&self, name: &str) -> Option<Arc<QueueHandle>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Names of queues with a handle in this process, sorted.
    pub async fn live_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of every known queue: live handles plus queues found in the backend.
    pub async fn known_queues(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.live_queues().await.into_iter().collect();
        match self.backend.discover_queues().await {
            Ok(found) => names.extend(found),
            Err(e) => warn!(error = %e, "Queue discovery failed, listing live queues only"),
        }
        names.into_iter().collect()
    }

    /// Returns true if the queue has a handle here or a marker in the backend.
    pub async fn exists(&self, name: &str) -> Result<bool, RegistryError> {
        if self.queues.read().await.contains_key(name) {
            return Ok(true);
        }
        Ok(self
            .backend
            .discover_queues()
            .await?
            .iter()
            .any(|q| q == name))
    }

    /// Deletes an empty, non-default queue.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DefaultQueueProtected` for the default queue
    /// - `RegistryError::QueueNotFound` if the queue is unknown
    /// - `RegistryError::QueueNotEmpty` if any waiting, active or delayed job
    ///   or repeating entry remains
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        if name == self.config.default_queue {
            return Err(RegistryError::DefaultQueueProtected(name.to_string()));
        }
        if !self.exists(name).await? {
            return Err(RegistryError::QueueNotFound(name.to_string()));
        }

        let counts = self.backend.counts(name).await?;
        if !counts.is_drained() {
            return Err(RegistryError::QueueNotEmpty {
                name: name.to_string(),
                pending: counts.pending(),
            });
        }

        let handle = self.queues.write().await.remove(name);
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.backend.obliterate(name).await?;

        info!(queue = %name, "Queue deleted");
        Ok(())
    }

    /// Deletes the queue if it is non-default and has nothing left to run.
    ///
    /// Never fails; problems are logged. Returns true if the queue was deleted.
    pub async fn check_and_cleanup_empty_queue(&self, name: &str) -> bool {
        if name == self.config.default_queue {
            return false;
        }

        match self.backend.counts(name).await {
            Ok(counts) if counts.is_drained() => match self.delete(name).await {
                Ok(()) => {
                    info!(queue = %name, "Empty queue cleaned up");
                    true
                }
                Err(e) => {
                    warn!(queue = %name, error = %e, "Empty queue cleanup failed");
                    false
                }
            },
            Ok(_) => false,
            Err(e) => {
                warn!(queue = %name, error = %e, "Could not count jobs for cleanup");
                false
            }
        }
    }

    /// Stops every worker and listener.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<QueueHandle>> = self.queues.write().await.drain().map(|(_, h)| h).collect();
        futures::future::join_all(handles.iter().map(|h| h.close())).await;
        info!(queues = handles.len(), "Queue registry shut down");
    }
}
