//! Service facade.
//!
//! [`AgentService`] wires the queue registry, agent directory, dispatch
//! worker and task processor together and exposes the operations callers
//! use: agent and queue administration, task operator control, and the
//! executor callback.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::processor::{
    CallbackOutcome, CallbackPayload, HttpExecutor, LockStatus, LockStore, ProcessorConfig,
    RedisLockStore, TaskExecutor, TaskProcessor,
};
use crate::scheduler::backend::QueueBackend;
use crate::scheduler::directory::{
    AgentDirectory, AgentStatus, DelayedOutcome, DuplicateCheck, QueueInfo, RemovalReport,
};
use crate::scheduler::dispatch::DispatchWorker;
use crate::scheduler::job::{AgentConfig, JobRecord};
use crate::scheduler::queue::RedisQueueBackend;
use crate::scheduler::registry::{QueueRegistry, RegistryConfig};
use crate::storage::{BacklogStore, SqliteBacklog};

/// Stores and clients the service is built from.
pub struct ServiceComponents {
    pub backend: Arc<dyn QueueBackend>,
    pub backlog: Arc<dyn BacklogStore>,
    pub locks: Arc<dyn LockStore>,
    pub executor: Arc<dyn TaskExecutor>,
}

/// State of the task operator after an enable or disable call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOperatorState {
    pub enabled: bool,
    pub queue: String,
    /// A new tick job was enqueued by this call.
    pub tick_scheduled: bool,
    /// The new tick job, or the pending one that made scheduling a no-op.
    pub job_id: Option<String>,
}

/// Acknowledgement returned to the executor for every callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    pub received: bool,
    pub request_id: String,
    pub outcome: Option<CallbackOutcome>,
    pub error: Option<String>,
}

/// Facade over the dispatcher's components.
pub struct AgentService {
    directory: AgentDirectory,
    processor: Arc<TaskProcessor>,
    callback_secret: Option<String>,
}

impl AgentService {
    /// Connects to Redis, the backlog and the executor described by `config`.
    ///
    /// With `run_workers` off, queues are managed without processing jobs;
    /// administrative commands use that mode.
    pub async fn connect(config: &ServiceConfig, run_workers: bool) -> Result<Self, ServiceError> {
        config.validate()?;

        let backend = RedisQueueBackend::connect(&config.redis_url, &config.key_prefix).await?;
        let locks = RedisLockStore::from_connection(backend.connection());
        let backlog = SqliteBacklog::connect(&config.backlog_database_url)
            .await
            .map_err(|e| ServiceError::Backlog(e.to_string()))?;
        let executor = HttpExecutor::new(config.executor_base_url.clone(), config.executor_timeout)?;

        let components = ServiceComponents {
            backend: Arc::new(backend),
            backlog: Arc::new(backlog),
            locks: Arc::new(locks),
            executor: Arc::new(executor),
        };
        Ok(Self::assemble(components, config, run_workers))
    }

    /// Builds the service from ready components using `config`'s settings.
    pub fn assemble(components: ServiceComponents, config: &ServiceConfig, run_workers: bool) -> Self {
        let mut registry_config = config.registry_config();
        if !run_workers {
            registry_config = registry_config.without_workers();
        }
        Self::assemble_with(
            components,
            registry_config,
            config.processor_config(),
            config.job_attempts,
        )
    }

    /// Builds the service with explicit registry and processor settings.
    pub fn assemble_with(
        components: ServiceComponents,
        registry_config: RegistryConfig,
        processor_config: ProcessorConfig,
        job_attempts: u32,
    ) -> Self {
        let callback_secret = processor_config.callback_secret.clone();
        let registry = QueueRegistry::new(components.backend, registry_config);
        let directory = AgentDirectory::new(Arc::clone(&registry)).with_job_attempts(job_attempts);
        let processor = Arc::new(TaskProcessor::new(
            components.backlog,
            components.locks,
            components.executor,
            processor_config,
        ));

        registry.install_processor(Arc::new(DispatchWorker::new(
            directory.clone(),
            Arc::clone(&processor),
        )));

        Self {
            directory,
            processor,
            callback_secret,
        }
    }

    /// Creates the default queue and rediscovers existing queues.
    pub async fn start(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.directory.registry().start().await?)
    }

    /// Stops every worker and listener.
    pub async fn shutdown(&self) {
        self.directory.registry().shutdown().await;
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        self.directory.registry()
    }

    // Agents

    pub async fn create_agent(&self, config: AgentConfig) -> Result<JobRecord, ServiceError> {
        Ok(self.directory.create(config).await?)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentStatus>, ServiceError> {
        Ok(self.directory.list().await?)
    }

    pub async fn agent_status(&self, name: &str) -> Result<AgentStatus, ServiceError> {
        Ok(self.directory.status(name).await?)
    }

    pub async fn delete_agent(&self, name: &str) -> Result<RemovalReport, ServiceError> {
        let report = self.directory.remove(name).await?;
        if report.is_partial() {
            warn!(agent = %name, failures = ?report.failures, "Agent removal was partial");
        }
        Ok(report)
    }

    // Queues

    pub async fn list_queues(&self) -> Result<Vec<QueueInfo>, ServiceError> {
        Ok(self.directory.list_queues().await?)
    }

    pub async fn queue_info(&self, name: &str) -> Result<QueueInfo, ServiceError> {
        Ok(self.directory.info(name).await?)
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), ServiceError> {
        Ok(self.registry().delete(name).await?)
    }

    // Task operator

    /// Turns the task operator on and starts its tick chain.
    ///
    /// The first tick is enqueued immediately unless one is already waiting,
    /// delayed or running.
    pub async fn enable_task_operator(&self) -> Result<TaskOperatorState, ServiceError> {
        if !self.processor.set_enabled(true).await {
            return Err(ServiceError::Backlog(
                "failed to persist the task_operator setting".to_string(),
            ));
        }
        let state = self.schedule_tick().await?;
        info!(queue = %state.queue, tick_scheduled = state.tick_scheduled, "Task operator enabled");
        Ok(state)
    }

    /// Restarts the tick chain after a restart if the task operator is enabled.
    ///
    /// Returns `None` when the task operator is disabled.
    pub async fn resume_task_operator(&self) -> Result<Option<TaskOperatorState>, ServiceError> {
        if !self.processor.is_enabled().await {
            return Ok(None);
        }
        let state = self.schedule_tick().await?;
        if state.tick_scheduled {
            info!(queue = %state.queue, "Task operator tick chain resumed");
        }
        Ok(Some(state))
    }

    async fn schedule_tick(&self) -> Result<TaskOperatorState, ServiceError> {
        let queue = self.registry().task_operator_queue().to_string();
        let outcome = self
            .directory
            .create_delayed(
                AgentConfig::task_operator(queue.clone()),
                0,
                DuplicateCheck::IncludeActive,
            )
            .await?;

        let (tick_scheduled, job_id) = match outcome {
            DelayedOutcome::Scheduled(job) => (true, job.id),
            DelayedOutcome::Skipped { existing_job_id } => (false, existing_job_id),
        };
        Ok(TaskOperatorState {
            enabled: true,
            queue,
            tick_scheduled,
            job_id: Some(job_id),
        })
    }

    /// Turns the task operator off; the tick chain stops at its next run.
    pub async fn disable_task_operator(&self) -> Result<TaskOperatorState, ServiceError> {
        if !self.processor.set_enabled(false).await {
            return Err(ServiceError::Backlog(
                "failed to persist the task_operator setting".to_string(),
            ));
        }
        let queue = self.registry().task_operator_queue().to_string();
        info!(queue = %queue, "Task operator disabled");

        Ok(TaskOperatorState {
            enabled: false,
            queue,
            tick_scheduled: false,
            job_id: None,
        })
    }

    pub async fn task_operator_enabled(&self) -> bool {
        self.processor.is_enabled().await
    }

    pub async fn task_operator_lock(&self) -> Result<LockStatus, ServiceError> {
        Ok(self.processor.lock_status().await?)
    }

    /// Force-deletes the task operator lock. Returns whether a lock existed.
    pub async fn clear_task_operator_lock(&self) -> Result<bool, ServiceError> {
        Ok(self.processor.clear_lock().await?)
    }

    /// Handles an executor callback.
    ///
    /// # Errors
    ///
    /// Only a secret mismatch is an error; every other outcome, including
    /// internal failures, is acknowledged.
    pub async fn receive_callback(
        &self,
        secret: Option<&str>,
        payload: CallbackPayload,
    ) -> Result<CallbackAck, ServiceError> {
        if let Some(expected) = &self.callback_secret {
            if secret != Some(expected.as_str()) {
                warn!(request_id = %payload.request_id, "Rejected callback with bad secret");
                return Err(ServiceError::Unauthorized);
            }
        }

        match self.processor.handle_callback(&payload).await {
            Ok(outcome) => Ok(CallbackAck {
                received: true,
                request_id: payload.request_id,
                outcome: Some(outcome),
                error: None,
            }),
            Err(e) => {
                error!(request_id = %payload.request_id, error = %e, "Callback handling failed");
                Ok(CallbackAck {
                    received: true,
                    request_id: payload.request_id,
                    outcome: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{DispatchRequest, ExecutorError, MemoryLockStore};
    use crate::scheduler::job::{JobState, INTERNAL_TICK_URL};
    use crate::scheduler::memory::MemoryQueueBackend;
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl TaskExecutor for NoopExecutor {
        async fn new_conversation(&self) -> Result<String, ExecutorError> {
            Ok("conv".to_string())
        }

        async fn dispatch(&self, _request: &DispatchRequest) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    async fn service(secret: Option<&str>) -> (tempfile::TempDir, AgentService) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.db");
        let backlog = SqliteBacklog::connect(path.to_str().unwrap()).await.unwrap();

        let mut config = ServiceConfig::default();
        if let Some(secret) = secret {
            config = config.with_callback_secret(secret);
        }
        let components = ServiceComponents {
            backend: Arc::new(MemoryQueueBackend::new()),
            backlog: Arc::new(backlog),
            locks: Arc::new(MemoryLockStore::new()),
            executor: Arc::new(NoopExecutor),
        };
        (dir, AgentService::assemble(components, &config, false))
    }

    #[tokio::test]
    async fn test_enable_schedules_single_tick() {
        let (_dir, service) = service(None).await;

        let first = service.enable_task_operator().await.unwrap();
        assert!(first.enabled);
        assert!(first.tick_scheduled);
        assert!(service.task_operator_enabled().await);

        let second = service.enable_task_operator().await.unwrap();
        assert!(!second.tick_scheduled);
        assert_eq!(second.job_id, first.job_id);

        let jobs = service
            .registry()
            .backend()
            .jobs_in("task-operator", &[JobState::Waiting, JobState::Delayed])
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].data["targetUrl"], INTERNAL_TICK_URL);
    }

    #[tokio::test]
    async fn test_resume_only_when_enabled() {
        let (_dir, service) = service(None).await;
        assert!(service.resume_task_operator().await.unwrap().is_none());

        service.processor().set_enabled(true).await;
        let state = service.resume_task_operator().await.unwrap().unwrap();
        assert!(state.tick_scheduled);

        let again = service.resume_task_operator().await.unwrap().unwrap();
        assert!(!again.tick_scheduled);
    }

    #[tokio::test]
    async fn test_disable_task_operator() {
        let (_dir, service) = service(None).await;
        service.enable_task_operator().await.unwrap();
        let state = service.disable_task_operator().await.unwrap();
        assert!(!state.enabled);
        assert!(!service.task_operator_enabled().await);
    }

    #[tokio::test]
    async fn test_callback_secret_is_enforced() {
        let (_dir, service) = service(Some("s3cret")).await;
        let payload = CallbackPayload::succeeded("task-x");

        let err = service
            .receive_callback(Some("wrong"), payload.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
        assert!(service.receive_callback(None, payload.clone()).await.is_err());

        let ack = service
            .receive_callback(Some("s3cret"), payload)
            .await
            .unwrap();
        assert!(ack.received);
        assert_eq!(ack.outcome, Some(CallbackOutcome::Unknown { lock_cleared: false }));
    }

    #[tokio::test]
    async fn test_callback_without_secret_is_acknowledged() {
        let (_dir, service) = service(None).await;
        let ack = service
            .receive_callback(None, CallbackPayload::failed("task-y", "boom"))
            .await
            .unwrap();
        assert!(ack.received);
        assert_eq!(ack.request_id, "task-y");
    }

    #[tokio::test]
    async fn test_lock_admin() {
        let (_dir, service) = service(None).await;
        let status = service.task_operator_lock().await.unwrap();
        assert!(!status.is_locked);
        assert!(!service.clear_task_operator_lock().await.unwrap());
    }
}
