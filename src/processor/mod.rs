//! Singleton task processor.
//!
//! Pulls prompts from the backlog and hands them to the executor, one at a
//! time across every replica sharing the same Redis. A tick walks this state
//! machine:
//!
//! ```text
//!   IDLE ──acquire──► LOCK_HELD ──pull──► NO_TASK ──release──► IDLE
//!                         │
//!                         └──claim + dispatch──► AWAITING_CALLBACK
//!                                                     │
//!                            callback or stale reap ──► RESOLVED ──release──► IDLE
//! ```
//!
//! The lock stays held between a successful dispatch and its callback, so
//! ticks on any replica report `LockHeld` until the executor answers or the
//! entry goes stale.

pub mod backoff;
pub mod executor;
pub mod lock;
pub mod pending;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::ProcessorError;
use crate::storage::{BacklogStore, TaskStatus, TASK_OPERATOR_SETTING};

pub use backoff::RetryPolicy;
pub use executor::{DispatchRequest, ExecutorError, HttpExecutor, TaskExecutor};
pub use lock::{LockError, LockStatus, LockStore, LockToken, MemoryLockStore, RedisLockStore};
pub use pending::{PendingTask, PendingTasks};

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3600);

/// Default age after which an unanswered dispatch is reclaimed.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Path the executor calls back on, relative to the callback base URL.
pub const CALLBACK_PATH: &str = "/task-operator/callback";

/// Lock key for a queue key prefix.
pub fn lock_key_for(prefix: &str) -> String {
    format!("{}:task-operator:lock", prefix)
}

/// Configuration for a [`TaskProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub stale_after: Duration,
    /// Base URL the executor reaches this service on.
    pub callback_base_url: String,
    pub callback_secret: Option<String>,
    pub retry: RetryPolicy,
    /// Process id written into lock tokens.
    pub pid: u32,
}

impl ProcessorConfig {
    pub fn new(key_prefix: &str, callback_base_url: impl Into<String>) -> Self {
        Self {
            lock_key: lock_key_for(key_prefix),
            lock_ttl: DEFAULT_LOCK_TTL,
            stale_after: DEFAULT_STALE_AFTER,
            callback_base_url: callback_base_url.into(),
            callback_secret: None,
            retry: RetryPolicy::default(),
            pid: std::process::id(),
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_callback_secret(mut self, secret: Option<String>) -> Self {
        self.callback_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Full callback URL sent with every dispatch.
    pub fn callback_url(&self) -> String {
        let url = format!(
            "{}{}",
            self.callback_base_url.trim_end_matches('/'),
            CALLBACK_PATH
        );
        let Some(secret) = &self.callback_secret else {
            return url;
        };
        match reqwest::Url::parse(&url) {
            Ok(mut parsed) => {
                parsed.query_pairs_mut().append_pair("secret", secret);
                parsed.to_string()
            }
            Err(_) => format!("{}?secret={}", url, secret),
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// A task was handed to the executor; the lock stays held.
    Processed { task_id: i64 },
    /// The backlog had nothing runnable.
    NoTasks,
    /// Another holder owns the lock.
    LockHeld,
    /// Dispatch failed; the task went back to READY and the lock was released.
    Failed { task_id: i64, error: String },
}

/// Non-fatal problem encountered during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickWarning {
    StaleReaped { task_id: i64, request_id: String },
    StatusUpdateFailed { task_id: i64, status: i64 },
    ConversationUnavailable { error: String },
    LockReleaseFailed { error: String },
}

impl fmt::Display for TickWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickWarning::StaleReaped {
                task_id,
                request_id,
            } => write!(f, "reclaimed stale task {} ({})", task_id, request_id),
            TickWarning::StatusUpdateFailed { task_id, status } => {
                write!(f, "could not set task {} to status {}", task_id, status)
            }
            TickWarning::ConversationUnavailable { error } => {
                write!(f, "no conversation id: {}", error)
            }
            TickWarning::LockReleaseFailed { error } => write!(f, "lock release failed: {}", error),
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub warnings: Vec<TickWarning>,
}

impl TickReport {
    fn new(outcome: TickOutcome, warnings: Vec<TickWarning>) -> Self {
        Self { outcome, warnings }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self.outcome, TickOutcome::Processed { .. })
    }
}

/// Body the executor posts back when a dispatched prompt finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub request_id: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub iterations: Option<u64>,
}

impl CallbackPayload {
    pub fn succeeded(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: Some(true),
            error: None,
            output: None,
            iterations: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: Some(false),
            error: Some(error.into()),
            output: None,
            iterations: None,
        }
    }
}

/// How a callback was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Completed { task_id: i64 },
    Reset { task_id: i64 },
    /// No pending entry matched; a lock held by another pid was cleared.
    Unknown { lock_cleared: bool },
}

/// The task processor. Build one per process and share it behind `Arc`.
pub struct TaskProcessor {
    backlog: Arc<dyn BacklogStore>,
    locks: Arc<dyn LockStore>,
    executor: Arc<dyn TaskExecutor>,
    config: ProcessorConfig,
    pending: PendingTasks,
    held: Mutex<Option<LockToken>>,
    // Failed executor calls since the last successful one, across ticks.
    // Reported only; the retry budget is counted per dispatch.
    consecutive_errors: AtomicU32,
}

impl TaskProcessor {
    pub fn new(
        backlog: Arc<dyn BacklogStore>,
        locks: Arc<dyn LockStore>,
        executor: Arc<dyn TaskExecutor>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            backlog,
            locks,
            executor,
            config,
            pending: PendingTasks::new(),
            held: Mutex::new(None),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Runs one pass of the state machine.
    ///
    /// # Errors
    ///
    /// Only a failing lock store aborts a tick; backlog and executor failures
    /// are compensated and reported in the returned [`TickReport`].
    pub async fn tick(&self) -> Result<TickReport, ProcessorError> {
        let mut warnings = self.reap_stale().await;

        let token = LockToken::generate(self.config.pid);
        if !self
            .locks
            .try_acquire(&self.config.lock_key, &token, self.config.lock_ttl)
            .await?
        {
            debug!(key = %self.config.lock_key, "Task operator lock held elsewhere");
            return Ok(TickReport::new(TickOutcome::LockHeld, warnings));
        }
        *self.held.lock().await = Some(token);

        let Some(task) = self.backlog.next_ready_task().await else {
            warnings.extend(self.release_lock().await);
            debug!("No runnable backlog tasks");
            return Ok(TickReport::new(TickOutcome::NoTasks, warnings));
        };

        info!(task_id = task.id, order = task.order, "Claiming backlog task");
        if !self
            .backlog
            .update_task_status(task.id, TaskStatus::InProgress)
            .await
        {
            warnings.push(TickWarning::StatusUpdateFailed {
                task_id: task.id,
                status: TaskStatus::IN_PROGRESS,
            });
        }

        let conversation_id = match self.executor.new_conversation().await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Continuing without conversation id");
                warnings.push(TickWarning::ConversationUnavailable {
                    error: e.to_string(),
                });
                None
            }
        };

        let request = DispatchRequest {
            prompt: task.prompt.clone(),
            request_id: pending::new_request_id(),
            callback_url: self.config.callback_url(),
            conversation_id,
            task_id: task.id,
        };
        self.pending
            .insert(PendingTask::new(&request.request_id, task.id))
            .await;

        match self.dispatch_with_retry(&request).await {
            Ok(()) => {
                info!(task_id = task.id, request_id = %request.request_id, "Task dispatched");
                Ok(TickReport::new(
                    TickOutcome::Processed { task_id: task.id },
                    warnings,
                ))
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "Dispatch failed, returning task to backlog");
                self.pending.remove(&request.request_id).await;
                warnings.extend(self.reset_task(task.id).await);
                warnings.extend(self.release_lock().await);
                Ok(TickReport::new(
                    TickOutcome::Failed {
                        task_id: task.id,
                        error: e.to_string(),
                    },
                    warnings,
                ))
            }
        }
    }

    async fn dispatch_with_retry(&self, request: &DispatchRequest) -> Result<(), ExecutorError> {
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            match self.executor.dispatch(request).await {
                Ok(()) => {
                    self.consecutive_errors.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    let consecutive = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    if !e.is_transient() || attempt >= policy.max_retries {
                        return Err(e);
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        consecutive_errors = consecutive,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient executor error, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Resolves a dispatched task from its executor callback.
    pub async fn handle_callback(
        &self,
        payload: &CallbackPayload,
    ) -> Result<CallbackOutcome, ProcessorError> {
        let Some(pending) = self.pending.remove(&payload.request_id).await else {
            let lock_cleared = self.clear_foreign_lock().await?;
            warn!(
                request_id = %payload.request_id,
                lock_cleared,
                "Callback for unknown request"
            );
            return Ok(CallbackOutcome::Unknown { lock_cleared });
        };

        let outcome = if payload.success == Some(true) {
            if !self.backlog.mark_complete(pending.task_id).await {
                warn!(task_id = pending.task_id, "Failed to mark task complete");
            }
            info!(task_id = pending.task_id, iterations = ?payload.iterations, "Task completed");
            CallbackOutcome::Completed {
                task_id: pending.task_id,
            }
        } else {
            warn!(
                task_id = pending.task_id,
                error = payload.error.as_deref().unwrap_or("unknown error"),
                "Task failed, returning to backlog"
            );
            for warning in self.reset_task(pending.task_id).await {
                warn!(warning = %warning, "Callback compensation incomplete");
            }
            CallbackOutcome::Reset {
                task_id: pending.task_id,
            }
        };

        for warning in self.release_lock().await {
            warn!(warning = %warning, "Callback compensation incomplete");
        }
        Ok(outcome)
    }

    /// Force-clears the lock when its token names a different pid.
    async fn clear_foreign_lock(&self) -> Result<bool, ProcessorError> {
        let Some(holder) = self.locks.holder(&self.config.lock_key).await? else {
            return Ok(false);
        };
        if lock::token_pid(&holder) == Some(self.config.pid) {
            return Ok(false);
        }
        info!(holder = %holder, "Clearing lock left by another process");
        Ok(self.locks.force_clear(&self.config.lock_key).await?)
    }

    /// Returns pending dispatches older than the stale timeout to READY.
    ///
    /// Releases our lock when that leaves nothing in flight.
    pub async fn reap_stale(&self) -> Vec<TickWarning> {
        let reaped = self.pending.reap_stale(self.config.stale_after).await;
        if reaped.is_empty() {
            return Vec::new();
        }

        let mut warnings = Vec::new();
        for task in &reaped {
            warn!(task_id = task.task_id, request_id = %task.request_id, "Reclaiming stale dispatch");
            warnings.push(TickWarning::StaleReaped {
                task_id: task.task_id,
                request_id: task.request_id.clone(),
            });
            warnings.extend(self.reset_task(task.task_id).await);
        }

        if self.pending.is_empty().await {
            warnings.extend(self.release_lock().await);
        }
        warnings
    }

    async fn reset_task(&self, task_id: i64) -> Option<TickWarning> {
        if self
            .backlog
            .update_task_status(task_id, TaskStatus::Ready)
            .await
        {
            None
        } else {
            Some(TickWarning::StatusUpdateFailed {
                task_id,
                status: TaskStatus::READY,
            })
        }
    }

    /// Releases the lock if this instance holds a token for it.
    async fn release_lock(&self) -> Option<TickWarning> {
        let token = self.held.lock().await.take()?;
        match self.locks.release(&self.config.lock_key, &token).await {
            Ok(true) => {
                debug!(token = %token, "Task operator lock released");
                None
            }
            Ok(false) => {
                debug!(token = %token, "Lock had already expired or changed hands");
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to release task operator lock");
                Some(TickWarning::LockReleaseFailed {
                    error: e.to_string(),
                })
            }
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.backlog.is_setting_enabled(TASK_OPERATOR_SETTING).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> bool {
        self.backlog
            .set_setting(TASK_OPERATOR_SETTING, enabled)
            .await
    }

    /// Reads the lock without modifying it.
    pub async fn lock_status(&self) -> Result<LockStatus, ProcessorError> {
        let holder = self.locks.holder(&self.config.lock_key).await?;
        let owned = match (&holder, self.held.lock().await.as_ref()) {
            (Some(value), Some(token)) => value == token.as_str(),
            _ => false,
        };
        Ok(LockStatus {
            is_locked: holder.is_some(),
            holder,
            owned_by_this_instance: owned,
        })
    }

    /// Deletes the lock regardless of holder.
    pub async fn clear_lock(&self) -> Result<bool, ProcessorError> {
        self.held.lock().await.take();
        let cleared = self.locks.force_clear(&self.config.lock_key).await?;
        info!(key = %self.config.lock_key, cleared, "Task operator lock force-cleared");
        Ok(cleared)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    /// Failed executor dispatch calls since the last success, counting
    /// retries and non-transient failures alike.
    ///
    /// Diagnostic only: it never limits retries, which are bounded per
    /// dispatch by [`RetryPolicy::max_retries`].
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &PendingTasks {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteBacklog;
    use std::sync::atomic::AtomicUsize;

    /// Executor whose first `fail_first` dispatches fail with `status`.
    struct ScriptedExecutor {
        fail_first: usize,
        status: u16,
        calls: AtomicUsize,
        last_request: std::sync::Mutex<Option<DispatchRequest>>,
    }

    impl ScriptedExecutor {
        fn ok() -> Self {
            Self::failing(0, 500)
        }

        fn failing(fail_first: usize, status: u16) -> Self {
            Self {
                fail_first,
                status,
                calls: AtomicUsize::new(0),
                last_request: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn new_conversation(&self) -> Result<String, ExecutorError> {
            Ok("conv-1".to_string())
        }

        async fn dispatch(&self, request: &DispatchRequest) -> Result<(), ExecutorError> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(ExecutorError::Status {
                    status: self.status,
                    body: "nope".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    async fn backlog() -> (tempfile::TempDir, Arc<SqliteBacklog>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.db");
        let backlog = SqliteBacklog::connect(path.to_str().unwrap()).await.unwrap();
        (dir, Arc::new(backlog))
    }

    fn config() -> ProcessorConfig {
        ProcessorConfig::new("test", "http://svc:3002")
            .with_pid(100)
            .with_retry(
                RetryPolicy::default()
                    .with_base_delay(Duration::from_millis(1))
                    .with_jitter(0.0),
            )
    }

    fn processor(
        backlog: Arc<SqliteBacklog>,
        locks: Arc<MemoryLockStore>,
        executor: Arc<ScriptedExecutor>,
    ) -> TaskProcessor {
        TaskProcessor::new(backlog, locks, executor, config())
    }

    #[test]
    fn test_callback_url() {
        let cfg = ProcessorConfig::new("p", "http://svc:3002/");
        assert_eq!(cfg.callback_url(), "http://svc:3002/task-operator/callback");

        let cfg = cfg.with_callback_secret(Some("s3cret".to_string()));
        assert_eq!(
            cfg.callback_url(),
            "http://svc:3002/task-operator/callback?secret=s3cret"
        );
        assert_eq!(lock_key_for("agents"), "agents:task-operator:lock");
    }

    #[tokio::test]
    async fn test_tick_dispatches_and_keeps_lock() {
        let (_dir, backlog) = backlog().await;
        let id = backlog.insert_task("do it", 1, TaskStatus::Ready).await.unwrap();
        let locks = Arc::new(MemoryLockStore::new());
        let executor = Arc::new(ScriptedExecutor::ok());
        let processor = processor(backlog.clone(), locks.clone(), executor.clone());

        let report = processor.tick().await.unwrap();
        assert_eq!(report.outcome, TickOutcome::Processed { task_id: id });
        assert!(report.warnings.is_empty());
        assert_eq!(backlog.task_status(id).await, Some(TaskStatus::InProgress));
        assert_eq!(processor.pending_count().await, 1);

        let status = processor.lock_status().await.unwrap();
        assert!(status.is_locked);
        assert!(status.owned_by_this_instance);

        let sent = executor.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.prompt, "do it");
        assert_eq!(sent.conversation_id.as_deref(), Some("conv-1"));
        assert!(sent.callback_url.ends_with("/task-operator/callback"));

        // Lock is still ours, so the next tick is contended.
        let report = processor.tick().await.unwrap();
        assert_eq!(report.outcome, TickOutcome::LockHeld);
    }

    #[tokio::test]
    async fn test_empty_backlog_releases_lock() {
        let (_dir, backlog) = backlog().await;
        let locks = Arc::new(MemoryLockStore::new());
        let processor = processor(backlog, locks.clone(), Arc::new(ScriptedExecutor::ok()));

        let report = processor.tick().await.unwrap();
        assert_eq!(report.outcome, TickOutcome::NoTasks);
        assert!(locks.holder("test:task-operator:lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (_dir, backlog) = backlog().await;
        let id = backlog.insert_task("flaky", 1, TaskStatus::Ready).await.unwrap();
        let executor = Arc::new(ScriptedExecutor::failing(2, 503));
        let processor = processor(backlog, Arc::new(MemoryLockStore::new()), executor.clone());

        let report = processor.tick().await.unwrap();
        assert_eq!(report.outcome, TickOutcome::Processed { task_id: id });
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(processor.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_reset_task() {
        let (_dir, backlog) = backlog().await;
        let id = backlog.insert_task("down", 1, TaskStatus::Ready).await.unwrap();
        let locks = Arc::new(MemoryLockStore::new());
        let executor = Arc::new(ScriptedExecutor::failing(usize::MAX, 503));
        let processor = processor(backlog.clone(), locks.clone(), executor.clone());

        let report = processor.tick().await.unwrap();
        assert!(matches!(report.outcome, TickOutcome::Failed { task_id, .. } if task_id == id));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 6);
        assert_eq!(processor.consecutive_errors(), 6);
        assert_eq!(backlog.task_status(id).await, Some(TaskStatus::Ready));
        assert_eq!(processor.pending_count().await, 0);
        assert!(locks.holder("test:task-operator:lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consecutive_errors_span_ticks_without_limiting_them() {
        let (_dir, backlog) = backlog().await;
        let id = backlog.insert_task("picky", 1, TaskStatus::Ready).await.unwrap();
        let executor = Arc::new(ScriptedExecutor::failing(2, 400));
        let processor = processor(backlog, Arc::new(MemoryLockStore::new()), executor.clone());

        for expected in 1..=2 {
            let report = processor.tick().await.unwrap();
            assert!(matches!(report.outcome, TickOutcome::Failed { .. }));
            assert_eq!(processor.consecutive_errors(), expected);
        }

        let report = processor.tick().await.unwrap();
        assert_eq!(report.outcome, TickOutcome::Processed { task_id: id });
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(processor.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (_dir, backlog) = backlog().await;
        backlog.insert_task("bad", 1, TaskStatus::Ready).await.unwrap();
        let executor = Arc::new(ScriptedExecutor::failing(usize::MAX, 400));
        let processor = processor(backlog, Arc::new(MemoryLockStore::new()), executor.clone());

        let report = processor.tick().await.unwrap();
        assert!(matches!(report.outcome, TickOutcome::Failed { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_callback_completes_task() {
        let (_dir, backlog) = backlog().await;
        let id = backlog.insert_task("ok", 1, TaskStatus::Ready).await.unwrap();
        let locks = Arc::new(MemoryLockStore::new());
        let executor = Arc::new(ScriptedExecutor::ok());
        let processor = processor(backlog.clone(), locks.clone(), executor.clone());

        processor.tick().await.unwrap();
        let request_id = executor.last_request.lock().unwrap().clone().unwrap().request_id;

        let outcome = processor
            .handle_callback(&CallbackPayload::succeeded(&request_id))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Completed { task_id: id });
        assert_eq!(backlog.task_status(id).await, Some(TaskStatus::Complete));
        assert!(!processor.lock_status().await.unwrap().is_locked);
    }

    #[tokio::test]
    async fn test_unknown_callback_clears_foreign_lock() {
        let (_dir, backlog) = backlog().await;
        let locks = Arc::new(MemoryLockStore::new());
        let processor = processor(backlog, locks.clone(), Arc::new(ScriptedExecutor::ok()));

        let foreign = LockToken::generate(999);
        locks
            .try_acquire("test:task-operator:lock", &foreign, Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = processor
            .handle_callback(&CallbackPayload::succeeded("task-unknown"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Unknown { lock_cleared: true });
        assert!(locks.holder("test:task-operator:lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_callback_keeps_own_pid_lock() {
        let (_dir, backlog) = backlog().await;
        let locks = Arc::new(MemoryLockStore::new());
        let processor = processor(backlog, locks.clone(), Arc::new(ScriptedExecutor::ok()));

        let ours = LockToken::generate(100);
        locks
            .try_acquire("test:task-operator:lock", &ours, Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = processor
            .handle_callback(&CallbackPayload::failed("task-unknown", "boom"))
            .await
            .unwrap();
        assert_eq!(outcome, CallbackOutcome::Unknown { lock_cleared: false });
        assert!(locks.holder("test:task-operator:lock").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_reap_resets_task_and_releases_lock() {
        let (_dir, backlog) = backlog().await;
        let id = backlog.insert_task("lost", 1, TaskStatus::Ready).await.unwrap();
        let locks = Arc::new(MemoryLockStore::new());
        let executor = Arc::new(ScriptedExecutor::ok());
        let processor = processor(backlog.clone(), locks.clone(), executor.clone());

        processor.tick().await.unwrap();
        let request_id = executor.last_request.lock().unwrap().clone().unwrap().request_id;

        // Age the entry past the stale timeout.
        let entry = processor.pending().remove(&request_id).await.unwrap();
        processor
            .pending()
            .insert_aged(entry, DEFAULT_STALE_AFTER + Duration::from_secs(1))
            .await;

        let warnings = processor.reap_stale().await;
        assert!(warnings.contains(&TickWarning::StaleReaped {
            task_id: id,
            request_id: request_id.clone(),
        }));
        assert_eq!(backlog.task_status(id).await, Some(TaskStatus::Ready));
        assert_eq!(processor.pending_count().await, 0);
        assert!(!processor.lock_status().await.unwrap().is_locked);
    }

    #[tokio::test]
    async fn test_enable_setting_round_trip() {
        let (_dir, backlog) = backlog().await;
        let processor = processor(
            backlog,
            Arc::new(MemoryLockStore::new()),
            Arc::new(ScriptedExecutor::ok()),
        );
        assert!(!processor.is_enabled().await);
        assert!(processor.set_enabled(true).await);
        assert!(processor.is_enabled().await);
    }

    #[tokio::test]
    async fn test_clear_lock() {
        let (_dir, backlog) = backlog().await;
        backlog.insert_task("t", 1, TaskStatus::Ready).await.unwrap();
        let processor = processor(
            backlog,
            Arc::new(MemoryLockStore::new()),
            Arc::new(ScriptedExecutor::ok()),
        );
        processor.tick().await.unwrap();
        assert!(processor.clear_lock().await.unwrap());
        let status = processor.lock_status().await.unwrap();
        assert!(!status.is_locked);
        assert!(!status.owned_by_this_instance);
    }
}
