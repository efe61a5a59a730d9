//! Service configuration.
//!
//! Every setting has a default except the Redis URL. Values are read from
//! the environment by [`ServiceConfig::from_env`] and can be overridden with
//! the `with_*` builders.

use std::time::Duration;

use thiserror::Error;

use crate::processor::{ProcessorConfig, RetryPolicy};
use crate::scheduler::backend::DEFAULT_LEASE;
use crate::scheduler::job::{DEFAULT_JOB_ATTEMPTS, DEFAULT_QUEUE, TASK_OPERATOR_AGENT};
use crate::scheduler::registry::RegistryConfig;
use crate::scheduler::worker_pool::{WorkerConfig, MIN_LEASE};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the dispatcher service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // Connections
    /// Redis URL for the queue backend and the task processor lock.
    pub redis_url: String,
    /// SQLite URL or path of the backlog database.
    pub backlog_database_url: String,
    /// Prefix of every Redis key this service writes.
    pub key_prefix: String,

    // Queues
    /// Queue that always exists and is never deleted.
    pub default_queue: String,
    /// Queue reserved for task processor ticks.
    pub task_operator_queue: String,
    /// Jobs processed at the same time per queue.
    pub worker_concurrency: usize,
    /// Idle poll interval of queue workers.
    pub poll_interval: Duration,
    /// Backend attempts per agent job.
    pub job_attempts: u32,
    /// Time allowed for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
    /// Lease on a running job; a job whose lease lapses is delivered again.
    pub job_lease: Duration,

    // Task processor
    /// Root URL of the executor.
    pub executor_base_url: String,
    /// Timeout of each executor request.
    pub executor_timeout: Duration,
    /// URL the executor reaches this service on.
    pub callback_base_url: String,
    /// Shared secret expected on callbacks.
    pub callback_secret: Option<String>,
    /// TTL of the task processor lock.
    pub lock_ttl: Duration,
    /// Age after which an unanswered dispatch is reclaimed.
    pub stale_after: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            backlog_database_url: "sqlite://data/backlog.db".to_string(),
            key_prefix: "agents".to_string(),

            default_queue: DEFAULT_QUEUE.to_string(),
            task_operator_queue: TASK_OPERATOR_AGENT.to_string(),
            worker_concurrency: 5,
            poll_interval: Duration::from_millis(1000),
            job_attempts: DEFAULT_JOB_ATTEMPTS,
            shutdown_timeout: Duration::from_secs(30),
            job_lease: DEFAULT_LEASE,

            executor_base_url: "http://localhost:3001".to_string(),
            executor_timeout: Duration::from_millis(30_000),
            callback_base_url: "http://localhost:3002".to_string(),
            callback_secret: None,
            lock_ttl: Duration::from_secs(3600),
            stale_after: Duration::from_secs(3600),
        }
    }
}

impl ServiceConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (required)
    /// - `BACKLOG_DATABASE_URL`: Backlog SQLite URL (default: sqlite://data/backlog.db)
    /// - `QUEUE_KEY_PREFIX`: Redis key prefix (default: agents)
    /// - `DEFAULT_QUEUE`: Default queue name (default: default)
    /// - `TASK_OPERATOR_QUEUE`: Task processor queue (default: task-operator)
    /// - `WORKER_CONCURRENCY`: Jobs per queue at once (default: 5)
    /// - `WORKER_POLL_INTERVAL_MS`: Idle poll interval (default: 1000)
    /// - `JOB_ATTEMPTS`: Attempts per agent job (default: 3)
    /// - `EXECUTOR_BASE_URL`: Executor root URL (default: http://localhost:3001)
    /// - `EXECUTOR_TIMEOUT_MS`: Executor request timeout (default: 30000)
    /// - `CALLBACK_BASE_URL`: URL the executor calls back on (default: http://localhost:3002)
    /// - `CALLBACK_SECRET`: Secret required on callbacks (default: none)
    /// - `LOCK_TTL_SECS`: Task processor lock TTL (default: 3600)
    /// - `STALE_TASK_SECS`: Age before a dispatch is reclaimed (default: 3600)
    /// - `SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown limit (default: 30)
    /// - `JOB_LEASE_MS`: Lease on a running job (default: 30000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.redis_url =
            lookup("REDIS_URL").ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;

        if let Some(val) = lookup("BACKLOG_DATABASE_URL") {
            config.backlog_database_url = val;
        }

        if let Some(val) = lookup("QUEUE_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Some(val) = lookup("DEFAULT_QUEUE") {
            config.default_queue = val;
        }

        if let Some(val) = lookup("TASK_OPERATOR_QUEUE") {
            config.task_operator_queue = val;
        }

        if let Some(val) = lookup("WORKER_CONCURRENCY") {
            config.worker_concurrency = parse_env_value(&val, "WORKER_CONCURRENCY")?;
        }

        if let Some(val) = lookup("WORKER_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "WORKER_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("JOB_ATTEMPTS") {
            config.job_attempts = parse_env_value(&val, "JOB_ATTEMPTS")?;
        }

        if let Some(val) = lookup("EXECUTOR_BASE_URL") {
            config.executor_base_url = val;
        }

        if let Some(val) = lookup("EXECUTOR_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "EXECUTOR_TIMEOUT_MS")?;
            config.executor_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("CALLBACK_BASE_URL") {
            config.callback_base_url = val;
        }

        config.callback_secret = lookup("CALLBACK_SECRET").filter(|s| !s.is_empty());

        if let Some(val) = lookup("LOCK_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "LOCK_TTL_SECS")?;
            config.lock_ttl = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("STALE_TASK_SECS") {
            let secs: u64 = parse_env_value(&val, "STALE_TASK_SECS")?;
            config.stale_after = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("JOB_LEASE_MS") {
            let ms: u64 = parse_env_value(&val, "JOB_LEASE_MS")?;
            config.job_lease = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.backlog_database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "backlog_database_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::ValidationFailed(
                "key_prefix must be non-empty and contain no whitespace".to_string(),
            ));
        }

        if self.default_queue.is_empty() || self.task_operator_queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue names cannot be empty".to_string(),
            ));
        }

        if self.default_queue == self.task_operator_queue {
            return Err(ConfigError::ValidationFailed(
                "task_operator_queue must differ from default_queue".to_string(),
            ));
        }

        if self.worker_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.job_lease < MIN_LEASE {
            return Err(ConfigError::ValidationFailed(format!(
                "job_lease must be at least {:?}",
                MIN_LEASE
            )));
        }

        if self.job_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "job_attempts must be at least 1".to_string(),
            ));
        }

        for (name, url) in [
            ("executor_base_url", &self.executor_base_url),
            ("callback_base_url", &self.callback_base_url),
        ] {
            if reqwest::Url::parse(url).is_err() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} is not a valid URL: '{}'",
                    name, url
                )));
            }
        }

        if self.executor_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "executor_timeout must be greater than 0".to_string(),
            ));
        }

        if self.lock_ttl.is_zero() || self.stale_after.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl and stale_after must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the backlog database URL.
    pub fn with_backlog_database_url(mut self, url: impl Into<String>) -> Self {
        self.backlog_database_url = url.into();
        self
    }

    /// Builder method to set the Redis key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the task processor queue.
    pub fn with_task_operator_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_operator_queue = queue.into();
        self
    }

    /// Builder method to set worker concurrency.
    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Builder method to set the worker poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the job lease.
    pub fn with_job_lease(mut self, lease: Duration) -> Self {
        self.job_lease = lease;
        self
    }

    /// Builder method to set attempts per job.
    pub fn with_job_attempts(mut self, attempts: u32) -> Self {
        self.job_attempts = attempts;
        self
    }

    /// Builder method to set the executor base URL.
    pub fn with_executor_base_url(mut self, url: impl Into<String>) -> Self {
        self.executor_base_url = url.into();
        self
    }

    /// Builder method to set the callback base URL.
    pub fn with_callback_base_url(mut self, url: impl Into<String>) -> Self {
        self.callback_base_url = url.into();
        self
    }

    /// Builder method to set the callback secret.
    pub fn with_callback_secret(mut self, secret: impl Into<String>) -> Self {
        self.callback_secret = Some(secret.into());
        self
    }

    /// Builder method to set the lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Builder method to set the stale dispatch timeout.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Worker settings shared by every queue.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.worker_concurrency)
            .with_poll_interval(self.poll_interval)
            .with_shutdown_timeout(self.shutdown_timeout)
            .with_lease(self.job_lease)
    }

    /// Queue registry settings derived from this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_queue: self.default_queue.clone(),
            ..RegistryConfig::default()
        }
        .with_task_operator_queue(self.task_operator_queue.clone())
        .with_worker(self.worker_config())
    }

    /// Task processor settings for this process.
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig::new(&self.key_prefix, self.callback_base_url.clone())
            .with_lock_ttl(self.lock_ttl)
            .with_stale_after(self.stale_after)
            .with_callback_secret(self.callback_secret.clone())
            .with_retry(RetryPolicy::default())
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.default_queue, "default");
        assert_eq!(config.task_operator_queue, "task-operator");
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.job_attempts, 3);
        assert_eq!(config.lock_ttl, Duration::from_secs(3600));
        assert_eq!(config.stale_after, Duration::from_secs(3600));
        assert!(config.callback_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_url_is_required() {
        let err = ServiceConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "REDIS_URL"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache:6379/2"),
            ("QUEUE_KEY_PREFIX", "dispatch"),
            ("WORKER_CONCURRENCY", "12"),
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("CALLBACK_SECRET", "hunter2"),
            ("STALE_TASK_SECS", "600"),
            ("JOB_LEASE_MS", "5000"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6379/2");
        assert_eq!(config.key_prefix, "dispatch");
        assert_eq!(config.worker_concurrency, 12);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.callback_secret.as_deref(), Some("hunter2"));
        assert_eq!(config.stale_after, Duration::from_secs(600));
        assert_eq!(config.job_lease, Duration::from_millis(5000));
        assert_eq!(config.worker_config().lease, Duration::from_millis(5000));
    }

    #[test]
    fn test_invalid_number() {
        let err = ServiceConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://localhost"),
            ("JOB_ATTEMPTS", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("JOB_ATTEMPTS"));
    }

    #[test]
    fn test_empty_secret_is_none() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://localhost"),
            ("CALLBACK_SECRET", ""),
        ]))
        .unwrap();
        assert!(config.callback_secret.is_none());
    }

    #[test]
    fn test_validation_failures() {
        let config = ServiceConfig::default().with_worker_concurrency(0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("worker_concurrency"));

        let config = ServiceConfig::default().with_task_operator_queue("default");
        assert!(config.validate().is_err());

        let config = ServiceConfig::default().with_callback_base_url("not a url");
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("callback_base_url"));

        let config = ServiceConfig::default().with_job_attempts(0);
        assert!(config.validate().is_err());

        let config = ServiceConfig::default().with_job_lease(Duration::ZERO);
        assert!(config.validate().unwrap_err().to_string().contains("job_lease"));
    }

    #[test]
    fn test_derived_configs() {
        let config = ServiceConfig::default()
            .with_key_prefix("svc")
            .with_worker_concurrency(3)
            .with_callback_secret("s");

        let registry = config.registry_config();
        assert_eq!(registry.worker.concurrency, 3);
        assert_eq!(registry.worker_config_for("task-operator").concurrency, 1);
        assert!(registry.run_workers);

        let processor = config.processor_config();
        assert_eq!(processor.lock_key, "svc:task-operator:lock");
        assert!(processor.callback_url().ends_with("?secret=s"));
    }
}
