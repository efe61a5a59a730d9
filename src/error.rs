//! Error types for agent dispatch operations.
//!
//! Defines error types for the subsystems built on top of the queue backend:
//! - Queue registry lifecycle
//! - Agent directory CRUD
//! - Job dispatch (target HTTP calls and task processor ticks)
//! - Task processor lock handling
//! - The service facade exposed to callers
//!
//! Backend, lock, executor and configuration errors live next to their
//! modules and convert into these through `#[from]`.

use thiserror::Error;

use crate::config::ConfigError;
use crate::processor::executor::ExecutorError;
use crate::processor::lock::LockError;
use crate::scheduler::backend::QueueError;

/// Errors that can occur during queue registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    #[error("Cannot delete the default queue \"{0}\"")]
    DefaultQueueProtected(String),

    #[error("Cannot delete queue \"{name}\" - it still has jobs. Remove all agents first.")]
    QueueNotEmpty { name: String, pending: usize },

    #[error("Invalid queue name '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidName(String),

    #[error("No job processor installed; queues cannot start workers")]
    ProcessorMissing,

    #[error("Queue backend error: {0}")]
    Backend(#[from] QueueError),
}

/// Errors that can occur during agent directory operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent '{0}' not found")]
    NotFound(String),

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("Recurring agent '{0}' requires a schedule")]
    MissingSchedule(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Queue backend error: {0}")]
    Backend(#[from] QueueError),

    #[error("Malformed agent job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors that fail a job attempt in the dispatch worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Target {url} responded with HTTP {status}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to schedule follow-up job: {0}")]
    Reschedule(#[from] AgentError),

    #[error("Task processor tick failed: {0}")]
    Tick(#[from] ProcessorError),
}

/// Errors that abort a task processor operation.
///
/// Backlog and executor failures are not errors at this level; they are
/// compensated and reported through the tick outcome.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Lock store error: {0}")]
    Lock(#[from] LockError),
}

/// Errors returned by the service facade.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Callback secret does not match")]
    Unauthorized,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("Queue backend error: {0}")]
    Backend(#[from] QueueError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backlog store unavailable: {0}")]
    Backlog(String),
}
