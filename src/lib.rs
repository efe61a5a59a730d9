//! agent-dispatcher: scheduled HTTP agents and a singleton backlog processor.
//!
//! This library schedules one-time and recurring HTTP calls ("agents") on
//! Redis-backed queues, and drives a fleet-wide singleton task processor that
//! feeds backlog prompts to an asynchronous executor.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, ServiceConfig};
pub use error::{AgentError, DispatchError, ProcessorError, RegistryError, ServiceError};
pub use service::{AgentService, ServiceComponents};
