//! Queues, workers and agents.
//!
//! This module provides the job orchestration layer:
//!
//! - **QueueBackend**: Durable named queues with delayed and repeating jobs
//!   (Redis in production, in-memory for tests)
//! - **QueueRegistry**: Live queue handles with their worker and event listener
//! - **AgentDirectory**: Agent CRUD and status views built from job state
//! - **DispatchWorker**: Runs agent jobs, either as HTTP calls or as task
//!   processor ticks
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Caller     │
//!                      │  (CLI/API)   │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │    Agent     │
//!                      │  Directory   │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐      ┌──────────────┐
//!                      │    Queue     ├─────►│    Redis     │
//!                      │   Registry   │      │   Backend    │
//!                      └──────┬───────┘      └──────────────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐       ┌──────────────┐
//!    │ default │         │ reports │       │task-operator │
//!    │ worker  │         │ worker  │       │ worker (x1)  │
//!    └────┬────┘         └────┬────┘       └──────┬───────┘
//!         │                   │                   │
//!         └─────────┬─────────┘                   ▼
//!                   ▼                      TaskProcessor::tick
//!              target URL
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agent_dispatcher::scheduler::{AgentConfig, AgentDirectory, QueueRegistry, RedisQueueBackend, RegistryConfig};
//!
//! let backend = RedisQueueBackend::connect("redis://localhost:6379", "agents").await?;
//! let registry = QueueRegistry::new(Arc::new(backend), RegistryConfig::default().without_workers());
//! let directory = AgentDirectory::new(registry);
//!
//! directory
//!     .create(AgentConfig::new("nightly-report", "http://reports/run").with_schedule("0 2 * * *"))
//!     .await?;
//! let status = directory.status("nightly-report").await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic fetch**: Due delayed jobs are promoted and popped in one script
//! - **Idempotent repeats**: Occurrence ids are derived from the fire time, so
//!   replicas never enqueue the same occurrence twice
//! - **Capped history**: Completed and failed lists keep the newest 100 jobs
//! - **Leases**: A job left active by a crashed or aborted worker is
//!   delivered again once its lease expires
//! - **Queue cleanup**: A non-default queue is deleted after its last job
//!   finishes
//! - **Graceful shutdown**: Workers finish current jobs before stopping

pub mod backend;
pub mod directory;
pub mod dispatch;
pub mod events;
pub mod job;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod worker_pool;

// Re-export main types for convenience
pub use backend::{QueueBackend, QueueError, DEFAULT_LEASE};
pub use directory::{
    AgentDirectory, AgentStatus, DelayedOutcome, DuplicateCheck, QueueInfo, RemovalReport,
};
pub use dispatch::DispatchWorker;
pub use events::JobEvent;
pub use job::{AgentConfig, HttpMethod, JobCounts, JobRecord, JobState, Schedule};
pub use memory::MemoryQueueBackend;
pub use queue::RedisQueueBackend;
pub use registry::{QueueHandle, QueueRegistry, RegistryConfig};
pub use worker_pool::{JobProcessor, QueueWorker, WorkerConfig, WorkerStats};
