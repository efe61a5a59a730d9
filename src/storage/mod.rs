//! Backlog storage for the task processor.
//!
//! # Overview
//!
//! - **BacklogStore**: The contract the task processor reads and writes through
//! - **SqliteBacklog**: sqlx/SQLite implementation of the contract
//! - **Schema**: Table definitions and the queries behind each operation
//!
//! # Usage
//!
//! ```rust,ignore
//! use agent_dispatcher::storage::{BacklogStore, SqliteBacklog, TaskStatus};
//!
//! let backlog = SqliteBacklog::connect("sqlite://data/backlog.db").await?;
//! backlog.insert_task("Refactor the parser", 10, TaskStatus::Ready).await?;
//!
//! if let Some(task) = backlog.next_ready_task().await {
//!     backlog.update_task_status(task.id, TaskStatus::InProgress).await;
//! }
//! ```

pub mod backlog;
pub mod database;
pub mod schema;

pub use backlog::{BacklogStore, BacklogTask, TaskStatus, TASK_OPERATOR_SETTING};
pub use database::{BacklogError, SqliteBacklog};
