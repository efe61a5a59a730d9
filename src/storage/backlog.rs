//! Backlog store contract.
//!
//! The task processor only needs a handful of reads and atomic status
//! writes. Implementations never surface errors through this trait: a failed
//! read resolves to `None` or `false`, a failed write to `false`, and the
//! underlying error is logged by the implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Setting that turns the task processor tick chain on and off.
pub const TASK_OPERATOR_SETTING: &str = "task_operator";

/// Status of a backlog task.
///
/// Codes 2 and 3 belong to the backlog's owner; they are carried through
/// unchanged as [`TaskStatus::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Ready,
    Complete,
    InProgress,
    Other(i64),
}

impl TaskStatus {
    pub const READY: i64 = 0;
    pub const COMPLETE: i64 = 1;
    pub const IN_PROGRESS: i64 = 4;

    /// Integer stored in the `status` column.
    pub fn code(&self) -> i64 {
        match self {
            TaskStatus::Ready => Self::READY,
            TaskStatus::Complete => Self::COMPLETE,
            TaskStatus::InProgress => Self::IN_PROGRESS,
            TaskStatus::Other(code) => *code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            Self::READY => TaskStatus::Ready,
            Self::COMPLETE => TaskStatus::Complete,
            Self::IN_PROGRESS => TaskStatus::InProgress,
            other => TaskStatus::Other(other),
        }
    }

    /// Whether the task processor may pick up a task in this status.
    pub fn is_selectable(&self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Other(code) => write!(f, "status_{}", code),
        }
    }
}

/// A candidate prompt in the backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogTask {
    pub id: i64,
    pub uuid: Option<String>,
    pub order: i64,
    pub prompt: String,
    pub status: TaskStatus,
}

/// Read/write access to the backlog and its settings table.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Returns the boolean setting, `false` when missing or unreadable.
    async fn is_setting_enabled(&self, name: &str) -> bool;

    /// Upserts a boolean setting. Returns `false` if the write failed.
    async fn set_setting(&self, name: &str, enabled: bool) -> bool;

    /// First READY or IN_PROGRESS task by ascending `(order, id)`.
    async fn next_ready_task(&self) -> Option<BacklogTask>;

    /// Sets a task's status. Returns `false` if no row changed or the write failed.
    async fn update_task_status(&self, id: i64, status: TaskStatus) -> bool;

    /// Marks a task COMPLETE.
    async fn mark_complete(&self, id: i64) -> bool {
        self.update_task_status(id, TaskStatus::Complete).await
    }

    /// Current status of a task, `None` if missing or unreadable.
    async fn task_status(&self, id: i64) -> Option<TaskStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TaskStatus::from_code(0), TaskStatus::Ready);
        assert_eq!(TaskStatus::from_code(1), TaskStatus::Complete);
        assert_eq!(TaskStatus::from_code(4), TaskStatus::InProgress);
        assert_eq!(TaskStatus::from_code(2), TaskStatus::Other(2));
        assert_eq!(TaskStatus::Other(3).code(), 3);
        assert_eq!(TaskStatus::InProgress.code(), 4);
    }

    #[test]
    fn test_selectable_statuses() {
        assert!(TaskStatus::Ready.is_selectable());
        assert!(TaskStatus::InProgress.is_selectable());
        assert!(!TaskStatus::Complete.is_selectable());
        assert!(!TaskStatus::Other(2).is_selectable());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(TaskStatus::Other(3).to_string(), "status_3");
    }
}
