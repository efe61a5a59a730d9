//! In-flight dispatches awaiting their executor callback.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use tokio::sync::Mutex;

/// A dispatched backlog task that has not called back yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub request_id: String,
    pub task_id: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingTask {
    pub fn new(request_id: impl Into<String>, task_id: i64) -> Self {
        Self {
            request_id: request_id.into(),
            task_id,
            enqueued_at: Utc::now(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.enqueued_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Returns an unguessable request id (128 random bits, hex encoded).
pub fn new_request_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    format!("task-{}", hex::encode(bytes))
}

/// Process-local map of request id to pending task.
#[derive(Debug, Default)]
pub struct PendingTasks {
    entries: Mutex<HashMap<String, PendingTask>>,
}

impl PendingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: PendingTask) {
        self.entries
            .lock()
            .await
            .insert(task.request_id.clone(), task);
    }

    pub async fn remove(&self, request_id: &str) -> Option<PendingTask> {
        self.entries.lock().await.remove(request_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drops every entry older than `max_age` and returns them, oldest first.
    pub async fn reap_stale(&self, max_age: Duration) -> Vec<PendingTask> {
        self.reap_older_than(max_age, Utc::now()).await
    }

    async fn reap_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<PendingTask> {
        let mut entries = self.entries.lock().await;
        let stale_ids: Vec<String> = entries
            .values()
            .filter(|task| task.age(now) > max_age)
            .map(|task| task.request_id.clone())
            .collect();

        let mut reaped: Vec<PendingTask> = stale_ids
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect();
        reaped.sort_by_key(|task| task.enqueued_at);
        reaped
    }

    #[cfg(test)]
    pub(crate) async fn insert_aged(&self, mut task: PendingTask, age: Duration) {
        task.enqueued_at = Utc::now() - chrono::Duration::milliseconds(age.as_millis() as i64);
        self.insert(task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_and_long() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("task-"));
        assert_eq!(a.len(), "task-".len() + 32);
    }

    #[tokio::test]
    async fn test_insert_remove() {
        let pending = PendingTasks::new();
        pending.insert(PendingTask::new("req-1", 7)).await;
        assert_eq!(pending.len().await, 1);

        let task = pending.remove("req-1").await.expect("entry exists");
        assert_eq!(task.task_id, 7);
        assert!(pending.remove("req-1").await.is_none());
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_reap_only_stale_entries() {
        let pending = PendingTasks::new();
        let hour = Duration::from_secs(3600);
        pending
            .insert_aged(PendingTask::new("old", 1), hour + Duration::from_secs(5))
            .await;
        pending.insert(PendingTask::new("fresh", 2)).await;

        let reaped = pending.reap_stale(hour).await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].task_id, 1);
        assert_eq!(pending.len().await, 1);
        assert!(pending.remove("fresh").await.is_some());
    }
}
