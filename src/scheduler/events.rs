//! Per-queue job event listener.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of a queue's event channel.
const EVENT_BUFFER: usize = 256;

/// Outcome of one processed job, published by the queue's worker.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Completed {
        queue: String,
        job_id: String,
        agent: String,
    },
    Failed {
        queue: String,
        job_id: String,
        agent: String,
        error: String,
        /// Another attempt was scheduled by the backend.
        will_retry: bool,
    },
}

/// Called with the queue name after a job leaves the queue for good.
pub type SettledHook = Arc<dyn Fn(String) + Send + Sync>;

impl JobEvent {
    /// Returns true if the job will not run again.
    pub fn is_final(&self) -> bool {
        !matches!(self, JobEvent::Failed { will_retry: true, .. })
    }
}

/// Listener task that logs every event published for a queue.
pub struct QueueEvents {
    queue: String,
    tx: broadcast::Sender<JobEvent>,
    handle: JoinHandle<()>,
}

impl QueueEvents {
    /// Spawns the listener for a queue.
    ///
    /// `on_settled` runs after every completed or permanently failed job.
    pub fn start(queue: &str, on_settled: Option<SettledHook>) -> Self {
        let (tx, rx) = broadcast::channel(EVENT_BUFFER);
        let handle = tokio::spawn(listen(queue.to_string(), rx, on_settled));

        Self {
            queue: queue.to_string(),
            tx,
            handle,
        }
    }

    /// Sender handed to the queue's worker.
    pub fn sender(&self) -> broadcast::Sender<JobEvent> {
        self.tx.clone()
    }

    /// Subscribes to the queue's events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Stops the listener.
    pub fn close(&self) {
        self.handle.abort();
        debug!(queue = %self.queue, "Event listener closed");
    }
}

impl Drop for QueueEvents {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn listen(
    queue: String,
    mut rx: broadcast::Receiver<JobEvent>,
    on_settled: Option<SettledHook>,
) {
    loop {
        let event = rx.recv().await;
        if let (Ok(event), Some(hook)) = (&event, &on_settled) {
            if event.is_final() {
                hook(queue.clone());
            }
        }

        match event {
            Ok(JobEvent::Completed { job_id, agent, .. }) => {
                info!(queue = %queue, job_id = %job_id, agent = %agent, "Job completed");
            }
            Ok(JobEvent::Failed {
                job_id,
                agent,
                error,
                will_retry: true,
                ..
            }) => {
                warn!(queue = %queue, job_id = %job_id, agent = %agent, error = %error, "Job failed, retry scheduled");
            }
            Ok(JobEvent::Failed {
                job_id,
                agent,
                error,
                will_retry: false,
                ..
            }) => {
                error!(queue = %queue, job_id = %job_id, agent = %agent, error = %error, "Job failed permanently");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(queue = %queue, skipped = skipped, "Event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let events = QueueEvents::start("q", None);
        let mut rx = events.subscribe();

        let event = JobEvent::Completed {
            queue: "q".to_string(),
            job_id: "1".to_string(),
            agent: "a".to_string(),
        };
        events.sender().send(event.clone()).expect("listener is subscribed");

        assert_eq!(rx.recv().await.expect("event"), event);
        events.close();
    }

    #[tokio::test]
    async fn test_settled_hook_skips_retries() {
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let hook: SettledHook = Arc::new(move |queue| {
            let _ = seen_tx.send(queue);
        });
        let events = QueueEvents::start("reports", Some(hook));

        let failed = |will_retry| JobEvent::Failed {
            queue: "reports".to_string(),
            job_id: "1".to_string(),
            agent: "a".to_string(),
            error: "boom".to_string(),
            will_retry,
        };
        events.sender().send(failed(true)).expect("listener is subscribed");
        events.sender().send(failed(false)).expect("listener is subscribed");

        let queue = tokio::time::timeout(std::time::Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("hook should run")
            .expect("queue name");
        assert_eq!(queue, "reports");
        events.close();
        assert!(seen_rx.try_recv().is_err());
    }
}
