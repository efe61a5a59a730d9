//! Agent and queue administration against the in-memory backend.

use std::sync::Arc;

use agent_dispatcher::scheduler::{
    AgentConfig, AgentDirectory, JobState, MemoryQueueBackend, QueueBackend, QueueRegistry,
    RegistryConfig,
};
use agent_dispatcher::{AgentError, RegistryError};

fn directory() -> AgentDirectory {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
    let registry = QueueRegistry::new(
        backend,
        RegistryConfig::default().without_workers(),
    );
    AgentDirectory::new(registry)
}

#[tokio::test]
async fn recurring_agent_created_twice_keeps_one_entry() {
    let directory = directory();
    let agent = AgentConfig::new("report", "http://reports.local/run")
        .with_schedule("60000")
        .with_queue("reports");

    directory.create(agent.clone()).await.unwrap();
    directory
        .create(agent.with_schedule("0 */10 * * * *"))
        .await
        .unwrap();

    let backend = directory.registry().backend();
    let entries = backend.repeating_entries("reports").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].schedule.pattern(), "0 */10 * * * *");

    let pending = backend
        .jobs_in("reports", &[JobState::Waiting, JobState::Delayed])
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let status = directory.status("report").await.unwrap();
    assert_eq!(status.queue_name, "reports");
    assert!(status.is_active);
    assert!(status.next_run.is_some());
    assert_eq!(status.config.schedule.as_deref(), Some("0 */10 * * * *"));
}

#[tokio::test]
async fn one_time_agent_is_listed_and_inspectable() {
    let directory = directory();
    directory
        .create(AgentConfig::new("ping", "http://ping.local/").one_time())
        .await
        .unwrap();

    let agents = directory.list().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].config.name, "ping");
    assert_eq!(agents[0].queue_name, "default");

    let info = directory.info("default").await.unwrap();
    assert_eq!(info.waiting, 1);
    assert_eq!(info.agents, vec!["ping".to_string()]);
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let directory = directory();
    assert!(matches!(
        directory.status("ghost").await,
        Err(AgentError::NotFound(_))
    ));
    assert!(matches!(
        directory.remove("ghost").await,
        Err(AgentError::NotFound(_))
    ));
}

#[tokio::test]
async fn queue_deletion_rules() {
    let directory = directory();
    let registry = directory.registry().clone();
    registry.start().await.unwrap();

    assert!(matches!(
        registry.delete("default").await,
        Err(RegistryError::DefaultQueueProtected(_))
    ));
    assert!(matches!(
        registry.delete("nowhere").await,
        Err(RegistryError::QueueNotFound(_))
    ));

    directory
        .create(
            AgentConfig::new("sync", "http://sync.local/")
                .with_schedule("30000")
                .with_queue("sync"),
        )
        .await
        .unwrap();
    assert!(matches!(
        registry.delete("sync").await,
        Err(RegistryError::QueueNotEmpty { .. })
    ));
}

#[tokio::test]
async fn removing_last_agent_cleans_up_its_queue() {
    let directory = directory();
    directory
        .create(
            AgentConfig::new("sync", "http://sync.local/")
                .with_schedule("30000")
                .with_queue("sync"),
        )
        .await
        .unwrap();

    let report = directory.remove("sync").await.unwrap();
    assert_eq!(report.removed_repeating, 1);
    assert!(!report.is_partial());
    assert_eq!(report.deleted_queues, vec!["sync".to_string()]);
    assert!(!directory.registry().exists("sync").await.unwrap());
}

#[tokio::test]
async fn default_queue_survives_agent_removal() {
    let directory = directory();
    directory
        .create(AgentConfig::new("ping", "http://ping.local/").one_time())
        .await
        .unwrap();

    let report = directory.remove("ping").await.unwrap();
    assert_eq!(report.removed_jobs, 1);
    assert!(report.deleted_queues.is_empty());
    assert!(directory.registry().exists("default").await.unwrap());
}
