//! Agent directory: create, inspect and remove agents across queues.
//!
//! Agents are not stored anywhere on their own. A recurring agent is a
//! repeating entry keyed `agent:<name>`; a one-time agent is a job whose
//! name and `agentName` carry the agent name. Status views are rebuilt on
//! demand by correlating the repeating entry with the agent's most recent
//! job, where "most recent" is the first match in the concatenation of
//! waiting, active, completed and delayed jobs as the backend lists them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AgentError, RegistryError};

use super::backend::QueueBackend;
use super::job::{
    one_time_job_id, repeat_key_for, AgentConfig, AgentJobData, JobOptions, JobRecord, JobState, RepeatingEntry,
    Schedule, DEFAULT_JOB_ATTEMPTS,
};
use super::registry::QueueRegistry;

/// Job states scanned when reconstructing an agent's status.
const STATUS_SCAN: [JobState; 4] = [
    JobState::Waiting,
    JobState::Active,
    JobState::Completed,
    JobState::Delayed,
];

/// Derived, read-only view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Queue owning the agent.
    pub queue_name: String,
    /// Repeating entry exists or a job of the agent is running.
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    /// Repeating key for recurring agents, otherwise the most recent job id.
    pub job_id: Option<String>,
    #[serde(flatten)]
    pub config: AgentConfig,
}

/// Result of a delayed create.
#[derive(Debug, Clone, PartialEq)]
pub enum DelayedOutcome {
    Scheduled(JobRecord),
    /// An equivalent job was already pending; nothing was added.
    Skipped { existing_job_id: String },
}

impl DelayedOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, DelayedOutcome::Scheduled(_))
    }
}

/// Which pending jobs block a delayed create on the task processor queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheck {
    /// Waiting, delayed and active jobs.
    IncludeActive,
    /// Waiting and delayed jobs only; used by the running job rescheduling itself.
    ExcludeActive,
}

/// What an agent removal did. Failures are collected, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalReport {
    pub agent: String,
    pub removed_repeating: usize,
    pub removed_jobs: usize,
    /// Queues deleted because the removal left them empty.
    pub deleted_queues: Vec<String>,
    pub failures: Vec<String>,
}

impl RemovalReport {
    /// Returns true if some step failed and was skipped.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Per-queue counters and the agents seen on the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub name: String,
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub agents: Vec<String>,
}

/// Agent CRUD on top of the queue registry.
#[derive(Clone)]
pub struct AgentDirectory {
    registry: Arc<QueueRegistry>,
    job_attempts: u32,
}

impl AgentDirectory {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            registry,
            job_attempts: DEFAULT_JOB_ATTEMPTS,
        }
    }

    /// Sets how many attempts the backend makes for each agent job.
    pub fn with_job_attempts(mut self, attempts: u32) -> Self {
        self.job_attempts = attempts.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    fn backend(&self) -> &Arc<dyn QueueBackend> {
        self.registry.backend()
    }

    fn job_options(&self) -> JobOptions {
        JobOptions::default().with_attempts(self.job_attempts)
    }

    /// Creates an agent, one-time or recurring depending on the descriptor.
    pub async fn create(&self, config: AgentConfig) -> Result<JobRecord, AgentError> {
        if config.one_time {
            self.create_one_time(config).await
        } else {
            self.create_recurring(config).await
        }
    }

    /// Enqueues a single run of the agent.
    pub async fn create_one_time(&self, config: AgentConfig) -> Result<JobRecord, AgentError> {
        let config = AgentConfig {
            one_time: true,
            ..config
        };
        config.validate()?;
        self.registry.get_or_create(&config.queue).await?;

        let opts = self
            .job_options()
            .with_job_id(one_time_job_id(&config.name, Utc::now()));
        let job = self
            .backend()
            .add_job(
                &config.queue,
                &config.name,
                AgentJobData::new(config.clone()).to_value()?,
                opts,
            )
            .await?;

        info!(agent = %config.name, queue = %config.queue, job_id = %job.id, "One-time agent created");
        Ok(job)
    }

    /// Creates or replaces the agent's repeating entry.
    ///
    /// Any existing entry for the agent on the same queue is removed first,
    /// so creating the same agent twice leaves exactly one entry.
    pub async fn create_recurring(&self, config: AgentConfig) -> Result<JobRecord, AgentError> {
        let config = AgentConfig {
            one_time: false,
            ..config
        };
        config.validate()?;
        let pattern = config
            .schedule
            .clone()
            .ok_or_else(|| AgentError::MissingSchedule(config.name.clone()))?;
        let schedule = Schedule::parse(&pattern)?;

        self.registry.get_or_create(&config.queue).await?;

        let key = config.repeat_key();
        if self.backend().remove_repeating(&config.queue, &key).await? {
            debug!(agent = %config.name, queue = %config.queue, "Replaced existing repeating entry");
        }

        let job = self
            .backend()
            .add_job(
                &config.queue,
                &config.name,
                AgentJobData::new(config.clone()).to_value()?,
                self.job_options().with_repeat(key, schedule),
            )
            .await?;

        info!(
            agent = %config.name,
            queue = %config.queue,
            schedule = %pattern,
            next_run = ?job.run_at,
            "Recurring agent created"
        );
        Ok(job)
    }

    /// Enqueues a run of the agent after `delay_ms`.
    ///
    /// On the task processor queue, an existing pending job of the same agent
    /// makes this a no-op; `check` decides whether active jobs count.
    pub async fn create_delayed(
        &self,
        config: AgentConfig,
        delay_ms: u64,
        check: DuplicateCheck,
    ) -> Result<DelayedOutcome, AgentError> {
        let config = AgentConfig {
            one_time: true,
            ..config
        };
        config.validate()?;
        self.registry.get_or_create(&config.queue).await?;

        if config.queue == self.registry.task_operator_queue() {
            // An active job whose lease lapsed counts as waiting, not running.
            let recovered = self.backend().recover_stalled(&config.queue).await?;
            if !recovered.is_empty() {
                info!(queue = %config.queue, jobs = ?recovered, "Recovered stalled jobs before duplicate check");
            }
            let states: &[JobState] = match check {
                DuplicateCheck::IncludeActive => {
                    &[JobState::Waiting, JobState::Delayed, JobState::Active]
                }
                DuplicateCheck::ExcludeActive => &[JobState::Waiting, JobState::Delayed],
            };
            let pending = self.backend().jobs_in(&config.queue, states).await?;
            if let Some(existing) = pending.iter().find(|j| j.belongs_to(&config.name)) {
                debug!(
                    agent = %config.name,
                    existing_job_id = %existing.id,
                    state = %existing.state,
                    "Equivalent job already pending, skipping delayed create"
                );
                return Ok(DelayedOutcome::Skipped {
                    existing_job_id: existing.id.clone(),
                });
            }
        }

        // Keyed on the due time so a job rescheduling itself gets a fresh id.
        let delay = Duration::from_millis(delay_ms);
        let now = Utc::now();
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        let opts = self
            .job_options()
            .with_job_id(one_time_job_id(&config.name, due))
            .with_delay(delay);
        let job = self
            .backend()
            .add_job(
                &config.queue,
                &config.name,
                AgentJobData::new(config.clone()).to_value()?,
                opts,
            )
            .await?;

        debug!(agent = %config.name, queue = %config.queue, delay_ms = delay_ms, job_id = %job.id, "Delayed job created");
        Ok(DelayedOutcome::Scheduled(job))
    }

    /// Rebuilds the status view of an agent.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::NotFound` if no queue has an entry or a job for it.
    pub async fn status(&self, name: &str) -> Result<AgentStatus, AgentError> {
        let key = repeat_key_for(name);
        let queues = self.registry.known_queues().await;

        let mut owner: Option<(String, Option<RepeatingEntry>)> = None;
        for queue in &queues {
            let entries = self.backend().repeating_entries(queue).await?;
            if let Some(entry) = entries.into_iter().find(|e| e.key == key) {
                owner = Some((queue.clone(), Some(entry)));
                break;
            }
        }

        let mut scanned: Option<Vec<JobRecord>> = None;
        if owner.is_none() {
            for queue in &queues {
                let jobs = self.agent_jobs(queue, name).await?;
                if !jobs.is_empty() {
                    owner = Some((queue.clone(), None));
                    scanned = Some(jobs);
                    break;
                }
            }
        }

        let (queue, entry) = owner.ok_or_else(|| AgentError::NotFound(name.to_string()))?;
        let jobs = match scanned {
            Some(jobs) => jobs,
            None => self.agent_jobs(&queue, name).await?,
        };
        let latest = jobs.first();

        let mut config = match (latest, &entry) {
            (Some(job), _) => AgentJobData::from_value(&job.data)?.config,
            (None, Some(entry)) => AgentJobData::from_value(&entry.data)?.config,
            (None, None) => return Err(AgentError::NotFound(name.to_string())),
        };
        if config.schedule.is_none() {
            config.schedule = entry.as_ref().map(|e| e.schedule.pattern());
        }

        Ok(AgentStatus {
            queue_name: queue,
            is_active: entry.is_some() || jobs.iter().any(|j| j.state == JobState::Active),
            last_run: jobs
                .iter()
                .find(|j| j.state == JobState::Completed)
                .and_then(|j| j.finished_at),
            next_run: entry.as_ref().map(|e| e.next_run),
            job_id: entry
                .as_ref()
                .map(|e| e.key.clone())
                .or_else(|| latest.map(|j| j.id.clone())),
            config,
        })
    }

    async fn agent_jobs(&self, queue: &str, name: &str) -> Result<Vec<JobRecord>, AgentError> {
        Ok(self
            .backend()
            .jobs_in(queue, &STATUS_SCAN)
            .await?
            .into_iter()
            .filter(|j| j.belongs_to(name))
            .collect())
    }

    /// Removes the agent's repeating entry and its waiting and delayed jobs
    /// from every queue, then cleans up queues left empty.
    ///
    /// Individual failures are collected in the report instead of aborting.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::NotFound` if no queue knows the agent.
    pub async fn remove(&self, name: &str) -> Result<RemovalReport, AgentError> {
        let key = repeat_key_for(name);
        let mut report = RemovalReport {
            agent: name.to_string(),
            ..Default::default()
        };
        let mut touched = BTreeSet::new();

        for queue in self.registry.known_queues().await {
            match self.backend().remove_repeating(&queue, &key).await {
                Ok(true) => {
                    report.removed_repeating += 1;
                    touched.insert(queue.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(agent = %name, queue = %queue, error = %e, "Failed to remove repeating entry");
                    report.failures.push(format!("{}: remove repeating entry: {}", queue, e));
                }
            }

            let jobs = match self.agent_jobs(&queue, name).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(agent = %name, queue = %queue, error = %e, "Failed to list agent jobs");
                    report.failures.push(format!("{}: list jobs: {}", queue, e));
                    continue;
                }
            };
            if !jobs.is_empty() {
                touched.insert(queue.clone());
            }

            for job in jobs
                .iter()
                .filter(|j| matches!(j.state, JobState::Waiting | JobState::Delayed))
            {
                match self.backend().remove_job(&queue, &job.id).await {
                    Ok(true) => report.removed_jobs += 1,
                    Ok(false) => debug!(job_id = %job.id, "Job already gone or running"),
                    Err(e) => {
                        warn!(agent = %name, job_id = %job.id, error = %e, "Failed to remove job");
                        report.failures.push(format!("{}: remove job {}: {}", queue, job.id, e));
                    }
                }
            }
        }

        if touched.is_empty() && report.failures.is_empty() {
            return Err(AgentError::NotFound(name.to_string()));
        }

        for queue in touched {
            if self.registry.check_and_cleanup_empty_queue(&queue).await {
                report.deleted_queues.push(queue);
            }
        }

        info!(
            agent = %name,
            removed_repeating = report.removed_repeating,
            removed_jobs = report.removed_jobs,
            failures = report.failures.len(),
            "Agent removed"
        );
        Ok(report)
    }

    /// Statuses of every agent on every known queue, sorted by name.
    pub async fn list(&self) -> Result<Vec<AgentStatus>, AgentError> {
        let mut names = BTreeSet::new();
        for queue in self.registry.known_queues().await {
            names.extend(self.agent_names(&queue).await?);
        }

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            match self.status(&name).await {
                Ok(status) => statuses.push(status),
                Err(e) => warn!(agent = %name, error = %e, "Skipping agent in listing"),
            }
        }
        Ok(statuses)
    }

    async fn agent_names(&self, queue: &str) -> Result<BTreeSet<String>, AgentError> {
        let mut names: BTreeSet<String> = self
            .backend()
            .repeating_entries(queue)
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();
        let jobs = self
            .backend()
            .jobs_in(queue, &JobState::ALL)
            .await?;
        names.extend(jobs.iter().map(|j| j.agent_name().to_string()));
        Ok(names)
    }

    /// Counters and agent names of one queue.
    pub async fn info(&self, queue: &str) -> Result<QueueInfo, AgentError> {
        if !self.registry.exists(queue).await? {
            return Err(RegistryError::QueueNotFound(queue.to_string()).into());
        }

        let counts = self.backend().counts(queue).await?;
        Ok(QueueInfo {
            name: queue.to_string(),
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
            agents: self.agent_names(queue).await?.into_iter().collect(),
        })
    }

    /// Info for every known queue, sorted by name.
    pub async fn list_queues(&self) -> Result<Vec<QueueInfo>, AgentError> {
        let mut infos = Vec::new();
        for queue in self.registry.known_queues().await {
            infos.push(self.info(&queue).await?);
        }
        Ok(infos)
    }
}
