//! Agent descriptors and queue job records.
//!
//! This module defines the data carried through the scheduling system:
//!
//! - `AgentConfig`: A configured unit of work (an HTTP call, or the internal
//!   task processor tick)
//! - `Schedule`: Cron pattern or fixed interval for recurring agents
//! - `JobRecord`: A job as stored by a queue backend, with its current state
//! - `RepeatingEntry`: Backend record of a recurring job
//! - `JobCounts`: Per-state counters for a queue

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

use super::backend::QueueError;

/// Name of the queue that always exists and can never be deleted.
pub const DEFAULT_QUEUE: &str = "default";

/// Default timeout for an agent's HTTP call.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Reserved target URL that routes a job to the task processor instead of HTTP.
pub const INTERNAL_TICK_URL: &str = "task-operator://tick";

/// Agent name used for the task processor tick chain.
pub const TASK_OPERATOR_AGENT: &str = "task-operator";

/// Default number of attempts the backend makes for a job.
pub const DEFAULT_JOB_ATTEMPTS: u32 = 3;

/// Base delay for the backend's exponential job retry.
pub const DEFAULT_JOB_BACKOFF_MS: u64 = 1_000;

/// Prefix shared by every job id and repeating key derived from an agent name.
const AGENT_KEY_PREFIX: &str = "agent:";

/// HTTP method used for an agent's target call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    /// Returns the canonical upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }

    /// Whether a JSON body is sent with this method.
    pub fn carries_body(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(AgentError::InvalidConfig(format!(
                "unsupported HTTP method '{}' (expected GET, POST, PUT, DELETE or PATCH)",
                other
            ))),
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// A configured agent: what to call, how, and when.
///
/// Serialized in camelCase because the same document is stored as job data
/// and returned through agent status views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Unique name of the agent within its queue.
    pub name: String,
    /// URL called when the agent runs, or [`INTERNAL_TICK_URL`].
    pub target_url: String,
    /// HTTP method for the call.
    #[serde(default)]
    pub method: HttpMethod,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Optional JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Request timeout in milliseconds, serialized as `timeout`.
    #[serde(rename = "timeout", alias = "timeoutMs", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Queue the agent's jobs are placed on.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Cron pattern or interval in milliseconds for recurring agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Run once instead of on a schedule.
    #[serde(default)]
    pub one_time: bool,
}

impl AgentConfig {
    /// Creates a recurring-agent descriptor with default method, timeout and queue.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique agent name
    /// * `target_url` - URL to call on every run
    pub fn new(name: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_url: target_url.into(),
            method: HttpMethod::default(),
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            queue: DEFAULT_QUEUE.to_string(),
            schedule: None,
            one_time: false,
        }
    }

    /// Creates the descriptor of the task processor tick agent.
    ///
    /// # Arguments
    ///
    /// * `queue` - Name of the reserved task processor queue
    pub fn task_operator(queue: impl Into<String>) -> Self {
        Self::new(TASK_OPERATOR_AGENT, INTERNAL_TICK_URL)
            .with_queue(queue)
            .one_time()
    }

    /// Sets the HTTP method.
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the request timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sets the queue name.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the recurring schedule.
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Marks the agent as one-time.
    pub fn one_time(mut self) -> Self {
        self.one_time = true;
        self
    }

    /// Returns true if this agent drives the task processor instead of calling HTTP.
    pub fn is_internal_tick(&self) -> bool {
        self.target_url == INTERNAL_TICK_URL
    }

    /// Key of the agent's repeating entry.
    pub fn repeat_key(&self) -> String {
        repeat_key_for(&self.name)
    }

    /// Checks the descriptor before anything is enqueued.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::InvalidConfig` for an empty name or URL, a zero
    /// timeout or an empty queue, and `AgentError::MissingSchedule` for a
    /// recurring agent without a schedule.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "agent name must not be empty".to_string(),
            ));
        }
        if self.target_url.trim().is_empty() {
            return Err(AgentError::InvalidConfig(format!(
                "agent '{}' has an empty target URL",
                self.name
            )));
        }
        if self.timeout_ms == 0 {
            return Err(AgentError::InvalidConfig(format!(
                "agent '{}' must have a timeout greater than 0",
                self.name
            )));
        }
        if self.queue.trim().is_empty() {
            return Err(AgentError::InvalidConfig(format!(
                "agent '{}' has an empty queue name",
                self.name
            )));
        }
        if !self.one_time && self.schedule.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(AgentError::MissingSchedule(self.name.clone()));
        }
        Ok(())
    }
}

/// Key of the repeating entry owned by the named agent.
pub fn repeat_key_for(agent_name: &str) -> String {
    format!("{}{}", AGENT_KEY_PREFIX, agent_name)
}

/// Id for a one-time or delayed job of the named agent.
pub fn one_time_job_id(agent_name: &str, at: DateTime<Utc>) -> String {
    format!("{}{}:{}", AGENT_KEY_PREFIX, agent_name, at.timestamp_millis())
}

/// Payload stored with every agent job.
///
/// The agent name is duplicated into `agentName` so jobs can be matched
/// without relying on the job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJobData {
    pub agent_name: String,
    #[serde(flatten)]
    pub config: AgentConfig,
}

impl AgentJobData {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            agent_name: config.name.clone(),
            config,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

/// When a recurring job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Schedule {
    /// Cron pattern with a seconds field.
    Cron(String),
    /// Fixed interval in milliseconds.
    Every(u64),
}

impl Schedule {
    /// Parses a schedule string.
    ///
    /// A string of digits is an interval in milliseconds. Anything else is a
    /// cron pattern; five-field patterns get a leading `0` seconds field.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidSchedule` if the pattern does not parse or
    /// the interval is zero.
    pub fn parse(pattern: &str) -> Result<Self, QueueError> {
        let trimmed = pattern.trim();
        let invalid = |reason: &str| QueueError::InvalidSchedule {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("schedule is empty"));
        }

        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            let every: u64 = trimmed
                .parse()
                .map_err(|_| invalid("interval does not fit in 64 bits"))?;
            if every == 0 {
                return Err(invalid("interval must be greater than 0"));
            }
            return Ok(Schedule::Every(every));
        }

        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {}", trimmed),
            6 | 7 => trimmed.split_whitespace().collect::<Vec<_>>().join(" "),
            _ => return Err(invalid("expected 5, 6 or 7 cron fields")),
        };

        cron::Schedule::from_str(&normalized).map_err(|e| invalid(&e.to_string()))?;
        Ok(Schedule::Cron(normalized))
    }

    /// Returns the first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(pattern) => cron::Schedule::from_str(pattern)
                .ok()
                .and_then(|schedule| schedule.after(&after).next()),
            Schedule::Every(ms) => {
                let step = chrono::Duration::milliseconds(i64::try_from(*ms).ok()?);
                after.checked_add_signed(step)
            }
        }
    }

    /// Human-readable pattern, as accepted by [`Schedule::parse`].
    pub fn pattern(&self) -> String {
        match self {
            Schedule::Cron(pattern) => pattern.clone(),
            Schedule::Every(ms) => ms.to_string(),
        }
    }
}

/// State of a job inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    /// All states, in the order status reconstruction scans them.
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Delayed,
        JobState::Failed,
    ];

    /// Whether a job in this state can still run.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active | JobState::Delayed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Delayed => write!(f, "delayed"),
        }
    }
}

/// Repeat settings attached to a job when it is added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatOptions {
    /// Key of the repeating entry; adding with an existing key replaces it.
    pub key: String,
    pub schedule: Schedule,
}

/// Options for adding a job to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Caller-supplied id. Adding a job whose id already exists is a no-op
    /// that returns the existing job.
    pub job_id: Option<String>,
    /// Delay before the job becomes waiting.
    pub delay: Option<Duration>,
    /// Makes the job recurring.
    pub repeat: Option<RepeatOptions>,
    /// Total attempts before the job is moved to failed.
    pub attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub backoff_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: None,
            repeat: None,
            attempts: DEFAULT_JOB_ATTEMPTS,
            backoff_ms: DEFAULT_JOB_BACKOFF_MS,
        }
    }
}

impl JobOptions {
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_repeat(mut self, key: impl Into<String>, schedule: Schedule) -> Self {
        self.repeat = Some(RepeatOptions {
            key: key.into(),
            schedule,
        });
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

/// A job as stored by a queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    /// Job name; agent jobs use the agent name.
    pub name: String,
    pub queue: String,
    pub data: Value,
    pub state: JobState,
    /// Number of finished attempts (successful or not).
    #[serde(default)]
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes due.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub return_value: Option<Value>,
    /// Repeating entry this job was materialized from.
    #[serde(default)]
    pub repeat_key: Option<String>,
}

impl JobRecord {
    /// Builds a new record in the state implied by `run_at`.
    pub fn new(
        queue: &str,
        name: &str,
        id: String,
        data: Value,
        run_at: Option<DateTime<Utc>>,
        opts: &JobOptions,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            queue: queue.to_string(),
            data,
            state: if run_at.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            max_attempts: opts.attempts.max(1),
            backoff_ms: opts.backoff_ms,
            created_at: Utc::now(),
            run_at,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
            repeat_key: None,
        }
    }

    /// Agent name from `agentName` in the job data, falling back to the job name.
    pub fn agent_name(&self) -> &str {
        self.data
            .get("agentName")
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
    }

    /// Whether the job belongs to the named agent.
    pub fn belongs_to(&self, agent_name: &str) -> bool {
        self.agent_name() == agent_name
    }

    /// Delay before the next retry, doubling per finished attempt.
    pub fn retry_delay(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exponent))
    }

    /// Whether another attempt is allowed after the current one failed.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// Backend record of a recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatingEntry {
    pub key: String,
    /// Job name used for every occurrence.
    pub name: String,
    pub queue: String,
    pub schedule: Schedule,
    /// Next fire time.
    pub next_run: DateTime<Utc>,
    /// Id of the delayed job holding the next occurrence.
    pub next_job_id: String,
    /// Job data copied into every occurrence.
    pub data: Value,
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl RepeatingEntry {
    /// Id of the occurrence firing at `at`.
    pub fn occurrence_id(key: &str, at: DateTime<Utc>) -> String {
        format!("repeat:{}:{}", key, at.timestamp_millis())
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts,
            backoff_ms: self.backoff_ms,
            ..JobOptions::default()
        }
    }

    /// Builds the delayed job for the occurrence firing at `next_run`.
    pub fn occurrence(&self) -> JobRecord {
        let mut job = JobRecord::new(
            &self.queue,
            &self.name,
            self.next_job_id.clone(),
            self.data.clone(),
            Some(self.next_run),
            &self.job_options(),
        );
        job.repeat_key = Some(self.key.clone());
        job
    }
}

/// Per-state job counters for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub repeating: usize,
}

impl JobCounts {
    /// Jobs and entries that keep a queue alive.
    pub fn pending(&self) -> usize {
        self.waiting + self.active + self.delayed + self.repeating
    }

    /// Returns true if nothing can run on the queue any more.
    pub fn is_drained(&self) -> bool {
        self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::new("daily-check", "http://example.com/hook");

        assert_eq!(config.method, HttpMethod::Post);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.queue, DEFAULT_QUEUE);
        assert!(!config.one_time);
        assert_eq!(config.repeat_key(), "agent:daily-check");
    }

    #[test]
    fn test_agent_config_validation() {
        let missing_schedule = AgentConfig::new("a", "http://example.com");
        assert!(matches!(
            missing_schedule.validate(),
            Err(AgentError::MissingSchedule(name)) if name == "a"
        ));

        assert!(AgentConfig::new("a", "http://example.com")
            .with_schedule("0 0 * * *")
            .validate()
            .is_ok());
        assert!(AgentConfig::new("a", "http://example.com")
            .one_time()
            .validate()
            .is_ok());
        assert!(AgentConfig::new(" ", "http://example.com")
            .one_time()
            .validate()
            .is_err());
        assert!(AgentConfig::new("a", "").one_time().validate().is_err());
        assert!(AgentConfig::new("a", "http://example.com")
            .one_time()
            .with_timeout_ms(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_http_method_parse() {
        assert_eq!("get".parse::<HttpMethod>().expect("valid"), HttpMethod::Get);
        assert_eq!(
            " Patch ".parse::<HttpMethod>().expect("valid"),
            HttpMethod::Patch
        );
        assert!("TRACE".parse::<HttpMethod>().is_err());
        assert!(!HttpMethod::Get.carries_body());
        assert!(HttpMethod::Delete.carries_body());
    }

    #[test]
    fn test_agent_job_data_shape() {
        let config = AgentConfig::new("poller", "http://example.com")
            .with_method(HttpMethod::Get)
            .with_header("X-Token", "abc")
            .one_time();
        let value = AgentJobData::new(config.clone())
            .to_value()
            .expect("serialization should work");

        assert_eq!(value["agentName"], "poller");
        assert_eq!(value["targetUrl"], "http://example.com");
        assert_eq!(value["method"], "GET");
        assert_eq!(value["headers"]["X-Token"], "abc");

        let parsed = AgentJobData::from_value(&value).expect("deserialization should work");
        assert_eq!(parsed.config, config);
    }

    #[test]
    fn test_agent_job_data_fills_defaults() {
        let value = serde_json::json!({
            "agentName": "minimal",
            "name": "minimal",
            "targetUrl": "http://example.com",
        });
        let parsed = AgentJobData::from_value(&value).expect("deserialization should work");

        assert_eq!(parsed.config.method, HttpMethod::Post);
        assert_eq!(parsed.config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(parsed.config.queue, DEFAULT_QUEUE);
    }

    #[test]
    fn test_timeout_field_name() {
        let config = AgentConfig::new("slow", "http://example.com")
            .one_time()
            .with_timeout_ms(5000);
        let value = serde_json::to_value(&config).expect("serialization should work");
        assert_eq!(value["timeout"], 5000);
        assert!(value.get("timeoutMs").is_none());

        let parsed: AgentConfig = serde_json::from_value(serde_json::json!({
            "name": "slow",
            "targetUrl": "http://example.com",
            "timeout": 1500,
        }))
        .expect("deserialization should work");
        assert_eq!(parsed.timeout_ms, 1500);

        let legacy: AgentConfig = serde_json::from_value(serde_json::json!({
            "name": "slow",
            "targetUrl": "http://example.com",
            "timeoutMs": 2500,
        }))
        .expect("deserialization should work");
        assert_eq!(legacy.timeout_ms, 2500);
    }

    #[test]
    fn test_schedule_parse() {
        assert_eq!(Schedule::parse("60000").expect("interval"), Schedule::Every(60000));
        assert_eq!(
            Schedule::parse("0 0 * * *").expect("five fields"),
            Schedule::Cron("0 0 0 * * *".to_string())
        );
        assert_eq!(
            Schedule::parse("*/10 * * * * *").expect("six fields"),
            Schedule::Cron("*/10 * * * * *".to_string())
        );
        assert!(Schedule::parse("").is_err());
        assert!(Schedule::parse("0").is_err());
        assert!(Schedule::parse("not a cron").is_err());
    }

    #[test]
    fn test_schedule_next_after() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();

        let hourly = Schedule::parse("0 * * * *").expect("valid cron");
        assert_eq!(
            hourly.next_after(base),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap())
        );

        let every = Schedule::Every(5_000);
        assert_eq!(
            every.next_after(base),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 5).unwrap())
        );
    }

    #[test]
    fn test_job_record_retry_delay() {
        let opts = JobOptions::default();
        let mut job = JobRecord::new("q", "a", "1".to_string(), Value::Null, None, &opts);
        assert_eq!(job.state, JobState::Waiting);

        job.attempts_made = 1;
        assert_eq!(job.retry_delay(), Duration::from_millis(1_000));
        job.attempts_made = 3;
        assert_eq!(job.retry_delay(), Duration::from_millis(4_000));
        assert!(!job.can_retry());
    }

    #[test]
    fn test_job_record_agent_name_fallback() {
        let opts = JobOptions::default();
        let job = JobRecord::new(
            "q",
            "by-name",
            "1".to_string(),
            serde_json::json!({"other": 1}),
            None,
            &opts,
        );
        assert_eq!(job.agent_name(), "by-name");

        let job = JobRecord::new(
            "q",
            "ignored",
            "2".to_string(),
            serde_json::json!({"agentName": "by-data"}),
            Some(Utc::now()),
            &opts,
        );
        assert_eq!(job.agent_name(), "by-data");
        assert_eq!(job.state, JobState::Delayed);
    }

    #[test]
    fn test_job_counts() {
        let counts = JobCounts {
            completed: 10,
            failed: 2,
            ..Default::default()
        };
        assert!(counts.is_drained());

        let counts = JobCounts {
            repeating: 1,
            ..Default::default()
        };
        assert_eq!(counts.pending(), 1);
        assert!(!counts.is_drained());
    }

    #[test]
    fn test_job_state_display() {
        assert_eq!(JobState::Waiting.to_string(), "waiting");
        assert_eq!(JobState::Delayed.to_string(), "delayed");
        assert!(JobState::Active.is_pending());
        assert!(!JobState::Completed.is_pending());
    }
}
