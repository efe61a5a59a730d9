//! Job processor behind every queue worker.
//!
//! A normal agent job is one HTTP call to its target. A job whose target is
//! the internal tick URL instead runs one task processor tick and schedules
//! the next tick on the same queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::processor::{TaskProcessor, TickOutcome};

use super::directory::{AgentDirectory, DelayedOutcome, DuplicateCheck};
use super::job::{AgentConfig, AgentJobData, HttpMethod, JobRecord};
use super::worker_pool::JobProcessor;

/// Delay before the next tick after a normal outcome.
pub const TICK_INTERVAL_MS: u64 = 5_000;

/// Delay before the next tick after a failed dispatch or a tick error.
pub const TICK_RETRY_INTERVAL_MS: u64 = 10_000;

/// Longest error body kept in a failed job's reason.
const MAX_ERROR_BODY: usize = 500;

/// Executes agent jobs.
pub struct DispatchWorker {
    directory: AgentDirectory,
    processor: Arc<TaskProcessor>,
    client: Client,
}

impl DispatchWorker {
    pub fn new(directory: AgentDirectory, processor: Arc<TaskProcessor>) -> Self {
        Self::with_client(directory, processor, Client::new())
    }

    pub fn with_client(
        directory: AgentDirectory,
        processor: Arc<TaskProcessor>,
        client: Client,
    ) -> Self {
        Self {
            directory,
            processor,
            client,
        }
    }

    /// Runs one tick and chains the next one.
    async fn run_tick(&self, config: AgentConfig) -> Result<Value, DispatchError> {
        if !self.processor.is_enabled().await {
            info!(queue = %config.queue, "Task operator disabled, tick chain stopped");
            return Ok(json!({ "status": "disabled" }));
        }

        let (result, delay_ms) = match self.processor.tick().await {
            Ok(report) => {
                for warning in &report.warnings {
                    warn!(warning = %warning, "Tick completed with warning");
                }
                let delay_ms = match report.outcome {
                    TickOutcome::Failed { .. } => TICK_RETRY_INTERVAL_MS,
                    _ => TICK_INTERVAL_MS,
                };
                (serde_json::to_value(&report).unwrap_or_default(), delay_ms)
            }
            Err(e) => {
                error!(error = %e, "Task operator tick failed");
                (
                    json!({ "status": "error", "error": e.to_string() }),
                    TICK_RETRY_INTERVAL_MS,
                )
            }
        };

        match self
            .directory
            .create_delayed(config, delay_ms, DuplicateCheck::ExcludeActive)
            .await?
        {
            DelayedOutcome::Scheduled(job) => {
                debug!(job_id = %job.id, delay_ms = delay_ms, "Next tick scheduled");
            }
            DelayedOutcome::Skipped { existing_job_id } => {
                debug!(existing_job_id = %existing_job_id, "Next tick already pending");
            }
        }

        Ok(result)
    }

    /// Calls the agent's target and honors a requeue request in the response.
    async fn call_target(&self, config: AgentConfig) -> Result<Value, DispatchError> {
        let url = config.target_url.clone();
        let timeout_ms = config.timeout_ms;

        let mut request = self.client.request(reqwest_method(config.method), &url);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &config.body {
            if config.method.carries_body() {
                request = request.json(body);
            }
        }

        let call = async {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<(StatusCode, String), reqwest::Error>((status, text))
        };

        let (status, text) = match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await
        {
            Err(_) => return Err(DispatchError::Timeout { url, timeout_ms }),
            Ok(Err(e)) => {
                return Err(DispatchError::Transport {
                    url,
                    message: e.to_string(),
                })
            }
            Ok(Ok(response)) => response,
        };

        if !status.is_success() {
            return Err(DispatchError::HttpStatus {
                url,
                status: status.as_u16(),
                body: truncate(&text, MAX_ERROR_BODY),
            });
        }

        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if let Some(delay_ms) = requested_delay(&value) {
            let agent = config.name.clone();
            match self
                .directory
                .create_delayed(config, delay_ms, DuplicateCheck::IncludeActive)
                .await?
            {
                DelayedOutcome::Scheduled(job) => {
                    info!(agent = %agent, job_id = %job.id, delay_ms = delay_ms, "Agent requeued by target")
                }
                DelayedOutcome::Skipped { existing_job_id } => {
                    debug!(agent = %agent, existing_job_id = %existing_job_id, "Requeue skipped, run already pending")
                }
            }
        }

        Ok(value)
    }
}

#[async_trait]
impl JobProcessor for DispatchWorker {
    async fn process(&self, job: &JobRecord) -> Result<Value, DispatchError> {
        let data = AgentJobData::from_value(&job.data)
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;

        if data.config.is_internal_tick() {
            self.run_tick(data.config).await
        } else {
            self.call_target(data.config).await
        }
    }
}

fn reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Patch => Method::PATCH,
    }
}

/// Delay asked for by a target response: a truthy `requeue` and a numeric `delay`.
fn requested_delay(response: &Value) -> Option<u64> {
    if !response.get("requeue").is_some_and(is_truthy) {
        return None;
    }
    let delay = response.get("delay")?;
    delay
        .as_u64()
        .or_else(|| delay.as_f64().filter(|d| *d >= 0.0).map(|d| d as u64))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_delay() {
        assert_eq!(requested_delay(&json!({"requeue": true, "delay": 5000})), Some(5000));
        assert_eq!(requested_delay(&json!({"requeue": 1, "delay": 250.0})), Some(250));
        assert_eq!(requested_delay(&json!({"requeue": "yes", "delay": 0})), Some(0));
        assert_eq!(requested_delay(&json!({"requeue": false, "delay": 5000})), None);
        assert_eq!(requested_delay(&json!({"requeue": true})), None);
        assert_eq!(requested_delay(&json!({"requeue": true, "delay": "5000"})), None);
        assert_eq!(requested_delay(&json!({"requeue": true, "delay": -1})), None);
        assert_eq!(requested_delay(&json!("ok")), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_method_mapping() {
        assert_eq!(reqwest_method(HttpMethod::Get), Method::GET);
        assert_eq!(reqwest_method(HttpMethod::Patch), Method::PATCH);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo", 2), "h...");
    }
}
