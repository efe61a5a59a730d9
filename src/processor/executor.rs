//! Client for the downstream executor that runs backlog prompts.
//!
//! The executor accepts work asynchronously: `/execute/async` returns as soon
//! as the prompt is queued and the result is delivered later to the callback
//! URL carried in the request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default request timeout in milliseconds.
pub const DEFAULT_EXECUTOR_TIMEOUT_MS: u64 = 30_000;

/// Errors returned by an executor client.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Executor unreachable: {0}")]
    Connect(String),

    #[error("Executor request timed out")]
    Timeout,

    #[error("Executor request failed: {0}")]
    Request(String),

    #[error("Failed to parse executor response: {0}")]
    Parse(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl ExecutorError {
    /// Whether the failure is worth retrying: overload, gateway errors,
    /// refused connections and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Status { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            ExecutorError::Connect(_) | ExecutorError::Timeout => true,
            _ => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExecutorError::Timeout
        } else if err.is_connect() {
            ExecutorError::Connect(err.to_string())
        } else {
            ExecutorError::Request(err.to_string())
        }
    }
}

/// Body of an asynchronous execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub prompt: String,
    pub request_id: String,
    pub callback_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub task_id: i64,
}

/// Executor operations the task processor relies on.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Opens a conversation for a task and returns its id.
    async fn new_conversation(&self) -> Result<String, ExecutorError>;

    /// Queues a prompt for asynchronous execution.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), ExecutorError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationResponse {
    conversation_id: String,
}

/// HTTP executor client.
pub struct HttpExecutor {
    client: Client,
    base_url: String,
}

impl HttpExecutor {
    /// Creates a client for `base_url` with a per-request timeout.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Executor root, e.g. "http://executor:3001"
    /// * `timeout` - Upper bound for each request
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutorError::Client(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, ExecutorError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(ExecutorError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn new_conversation(&self) -> Result<String, ExecutorError> {
        let response = self
            .post_json("/conversations", &serde_json::json!({}))
            .await?;
        let parsed: ConversationResponse = response
            .json()
            .await
            .map_err(|e| ExecutorError::Parse(e.to_string()))?;
        Ok(parsed.conversation_id)
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), ExecutorError> {
        self.post_json("/execute/async", request).await?;
        debug!(request_id = %request.request_id, task_id = request.task_id, "Executor accepted prompt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> DispatchRequest {
        DispatchRequest {
            prompt: "Fix the flaky test".to_string(),
            request_id: "task-abc".to_string(),
            callback_url: "http://svc/task-operator/callback".to_string(),
            conversation_id: None,
            task_id: 12,
        }
    }

    #[test]
    fn test_transient_classification() {
        for status in [429, 502, 503, 504] {
            let err = ExecutorError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_transient(), "{} should be transient", status);
        }
        let err = ExecutorError::Status {
            status: 500,
            body: String::new(),
        };
        assert!(!err.is_transient());
        assert!(ExecutorError::Timeout.is_transient());
        assert!(ExecutorError::Connect("refused".into()).is_transient());
        assert!(!ExecutorError::Parse("bad".into()).is_transient());
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(value["requestId"], "task-abc");
        assert_eq!(value["callbackUrl"], "http://svc/task-operator/callback");
        assert_eq!(value["taskId"], 12);
        assert!(value.get("conversationId").is_none());
    }

    #[tokio::test]
    async fn test_http_executor_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"conversationId": "conv-1"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/execute/async"))
            .and(body_partial_json(serde_json::json!({"requestId": "task-abc"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpExecutor::new(server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(executor.new_conversation().await.unwrap(), "conv-1");
        executor.dispatch(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_executor_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute/async"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let executor = HttpExecutor::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = executor.dispatch(&request()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }
}
