use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One prompt sent to a text-generation service.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub json_mode: bool,
}

/// Abstraction over the external generation service so agents can be
/// driven by a test double.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Retry schedule for transient failures (transport errors, 429, 5xx).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// clamped to `[min_backoff, max_backoff]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_backoff
            .saturating_mul(factor)
            .clamp(self.min_backoff, self.max_backoff.max(self.min_backoff))
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Chat-completions client over HTTP.
pub struct HttpGenerationClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            retry,
        })
    }

    async fn send_once(&self, body: &ChatRequest<'_>) -> Result<Attempt> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(Attempt::Retry(format!("request to {} failed: {}", url, e))),
        };

        let status = resp.status();
        if is_retryable_status(status) {
            let text = resp.text().await.unwrap_or_default();
            return Ok(Attempt::Retry(format!("generation service returned {}: {}", status, text)));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("generation service returned {}: {}", status, text);
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .context("Failed to decode generation response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("generation response contained no content")?;
        Ok(Attempt::Done(content))
    }
}

enum Attempt {
    Done(String),
    Retry(String),
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        let body = ChatRequest {
            model: &self.model,
            messages,
            response_format: request
                .json_mode
                .then(|| serde_json::json!({"type": "json_object"})),
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.send_once(&body).await? {
                Attempt::Done(content) => return Ok(content),
                Attempt::Retry(reason) => {
                    last_error = reason;
                    if attempt < max_attempts {
                        let delay = self.retry.backoff(attempt);
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "generation call failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        bail!(
            "generation failed after {} attempts: {}",
            max_attempts,
            last_error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;

    #[test]
    fn backoff_doubles_and_clamps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    /// Serve a chat endpoint that fails `failures` times with `status` before answering.
    async fn spawn_server(failures: u32, status: AxumStatus) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        (status, "try later".to_string())
                    } else {
                        (
                            AxumStatus::OK,
                            r#"{"choices":[{"message":{"content":"{\"ok\":true}"}}]}"#.to_string(),
                        )
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), calls)
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_prompt: Some("You are terse.".into()),
            prompt: "Say ok".into(),
            json_mode: true,
        }
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let (url, calls) = spawn_server(2, AxumStatus::SERVICE_UNAVAILABLE).await;
        let client =
            HttpGenerationClient::new(&url, "test-model", None, Duration::from_secs(5), fast_retry())
                .unwrap();
        let content = client.generate(&request()).await.unwrap();
        assert_eq!(content, r#"{"ok":true}"#);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, calls) = spawn_server(10, AxumStatus::TOO_MANY_REQUESTS).await;
        let client =
            HttpGenerationClient::new(&url, "test-model", None, Duration::from_secs(5), fast_retry())
                .unwrap();
        let err = client.generate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, calls) = spawn_server(10, AxumStatus::BAD_REQUEST).await;
        let client =
            HttpGenerationClient::new(&url, "test-model", None, Duration::from_secs(5), fast_retry())
                .unwrap();
        let err = client.generate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("400"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
