//! Generative-text backend access with optional exponential backoff.
//!
//! # Architecture
//!
//! - [`TextBackend`]: one chat-completion round trip
//! - [`OpenAiChatClient`]: OpenAI-compatible `/chat/completions` over reqwest
//! - [`RetryAsk`]: decorator that adds retry logic to any [`TextBackend`]
//!
//! # Retry Strategy
//!
//! Retries are off unless `text.max_retries` is set. When enabled, the
//! delay doubles from the base delay, is capped at 30 seconds and gets a
//! random 0-250ms jitter. Content-policy refusals are never retried.

use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, instrument, warn};

use crate::config::{HttpConfig, TextConfig};
use crate::error::{BackendError, PipelineError};
use crate::utils::truncate_for_log;

/// One prompt sent to the text backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    /// Ask the backend for a bare JSON object.
    pub json_mode: bool,
    /// Overrides the configured limit for short answers.
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json_mode: false,
            max_tokens: None,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }
}

/// Text returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// Async chat-completion capability.
///
/// Implementors of this trait send one request and return one completion.
/// This abstraction allows for different backends or decorators (like retry logic).
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, BackendError>;
}

/// Wrapper that adds exponential backoff retry logic to any [`TextBackend`].
///
/// The delay between retries follows this formula:
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryAsk<T> {
    /// The underlying client to wrap.
    inner: T,
    /// Maximum number of retry attempts before giving up.
    max_retries: usize,
    /// Initial delay between retries (doubles with each attempt).
    base_delay: StdDuration,
    /// Maximum delay cap to prevent excessive waiting.
    max_delay: StdDuration,
}

impl<T> RetryAsk<T>
where
    T: TextBackend,
{
    /// Wrap `inner`; `max_retries = 0` means a single attempt.
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }
}

impl<T> RetryAsk<T> {
    /// Capped exponential delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: usize) -> StdDuration {
        let factor = u32::try_from(attempt.saturating_sub(1))
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl<T> fmt::Debug for RetryAsk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAsk")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[async_trait]
impl<T> TextBackend for RetryAsk<T>
where
    T: TextBackend,
{
    #[instrument(level = "info", skip_all)]
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, BackendError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries || matches!(e, BackendError::Refused(_)) {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis(),
                            elapsed_ms_total = total_dt.as_millis(),
                            error = %e,
                            "complete() giving up"
                        );
                        return Err(e);
                    }

                    let delay = self.backoff(attempt);
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + StdDuration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis(),
                        ?delay,
                        error = %e,
                        "complete() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for OpenAI-compatible chat-completions endpoints (Groq, OpenAI, local servers).
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatClient {
    pub fn new(
        config: &TextConfig,
        api_key: String,
        http: &HttpConfig,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(http.text_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl TextBackend for OpenAiChatClient {
    #[instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, BackendError> {
        let t0 = Instant::now();
        let body = ChatBody {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: self.temperature,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            response_format: request
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(BackendError::from_reqwest)?;
        debug!(elapsed_ms = t0.elapsed().as_millis(), %status, "Chat completion returned");

        if !status.is_success() {
            warn!(%status, body = %truncate_for_log(&text, 300), "Text backend error");
            if status == StatusCode::BAD_REQUEST && is_policy_rejection(&text) {
                return Err(BackendError::Refused(truncate_for_log(&text, 200)));
            }
            return Err(BackendError::Rejected(format!(
                "HTTP {status}: {}",
                truncate_for_log(&text, 200)
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            BackendError::Rejected(format!("malformed completion payload: {e}"))
        })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Rejected("completion has no choices".to_string()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(BackendError::Refused("finish_reason=content_filter".to_string()));
        }

        Ok(Completion {
            content: choice.message.and_then(|m| m.content).unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }
}

fn is_policy_rejection(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["content_policy", "content_filter", "safety", "moderation"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Build the configured text backend, or `None` when no API key is set.
pub fn text_backend(
    config: &TextConfig,
    http: &HttpConfig,
) -> Result<Option<Arc<dyn TextBackend>>, PipelineError> {
    let Some(key) = config.api_key.clone().filter(|k| !k.trim().is_empty()) else {
        return Ok(None);
    };
    let client = OpenAiChatClient::new(config, key, http)?;
    let backend = RetryAsk::new(client, config.max_retries, StdDuration::from_secs(1));
    Ok(Some(Arc::new(backend)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OpenAiChatClient {
        let config = TextConfig {
            endpoint: format!("{}/v1", server.uri()),
            ..TextConfig::default()
        };
        OpenAiChatClient::new(&config, "test-key".into(), &HttpConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_completion_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "[TITLE]x[/TITLE]"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let out = client_for(&server)
            .complete(&ChatRequest::new("sys", "user"))
            .await
            .unwrap();
        assert_eq!(out.content, "[TITLE]x[/TITLE]");
        assert_eq!(out.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_content_filter_is_refusal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(&ChatRequest::new("sys", "user"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Refused(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(&ChatRequest::new("sys", "user"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        refuse: bool,
    }

    #[async_trait]
    impl TextBackend for Flaky {
        async fn complete(&self, _: &ChatRequest) -> Result<Completion, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(BackendError::Refused("no".into()));
            }
            if n < self.fail_first {
                return Err(BackendError::Unavailable("down".into()));
            }
            Ok(Completion {
                content: "ok".into(),
                finish_reason: None,
            })
        }
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let retry = RetryAsk::new(
            Flaky { calls: AtomicUsize::new(0), fail_first: 1, refuse: false },
            0,
            StdDuration::from_millis(1),
        );
        assert!(retry.complete(&ChatRequest::new("s", "u")).await.is_err());
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_but_not_on_refusal() {
        let retry = RetryAsk::new(
            Flaky { calls: AtomicUsize::new(0), fail_first: 2, refuse: false },
            3,
            StdDuration::from_millis(1),
        );
        assert_eq!(retry.complete(&ChatRequest::new("s", "u")).await.unwrap().content, "ok");
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 3);

        let refusing = RetryAsk::new(
            Flaky { calls: AtomicUsize::new(0), fail_first: 0, refuse: true },
            3,
            StdDuration::from_millis(1),
        );
        assert!(refusing.complete(&ChatRequest::new("s", "u")).await.is_err());
        assert_eq!(refusing.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let retry = RetryAsk::new(
            Flaky { calls: AtomicUsize::new(0), fail_first: 0, refuse: false },
            100,
            StdDuration::from_secs(1),
        );
        assert_eq!(retry.backoff(1), StdDuration::from_secs(1));
        assert_eq!(retry.backoff(3), StdDuration::from_secs(4));
        assert_eq!(retry.backoff(6), StdDuration::from_secs(30));
        assert_eq!(retry.backoff(33), StdDuration::from_secs(30));
        assert_eq!(retry.backoff(100), StdDuration::from_secs(30));
    }

    #[test]
    fn test_backend_absent_without_key() {
        let backend = text_backend(&TextConfig::default(), &HttpConfig::default()).unwrap();
        assert!(backend.is_none());
    }
}
