//! OpenAI chat-completions backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Completion, PlannerError, Result};
use crate::selector::OPENAI_API_KEY_ENV;

/// Overrides the API host, e.g. for a proxy.
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Total attempts per call, counting the first.
const MAX_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Outcome of one HTTP attempt.
enum Attempt {
    Done(String),
    Retry(String),
}

#[derive(Debug, Clone)]
pub struct OpenAiChat {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
    retry_delay: Duration,
}

impl OpenAiChat {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlannerError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            http,
            retry_delay: BASE_RETRY_DELAY,
        })
    }

    /// Build from `OPENAI_API_KEY` and, if set, `OPENAI_BASE_URL`.
    pub fn from_env(model: &str) -> Result<Self> {
        let api_key = std::env::var(OPENAI_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PlannerError::NotConfigured(format!("{OPENAI_API_KEY_ENV} is not set")))?;
        let base_url = std::env::var(OPENAI_BASE_URL_ENV)
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url, &api_key, model)
    }

    /// First retry waits this long; each later one doubles it.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    async fn attempt(&self, body: &ChatRequest<'_>) -> Result<Attempt> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = match self.http.post(&url).headers(self.headers()).json(body).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Ok(Attempt::Retry(format!("request failed: {e}")));
            }
            Err(e) => return Err(PlannerError::Transport(format!("request failed: {e}"))),
        };

        let status = response.status();
        if status.is_success() {
            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| PlannerError::Transport(format!("invalid chat response: {e}")))?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| PlannerError::Transport("no choices returned".to_string()))?;
            return Ok(Attempt::Done(content));
        }

        let text = response.text().await.unwrap_or_default();
        let message = format!("OpenAI API error: {status} {}", error_detail(&text));
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PlannerError::RateLimited(message));
        }
        if status.is_server_error() {
            return Ok(Attempt::Retry(message));
        }
        Err(PlannerError::Transport(message))
    }
}

/// `error.message` from an API error body, else the trimmed body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl Completion for OpenAiChat {
    async fn complete(&self, system: &str, user: &str, cancel: &CancellationToken) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };
        info!(model = %self.model, prompt_len = system.len() + user.len(), "calling chat completions");

        let mut delay = self.retry_delay;
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PlannerError::Cancelled),
                outcome = self.attempt(&body) => outcome?,
            };
            match outcome {
                Attempt::Done(content) => {
                    debug!(response_len = content.len(), "chat completion received");
                    return Ok(content);
                }
                Attempt::Retry(message) => {
                    last_error = message;
                    if attempt == MAX_ATTEMPTS {
                        break;
                    }
                    warn!(
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "chat completion failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PlannerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                }
            }
        }
        Err(PlannerError::Transport(format!(
            "chat completion failed after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}
