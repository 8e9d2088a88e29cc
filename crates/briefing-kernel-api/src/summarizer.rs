//! Client side of the external text summarizer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{SummarizerConfig, SUMMARIZER_API_KEY_ENV};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizeRequest {
    /// Call site, e.g. `generate_context` or `digest_interaction`.
    pub operation: String,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum SummarizerError {
    /// Rendered with the `rate_limit` marker so journal classification can see it.
    #[error("rate_limit: summarizer returned 429 Too Many Requests")]
    RateLimited,
    #[error("summarizer returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("summarizer transport error: {0}")]
    Transport(String),
    #[error("summarizer returned an empty response")]
    EmptyResponse,
    #[error("summarizer is not configured (set {SUMMARIZER_API_KEY_ENV})")]
    NotConfigured,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn complete(&self, request: SummarizeRequest) -> Result<Completion, SummarizerError>;
}

/// Placeholder used when no API key is available; every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    async fn complete(&self, _request: SummarizeRequest) -> Result<Completion, SummarizerError> {
        Err(SummarizerError::NotConfigured)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Messages-style HTTP summarizer.
pub struct HttpSummarizer {
    client: Client,
    api_key: String,
    config: SummarizerConfig,
}

impl HttpSummarizer {
    /// # Errors
    /// Returns [`SummarizerError::Transport`] when the HTTP client cannot be built.
    pub fn new(config: SummarizerConfig, api_key: String) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| SummarizerError::Transport(err.to_string()))?;
        Ok(Self { client, api_key, config })
    }

    /// Build a client from the API key in the environment, if one is set.
    ///
    /// # Errors
    /// Returns [`SummarizerError::Transport`] when the HTTP client cannot be built.
    pub fn from_env(config: SummarizerConfig) -> Result<Option<Self>, SummarizerError> {
        match std::env::var(SUMMARIZER_API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Self::new(config, key.trim().to_string()).map(Some),
            _ => Ok(None),
        }
    }

    async fn send_once(&self, request: &SummarizeRequest) -> Result<Completion, Attempt> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: request.max_tokens,
            messages: [Message { role: "user", content: &request.prompt }],
        };
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                let retry = err.is_timeout() || err.is_connect() || err.is_request();
                Attempt { error: SummarizerError::Transport(err.to_string()), retry }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Attempt { error: SummarizerError::RateLimited, retry: false });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt {
                error: SummarizerError::Http { status: status.as_u16(), body },
                retry: status.is_server_error(),
            });
        }

        let parsed = response.json::<MessagesResponse>().await.map_err(|err| Attempt {
            error: SummarizerError::Transport(format!("invalid summarizer response: {err}")),
            retry: false,
        })?;
        let text = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(Attempt { error: SummarizerError::EmptyResponse, retry: false });
        }

        Ok(Completion {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }
}

struct Attempt {
    error: SummarizerError,
    retry: bool,
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    /// Retries transport faults and 5xx responses; 429 and other 4xx fail at once.
    async fn complete(&self, request: SummarizeRequest) -> Result<Completion, SummarizerError> {
        let mut attempt = 0;
        loop {
            match self.send_once(&request).await {
                Ok(completion) => return Ok(completion),
                Err(failure) if failure.retry && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        operation = %request.operation,
                        attempt,
                        error = %failure.error,
                        "retrying summarizer call"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_delay_ms * u64::from(attempt),
                    ))
                    .await;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use briefing_kernel_core::is_rate_limit_message;

    use super::*;

    // Test IDs: TSUM-001
    #[test]
    fn rate_limited_errors_carry_the_rate_limit_marker() {
        assert!(is_rate_limit_message(&SummarizerError::RateLimited.to_string()));
        let http = SummarizerError::Http { status: 500, body: "overloaded".to_string() };
        assert!(!is_rate_limit_message(&http.to_string()));
    }

    // Test IDs: TSUM-002
    #[test]
    fn response_body_text_blocks_are_decoded() -> anyhow::Result<()> {
        let parsed: MessagesResponse = serde_json::from_str(
            r#"{"model":"m","content":[{"type":"text","text":"{\"a\":1}"}],"usage":{"input_tokens":12,"output_tokens":3}}"#,
        )?;
        assert_eq!(parsed.content.len(), 1);
        assert_eq!(parsed.usage.input_tokens, 12);
        Ok(())
    }

    // Test IDs: TSUM-003
    #[tokio::test]
    async fn disabled_summarizer_always_fails() {
        let result = DisabledSummarizer
            .complete(SummarizeRequest {
                operation: "generate_context".to_string(),
                prompt: "p".to_string(),
                max_tokens: 10,
            })
            .await;
        assert!(matches!(result, Err(SummarizerError::NotConfigured)));
    }
}
