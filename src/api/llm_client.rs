//! HTTP client for an OpenAI-compatible chat completion endpoint.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{ChatMessage, ChatRequest, ChatResponse};

const DEFAULT_API_BASE: &str = "https://api.deepseek.com/v1";
const DEFAULT_MODEL: &str = "deepseek-chat";

/// Endpoint settings for the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL, without the trailing `/chat/completions`
    pub api_base: String,

    /// Bearer token; requests are sent unauthenticated when `None`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub model: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Total time spent retrying transient failures, in seconds
    pub max_retry_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: 30,
            max_retry_secs: 20,
        }
    }
}

/// Chat completion client with retry on transient failures.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send a conversation and return the first choice's content.
    ///
    /// Network errors, 429 and 5xx are retried with exponential backoff;
    /// any other status fails immediately.
    pub async fn chat(&self, messages: &[ChatMessage], temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.api_base);
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(self.config.max_retry_secs)),
            ..ExponentialBackoff::default()
        };

        let body = backoff::future::retry(policy, || async {
            self.send_once(&url, messages, temperature).await
        })
        .await?;

        let response: ChatResponse =
            serde_json::from_str(&body).context("Failed to parse chat completion response")?;

        if let Some(usage) = &response.usage {
            debug!(
                model = %self.config.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Chat completion usage"
            );
        }

        response
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Chat completion returned no choices"))
    }

    async fn send_once(
        &self,
        url: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> std::result::Result<String, backoff::Error<anyhow::Error>> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature,
            max_tokens: None,
        };

        let mut builder = self.client.post(url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "Chat completion request failed, retrying");
            backoff::Error::transient(anyhow!(e).context("Failed to send chat completion request"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow!("Chat completion failed: {} - {}", status, body);
            return Err(if is_retryable(status) {
                warn!(status = %status, "Chat completion rejected, retrying");
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            });
        }

        response
            .text()
            .await
            .map_err(|e| backoff::Error::transient(anyhow!(e).context("Failed to read chat completion body")))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let config = LlmConfig {
            api_key: Some("sk-secret".to_string()),
            ..LlmConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
