// =============================================================================
// LLM transport — OpenAI-compatible chat completions
// =============================================================================
//
// The gateway owns prompting and parsing; this client owns nothing but the
// wire call: one prompt in, one reply string out, within a deadline. Model
// identity comes from configuration and is not part of the contract.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use crate::config::AdvisorConfig;
use crate::error::{BotError, BotResult};

/// The single call the advisor gateway makes to the outside world.
#[async_trait]
pub trait AdvisorTransport: Send + Sync {
    /// Complete `prompt` into a reply string within `deadline`.
    async fn complete(&self, prompt: &str, deadline: Duration) -> BotResult<String>;
}

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct LlmClient {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &AdvisorConfig, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        }
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl AdvisorTransport for LlmClient {
    /// POST /chat/completions. Timeouts, throttling and 5xx map to
    /// `TransientAdvisor` (the gateway retries once); other failures are
    /// terminal for this trigger.
    #[instrument(skip(self, prompt), name = "llm::complete")]
    async fn complete(&self, prompt: &str, deadline: Duration) -> BotResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt));

        let resp = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| {
                BotError::TransientAdvisor(format!("advisor call exceeded {deadline:?}"))
            })?
            .map_err(|e| BotError::TransientAdvisor(format!("advisor request failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Err(BotError::TransientAdvisor(format!(
                "advisor returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(BotError::AdvisorRejected(format!(
                "advisor transport returned {status}"
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BotError::TransientAdvisor(format!("advisor reply unreadable: {e}")))?;

        let content = body["choices"]
            .as_array()
            .and_then(|c| c.first())
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| {
                BotError::AdvisorRejected("advisor reply missing message content".into())
            })?;

        debug!(chars = content.len(), "advisor reply received");
        Ok(content.to_string())
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> LlmClient {
        LlmClient::new(&AdvisorConfig::default(), "sk-test")
    }

    #[test]
    fn request_body_shape() {
        let body = client().request_body("hello");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert!(body["temperature"].as_f64().unwrap() <= 1.0);
        assert!(body["max_tokens"].as_u64().unwrap() > 0);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let cfg = AdvisorConfig {
            base_url: "https://example.test/v1/".into(),
            ..AdvisorConfig::default()
        };
        let c = LlmClient::new(&cfg, "k");
        assert_eq!(c.base_url, "https://example.test/v1");
    }

    #[test]
    fn debug_redacts_api_key() {
        let dbg = format!("{:?}", client());
        assert!(!dbg.contains("sk-test"));
    }
}
