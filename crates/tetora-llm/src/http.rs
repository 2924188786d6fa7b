//! HTTP chat provider
//!
//! Executes prompts against an OpenAI-compatible chat completion endpoint.

use crate::error::{Error, Result};
use crate::provider::{Provider, ProviderRequest, ProviderResponse};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Mask an API key for logging, keeping only a short prefix
#[must_use]
pub(crate) fn mask_api_key(key: &str) -> String {
    if key.len() <= 8 {
        "***".to_string()
    } else {
        format!("{}***", &key[..6])
    }
}

/// Sanitize API error messages before they reach users or logs
fn sanitize_api_error(error: &str) -> String {
    let lower = error.to_lowercase();

    if lower.contains("api key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return "API authentication error. Please check the provider API key.".to_string();
    }

    if lower.contains("rate limit") || lower.contains("quota") {
        return "API rate limit exceeded. Please try again later.".to_string();
    }

    if error.len() > 300 {
        let mut truncated = error.to_string();
        truncated.truncate(300);
        format!("{truncated}...(truncated)")
    } else {
        error.to_string()
    }
}

/// Per-model pricing in USD per million tokens
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Input cost per 1M tokens
    pub input_per_mtok: f64,
    /// Output cost per 1M tokens
    pub output_per_mtok: f64,
}

impl ModelPricing {
    /// Compute the USD cost of a call
    #[must_use]
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.input_per_mtok + tokens_out as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// HTTP provider configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    /// Provider name
    pub name: String,
    /// API base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    /// Bearer API key
    #[serde(default)]
    pub api_key: String,
    /// Default model
    pub default_model: String,
    /// Per-model pricing for cost computation
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl fmt::Debug for HttpProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_api_key(&self.api_key))
            .field("default_model", &self.default_model)
            .finish()
    }
}

// OpenAI-compatible wire types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// OpenAI-compatible chat completion provider
pub struct HttpProvider {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpProvider {
    /// Create a new HTTP provider
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| Error::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn cost_for(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.config
            .pricing
            .get(model)
            .map(|p| p.cost(tokens_in, tokens_out))
            .unwrap_or(0.0)
    }
}

#[async_trait::async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse> {
        let model = if request.model.is_empty() {
            self.config.default_model.clone()
        } else {
            request.model.clone()
        };

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.prompt.clone(),
        });

        let chat_request = ChatRequest {
            model: model.clone(),
            messages,
        };

        debug!(provider = %self.config.name, model = %model, "sending chat completion request");

        let timeout_ms = request.timeout.as_millis() as u64;
        let send = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&chat_request)
            .send();

        let response = tokio::select! {
            res = tokio::time::timeout(request.timeout, send) => match res {
                Err(_) => return Err(Error::Timeout(timeout_ms)),
                Ok(Err(e)) => return Err(Error::Network(sanitize_api_error(&e.to_string()))),
                Ok(Ok(response)) => response,
            },
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimit);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!(
                "{status}: {}",
                sanitize_api_error(&body)
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let content = chat
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| Error::InvalidResponse("no choices in response".to_string()))?;

        let (tokens_in, tokens_out) = chat
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(ProviderResponse {
            output: content,
            cost_usd: self.cost_for(&chat.model, tokens_in, tokens_out),
            tokens_in,
            tokens_out,
            model: chat.model,
            exit_code: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key("short"), "***");
        assert_eq!(mask_api_key("sk-abcdef123456"), "sk-abc***");
    }

    #[test]
    fn test_sanitize_auth_error() {
        let sanitized = sanitize_api_error("Incorrect API key provided: sk-secret");
        assert!(!sanitized.contains("sk-secret"));
        assert!(sanitized.contains("authentication"));
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = ModelPricing {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        let cost = pricing.cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_chat_response() {
        let body = r#"{
            "choices": [{"message": {"content": "hi there"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4},
            "model": "gpt-4o-mini"
        }"#;
        let chat: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(chat.choices[0].message.content.as_deref(), Some("hi there"));
        assert_eq!(chat.usage.as_ref().unwrap().prompt_tokens, 12);
        assert_eq!(chat.model, "gpt-4o-mini");
    }
}
