//! Provider trait definition
//!
//! This module defines the core trait that all execution backends implement.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One prompt execution request
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Fully expanded prompt text
    pub prompt: String,
    /// Optional system prompt (persona)
    pub system_prompt: Option<String>,
    /// Model to use (empty string selects the provider default)
    pub model: String,
    /// Hard deadline for the call
    pub timeout: Duration,
    /// Session id for providers with native session support
    pub session_id: Option<String>,
    /// Working directory for subprocess providers
    pub workdir: Option<PathBuf>,
}

impl ProviderRequest {
    /// Create a request with the given prompt and a 5 minute timeout
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: String::new(),
            timeout: Duration::from_secs(300),
            session_id: None,
            workdir: None,
        }
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }
}

/// The outcome of one provider execution
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// Generated output text
    pub output: String,
    /// Cost in USD as reported or computed from pricing
    pub cost_usd: f64,
    /// Input tokens consumed
    pub tokens_in: u64,
    /// Output tokens produced
    pub tokens_out: u64,
    /// Model that actually served the call
    pub model: String,
    /// Exit code for subprocess providers (0 for HTTP)
    pub exit_code: i32,
}

/// Trait for execution backends
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Get the default model
    fn default_model(&self) -> &str;

    /// Whether the backend threads conversation state itself.
    ///
    /// When false the caller injects prior context into the prompt text.
    fn has_native_session(&self) -> bool {
        false
    }

    /// Execute one prompt
    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse>;
}

/// A scriptable in-memory provider. Useful for testing.
pub struct MockProvider {
    name: String,
    model: String,
    /// Calls that fail before responses start succeeding
    fail_first: usize,
    /// Fixed per-call cost
    cost_usd: f64,
    /// Optional canned output; echoes the prompt when absent
    response: Option<String>,
    /// Simulated execution time
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    /// Create a mock that echoes every prompt
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "mock-model".to_string(),
            fail_first: 0,
            cost_usd: 0.0,
            response: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Return a canned response instead of echoing
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Fail the first `n` calls with an API error
    #[must_use]
    pub fn with_fail_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Report a fixed cost per successful call
    #[must_use]
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    /// Set the reported model name
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sleep this long inside every call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of execute calls observed
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in call order
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.prompt.clone());

        if call < self.fail_first {
            return Err(Error::Api(format!("scripted failure {}", call + 1)));
        }

        let output = self
            .response
            .clone()
            .unwrap_or_else(|| request.prompt.clone());
        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model
        };

        Ok(ProviderResponse {
            output,
            cost_usd: self.cost_usd,
            tokens_in: 0,
            tokens_out: 0,
            model,
            exit_code: 0,
        })
    }
}
