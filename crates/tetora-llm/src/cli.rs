//! CLI subprocess provider
//!
//! Executes prompts by spawning an agent CLI binary (Claude CLI or a
//! compatible tool). The prompt is passed as the final argument, the system
//! prompt via a flag or stdin, and usage is extracted from a structured JSON
//! line the binary emits on stdout.

use crate::error::{Error, Result};
use crate::provider::{Provider, ProviderRequest, ProviderResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default subprocess timeout in seconds
fn default_timeout() -> u64 {
    300
}

/// CLI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliProviderConfig {
    /// Provider name
    pub name: String,
    /// Binary to execute
    pub command: String,
    /// Default arguments prepended to every invocation
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag carrying the system prompt (system prompt goes to stdin when unset)
    #[serde(default)]
    pub system_prompt_flag: Option<String>,
    /// Flag carrying the model name
    #[serde(default)]
    pub model_flag: Option<String>,
    /// Flag carrying the session id for binaries that resume sessions natively
    #[serde(default)]
    pub session_flag: Option<String>,
    /// Whether the binary threads conversation state itself
    #[serde(default)]
    pub native_session: bool,
    /// Default model
    #[serde(default)]
    pub default_model: String,
    /// Environment variables for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Default timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl CliProviderConfig {
    /// Create a new CLI provider config
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            system_prompt_flag: None,
            model_flag: None,
            session_flag: None,
            native_session: false,
            default_model: String::new(),
            env: HashMap::new(),
            timeout_seconds: default_timeout(),
        }
    }

    /// Claude CLI defaults
    pub fn claude() -> Self {
        Self {
            name: "claude".to_string(),
            command: "claude".to_string(),
            args: vec!["--print".to_string(), "--output-format".to_string(), "json".to_string()],
            system_prompt_flag: Some("--append-system-prompt".to_string()),
            model_flag: Some("--model".to_string()),
            session_flag: Some("--resume".to_string()),
            native_session: true,
            default_model: "claude-sonnet-4-5".to_string(),
            env: HashMap::new(),
            timeout_seconds: default_timeout(),
        }
    }
}

/// Structured usage line emitted by the binary
#[derive(Debug, Deserialize)]
struct UsageLine {
    #[serde(default)]
    result: Option<String>,
    #[serde(default, alias = "total_cost_usd")]
    cost_usd: f64,
    #[serde(default, alias = "input_tokens")]
    tokens_in: u64,
    #[serde(default, alias = "output_tokens")]
    tokens_out: u64,
    #[serde(default)]
    model: Option<String>,
}

/// Subprocess execution provider
pub struct CliProvider {
    config: CliProviderConfig,
}

impl CliProvider {
    /// Create a new CLI provider
    #[must_use]
    pub fn new(config: CliProviderConfig) -> Self {
        Self { config }
    }

    /// Whether the binary is present on PATH
    pub async fn is_available(&self) -> bool {
        Command::new("which")
            .arg(&self.config.command)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Find the trailing JSON usage line on stdout, if any.
    ///
    /// Scans from the last line backwards; the first object carrying a
    /// cost or token field wins.
    fn parse_usage(stdout: &str) -> (Option<UsageLine>, String) {
        for line in stdout.lines().rev() {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                continue;
            };
            let has_usage = value.get("cost_usd").is_some()
                || value.get("total_cost_usd").is_some()
                || value.get("result").is_some();
            if !has_usage {
                continue;
            }
            if let Ok(usage) = serde_json::from_value::<UsageLine>(value) {
                let remainder: String = stdout
                    .lines()
                    .filter(|l| l.trim() != trimmed)
                    .collect::<Vec<_>>()
                    .join("\n");
                return (Some(usage), remainder);
            }
        }
        (None, stdout.to_string())
    }

    fn build_command(&self, request: &ProviderRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        let model = if request.model.is_empty() {
            &self.config.default_model
        } else {
            &request.model
        };
        if let (Some(flag), false) = (&self.config.model_flag, model.is_empty()) {
            cmd.arg(flag).arg(model);
        }

        if let (Some(flag), Some(system)) =
            (&self.config.system_prompt_flag, &request.system_prompt)
        {
            cmd.arg(flag).arg(system);
        }

        if let (Some(flag), Some(session)) = (&self.config.session_flag, &request.session_id) {
            if self.config.native_session {
                cmd.arg(flag).arg(session);
            }
        }

        cmd.arg(&request.prompt);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(workdir) = &request.workdir {
            cmd.current_dir(workdir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    fn has_native_session(&self) -> bool {
        self.config.native_session
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse> {
        let mut cmd = self.build_command(&request);

        debug!(provider = %self.config.name, command = %self.config.command, "spawning CLI provider");

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.config.command)))?;

        // System prompt goes to stdin when no flag is configured.
        if let Some(mut stdin) = child.stdin.take() {
            if self.config.system_prompt_flag.is_none() {
                if let Some(system) = &request.system_prompt {
                    if let Err(e) = stdin.write_all(system.as_bytes()).await {
                        warn!(provider = %self.config.name, error = %e, "failed to write system prompt to stdin");
                    }
                }
            }
            drop(stdin);
        }

        let timeout_ms = request.timeout.as_millis() as u64;
        let wait = child.wait_with_output();

        let output = tokio::select! {
            res = tokio::time::timeout(request.timeout, wait) => match res {
                Err(_) => return Err(Error::Timeout(timeout_ms)),
                Ok(Err(e)) => return Err(Error::Spawn(e.to_string())),
                Ok(Ok(output)) => output,
            },
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut stderr = stderr.trim().to_string();
            stderr.truncate(500);
            return Err(Error::Exit {
                code: exit_code,
                stderr,
            });
        }

        let (usage, remainder) = Self::parse_usage(&stdout);
        let response = match usage {
            Some(usage) => ProviderResponse {
                output: usage.result.unwrap_or(remainder).trim().to_string(),
                cost_usd: usage.cost_usd,
                tokens_in: usage.tokens_in,
                tokens_out: usage.tokens_out,
                model: usage
                    .model
                    .unwrap_or_else(|| self.config.default_model.clone()),
                exit_code,
            },
            None => ProviderResponse {
                output: stdout.trim().to_string(),
                cost_usd: 0.0,
                tokens_in: 0,
                tokens_out: 0,
                model: self.config.default_model.clone(),
                exit_code,
            },
        };

        Ok(response)
    }
}
