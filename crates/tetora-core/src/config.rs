//! Configuration model
//!
//! Typed TOML configuration for the whole process. Any string field whose
//! value starts with `$` resolves from the process environment at load time;
//! an unset variable logs a warning and yields the empty string.

use crate::cron::CronJobSpec;
use crate::error::{Error, Result};
use crate::workflow::WorkflowDef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetoraConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Task defaults applied before dispatch
    pub defaults: TaskDefaults,
    /// Database and output-file locations
    pub storage: StorageConfig,
    /// Directory exposed to prompts as `{{knowledge_dir}}`
    pub knowledge_dir: Option<PathBuf>,
    /// Named agent personas
    pub agents: HashMap<String, AgentConfig>,
    /// Execution backends
    pub providers: Vec<tetora_llm::registry::ProviderSpec>,
    /// Global provider fallback chain, tried after agent-level providers
    pub fallback_providers: Vec<String>,
    /// Admission limits
    pub concurrency: ConcurrencyConfig,
    /// Per-provider circuit breaker thresholds
    pub circuit: crate::circuit::CircuitConfig,
    /// Spend caps and auto-downgrade
    pub budgets: BudgetsConfig,
    /// Conversation session behavior
    pub sessions: SessionConfig,
    /// Cron scheduling
    pub cron: CronConfig,
    /// Declared workflow DAGs
    pub workflows: Vec<WorkflowDef>,
    /// SLA targets and check cadence
    pub sla: SlaConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Bearer token required on mutating endpoints (unset disables auth)
    pub api_token: Option<String>,
    /// Ingress rate limiting
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7700,
            api_token: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Sliding-window ingress rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether the limiter is active
    pub enabled: bool,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window_secs: 60,
        }
    }
}

/// Defaults filled into tasks that omit them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    /// Task timeout in seconds
    pub timeout_secs: u64,
    /// Model when neither task nor agent names one
    pub model: Option<String>,
    /// Permission mode when neither task nor agent names one
    pub permission_mode: PermissionMode,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            model: None,
            permission_mode: PermissionMode::Ask,
        }
    }
}

/// How much autonomy an execution gets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Prompt for every side effect
    #[default]
    Ask,
    /// Auto-accept file edits, prompt for the rest
    AcceptEdits,
    /// No prompting
    Full,
}

/// Database and output-file locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path (default `~/.tetora/tetora.db`)
    pub db_path: Option<PathBuf>,
    /// Directory for full task outputs referenced from history
    pub output_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the database path, falling back to the default location
    #[must_use]
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tetora")
                .join("tetora.db")
        })
    }
}

/// A named AI persona
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// System prompt defining the persona
    pub system_prompt: String,
    /// Model override
    pub model: Option<String>,
    /// Primary provider
    pub provider: Option<String>,
    /// Agent-level fallback providers, tried before the global chain
    pub fallback_providers: Vec<String>,
    /// Permission mode override
    pub permission_mode: Option<PermissionMode>,
    /// Working directories the agent may touch
    pub allowed_dirs: Vec<PathBuf>,
    /// Per-task budget cap in USD
    pub budget_usd: Option<f64>,
}

/// Admission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Concurrent top-level tasks
    pub max_concurrent: usize,
    /// Child pool capacity = max_concurrent × this multiplier
    pub child_pool_multiplier: usize,
    /// Concurrent children per parent task
    pub max_children_per_task: usize,
    /// Maximum nesting depth
    pub max_depth: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            child_pool_multiplier: 2,
            max_children_per_task: 5,
            max_depth: 3,
        }
    }
}

/// Spend caps over one scope
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodCaps {
    /// Daily cap in USD
    pub daily: Option<f64>,
    /// Weekly cap in USD
    pub weekly: Option<f64>,
    /// Monthly cap in USD
    pub monthly: Option<f64>,
}

impl PeriodCaps {
    /// Whether any period has a cap
    #[must_use]
    pub fn any(&self) -> bool {
        self.daily.is_some() || self.weekly.is_some() || self.monthly.is_some()
    }
}

/// One auto-downgrade threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DowngradeThreshold {
    /// Utilization at which the downgrade applies (0.0–1.0)
    pub at: f64,
    /// Model to downgrade to
    pub model: String,
}

/// Auto-downgrade settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DowngradeConfig {
    /// Whether downgrade suggestions are applied
    pub enabled: bool,
    /// Thresholds, matched by highest `at` ≤ current utilization
    pub thresholds: Vec<DowngradeThreshold>,
}

/// Spend caps and the kill switch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetsConfig {
    /// Global kill switch: reject all dispatches while set
    pub paused: bool,
    /// Global caps
    pub global: PeriodCaps,
    /// Per-agent caps
    pub agents: HashMap<String, PeriodCaps>,
    /// Cap on one workflow run's accumulated cost
    pub per_workflow_run: Option<f64>,
    /// Model auto-downgrade at utilization thresholds
    pub auto_downgrade: DowngradeConfig,
}

/// Conversation session behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Compact once the message count exceeds this
    pub compact_after: u32,
    /// Messages kept verbatim after compaction
    pub compact_keep: u32,
    /// Messages rendered into prompt context
    pub context_max_messages: u32,
    /// Cheap model used for compaction summaries
    pub compact_model: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            compact_after: 30,
            compact_keep: 10,
            context_max_messages: 20,
            compact_model: None,
        }
    }
}

/// Cron scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Fixed-offset timezone for expression matching, e.g. `+09:00`
    pub timezone: String,
    /// Jobs seeded at startup
    pub jobs: Vec<CronJobSpec>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            timezone: "+00:00".to_string(),
            jobs: Vec::new(),
        }
    }
}

/// Success-rate / latency target for one agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlaTarget {
    /// Minimum success rate (0.0–1.0)
    pub min_success_rate: f64,
    /// Maximum p95 latency in milliseconds
    pub max_p95_ms: f64,
}

/// SLA check cadence and per-agent targets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    /// Seconds between checks
    pub check_interval_secs: u64,
    /// Aggregation window in hours
    pub window_hours: i64,
    /// Per-agent targets
    pub targets: HashMap<String, SlaTarget>,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 900,
            window_hours: 24,
            targets: HashMap::new(),
        }
    }
}

/// Resolve a `$VAR` environment reference; plain values pass through.
#[must_use]
pub fn resolve_env_ref(value: &str) -> String {
    let Some(name) = value.strip_prefix('$') else {
        return value.to_string();
    };
    match std::env::var(name) {
        Ok(resolved) => resolved,
        Err(_) => {
            warn!(var = %name, "environment variable not set, using empty string");
            String::new()
        }
    }
}

impl TetoraConfig {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    /// Returns `Error::Config` on read, parse, or validation failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string
    ///
    /// # Errors
    /// Returns `Error::Config` on parse or validation failure.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("parse error: {e}")))?;
        config.resolve_env();
        config.validate()?;
        Ok(config)
    }

    /// Resolve `$VAR` references in secret-bearing fields
    fn resolve_env(&mut self) {
        if let Some(token) = &self.server.api_token {
            self.server.api_token = Some(resolve_env_ref(token));
        }
        for spec in &mut self.providers {
            match spec {
                tetora_llm::registry::ProviderSpec::Http(http) => {
                    http.api_key = resolve_env_ref(&http.api_key);
                }
                tetora_llm::registry::ProviderSpec::Cli(cli) => {
                    for value in cli.env.values_mut() {
                        *value = resolve_env_ref(value);
                    }
                }
            }
        }
    }

    /// Cross-field validation
    fn validate(&self) -> Result<()> {
        let provider_names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();

        let check_provider = |name: &str, context: &str| -> Result<()> {
            if provider_names.contains(&name) {
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "{context} references unknown provider '{name}'"
                )))
            }
        };

        for (agent_name, agent) in &self.agents {
            if let Some(provider) = &agent.provider {
                check_provider(provider, &format!("agent '{agent_name}'"))?;
            }
            for fallback in &agent.fallback_providers {
                check_provider(fallback, &format!("agent '{agent_name}' fallback"))?;
            }
        }
        for fallback in &self.fallback_providers {
            check_provider(fallback, "global fallback")?;
        }

        for job in &self.cron.jobs {
            crate::cron::CronExpr::parse(&job.schedule)
                .map_err(|e| Error::Config(format!("cron job '{}': {e}", job.id)))?;
        }

        for workflow in &self.workflows {
            workflow
                .execution_order()
                .map_err(|e| Error::Config(format!("workflow '{}': {e}", workflow.id)))?;
        }

        crate::cron::parse_timezone(&self.cron.timezone)
            .map_err(|e| Error::Config(format!("cron timezone: {e}")))?;

        if self.concurrency.max_concurrent == 0 {
            return Err(Error::Config(
                "concurrency.max_concurrent must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Agent lookup
    ///
    /// # Errors
    /// Returns `NotFound` when the agent is not configured.
    pub fn agent(&self, name: &str) -> Result<&AgentConfig> {
        self.agents
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("agent '{name}'")))
    }

    /// Resolve the ordered, de-duplicated provider chain for an agent
    #[must_use]
    pub fn provider_chain(&self, agent: &AgentConfig) -> Vec<String> {
        let mut chain = Vec::new();
        let mut push = |name: &str| {
            if !name.is_empty() && !chain.iter().any(|existing: &String| existing == name) {
                chain.push(name.to_string());
            }
        };

        if let Some(provider) = &agent.provider {
            push(provider);
        }
        for fallback in &agent.fallback_providers {
            push(fallback);
        }
        for fallback in &self.fallback_providers {
            push(fallback);
        }
        chain
    }
}
