//! Task and result types

use crate::config::PermissionMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// One unit of work.
///
/// Built by an ingress (channel bot, HTTP, cron, workflow step) and handed
/// to the dispatcher; immutable once dispatch begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    /// Task id (generated when empty)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Agent persona to run as
    pub agent: String,
    /// Prompt text (template variables are expanded by the dispatcher)
    pub prompt: String,
    /// System prompt override
    pub system_prompt: Option<String>,
    /// Model override (resolved from agent config when absent)
    pub model: Option<String>,
    /// Provider override (resolved from agent config when absent)
    pub provider: Option<String>,
    /// Permission mode override
    pub permission_mode: Option<PermissionMode>,
    /// Working directories the execution may touch
    pub allowed_dirs: Vec<PathBuf>,
    /// Timeout override in seconds
    pub timeout_secs: Option<u64>,
    /// Per-task budget cap in USD
    pub budget_usd: Option<f64>,
    /// Ingress tag (telegram, http, cron, workflow, cli)
    pub source: String,
    /// External job identity recorded on the job run (cron id, step id)
    pub job_id: Option<String>,
    /// Conversation session to thread through
    pub session_id: Option<String>,
    /// Parent task id for sub-agent spawns
    pub parent_id: Option<String>,
    /// Nesting depth (0 for top-level tasks)
    pub depth: u32,
    /// Whether the outcome is recorded to history (false in shadow mode)
    pub record: bool,
    /// Accumulated cost of the owning workflow run, for budget checks
    #[serde(skip)]
    pub workflow_run_cost: Option<f64>,
    /// Forward-compatible ingress fields
    #[serde(flatten)]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            agent: String::new(),
            prompt: String::new(),
            system_prompt: None,
            model: None,
            provider: None,
            permission_mode: None,
            allowed_dirs: Vec::new(),
            timeout_secs: None,
            budget_usd: None,
            source: String::new(),
            job_id: None,
            session_id: None,
            parent_id: None,
            depth: 0,
            record: true,
            workflow_run_cost: None,
            extensions: HashMap::new(),
        }
    }
}

impl Task {
    /// Create a task for an agent and prompt
    #[must_use]
    pub fn new(agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent: agent.into(),
            prompt: prompt.into(),
            source: "cli".to_string(),
            ..Default::default()
        }
    }

    /// Set the ingress tag
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the session id
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the external job identity
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Ensure the task has an id, generating one if absent
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }
}

/// Terminal status of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Provider produced an output
    Success,
    /// Terminal error (admission, provider chain exhausted)
    Error,
    /// Provider call hit the task timeout
    Timeout,
    /// Caller cancelled the dispatch
    Cancelled,
    /// Budget governor rejected the task before any provider call
    Skipped,
}

impl TaskStatus {
    /// The string persisted to history and exposed on metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

/// The outcome of one dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Terminal status
    pub status: TaskStatus,
    /// Output text (empty unless success)
    pub output: String,
    /// Error text (empty on success)
    pub error: String,
    /// Process exit code (0 for HTTP providers and non-provider failures)
    pub exit_code: i32,
    /// Cost in USD
    pub cost_usd: f64,
    /// Input tokens
    pub tokens_in: u64,
    /// Output tokens
    pub tokens_out: u64,
    /// Model that actually served the call
    pub model: String,
    /// Session id propagated back to the ingress
    pub session_id: Option<String>,
    /// Path of the full output file, when persisted
    pub output_file: Option<PathBuf>,
}

impl TaskResult {
    /// An error result
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            output: String::new(),
            error: message.into(),
            exit_code: 0,
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            model: String::new(),
            session_id: None,
            output_file: None,
        }
    }

    /// A budget-rejection result
    #[must_use]
    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Skipped,
            error: message.into(),
            ..Self::error("")
        }
    }

    /// A cancellation result
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            error: "cancelled".to_string(),
            ..Self::error("")
        }
    }

    /// Whether the dispatch succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_defaults_from_json() {
        let task: Task = serde_json::from_str(
            r#"{"agent": "helper", "prompt": "hi", "unknown_future_field": 7}"#,
        )
        .unwrap();
        assert_eq!(task.agent, "helper");
        assert_eq!(task.depth, 0);
        assert!(task.record);
        assert_eq!(
            task.extensions.get("unknown_future_field"),
            Some(&serde_json::json!(7))
        );
    }

    #[test]
    fn test_ensure_id() {
        let mut task = Task {
            agent: "helper".to_string(),
            ..Default::default()
        };
        assert!(task.id.is_empty());
        task.ensure_id();
        assert!(!task.id.is_empty());

        let id = task.id.clone();
        task.ensure_id();
        assert_eq!(task.id, id);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TaskStatus::Success.as_str(), "success");
        assert_eq!(TaskStatus::Skipped.as_str(), "skipped");
    }
}
