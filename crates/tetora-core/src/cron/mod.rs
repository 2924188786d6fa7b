//! Cron scheduling
//!
//! 5-field expressions fired through the dispatcher on a one-minute tick,
//! with per-job concurrency caps and an approval gate for jobs created over
//! the management API.

mod engine;
mod expr;

pub use engine::{CronEngine, CronJobView};
pub use expr::{parse_timezone, CronExpr};

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_max_runs() -> u32 {
    1
}

/// Whether a job is cleared to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// Awaiting operator approval (jobs created over the API)
    Pending,
    /// Cleared to fire
    Approved,
    /// Denied; kept for the record
    Rejected,
}

impl Default for ApprovalState {
    // config-seeded jobs were written by the operator
    fn default() -> Self {
        Self::Approved
    }
}

/// One scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobSpec {
    /// Stable job id (recorded as the JobRun `job_id`)
    pub id: String,
    /// Display name
    pub name: String,
    /// 5-field cron expression
    pub schedule: String,
    /// Agent persona the job dispatches as
    pub agent: String,
    /// Prompt (template variables are expanded at dispatch time)
    pub prompt: String,
    /// Whether the job fires at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Approval gate
    #[serde(default)]
    pub approval: ApprovalState,
    /// Concurrent runs allowed; at the cap a tick is skipped, not queued
    #[serde(default = "default_max_runs")]
    pub max_concurrent_runs: u32,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
    /// Timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CronJobSpec {
    /// Whether the job may fire on a matching tick
    #[must_use]
    pub fn fireable(&self) -> bool {
        self.enabled && self.approval == ApprovalState::Approved
    }
}
