//! Budget governor
//!
//! Pre-execution admission against daily/weekly/monthly spend caps, a
//! global kill switch, per-workflow-run caps, and model auto-downgrade at
//! utilization thresholds. Spend is sourced from job run history.

use crate::config::{BudgetsConfig, PeriodCaps};
use crate::error::Result;
use crate::store::{SpendSnapshot, Store};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Alert severity derived from utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Below the warning threshold
    Ok,
    /// Utilization ≥ 0.7
    Warning,
    /// Utilization ≥ 0.9
    Critical,
}

impl AlertLevel {
    fn from_utilization(utilization: f64) -> Self {
        if utilization >= 0.9 {
            Self::Critical
        } else if utilization >= 0.7 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Label for alert dedup keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// The governor's verdict for one task
#[derive(Debug, Clone, Serialize)]
pub struct BudgetDecision {
    /// Whether the dispatch may proceed
    pub allowed: bool,
    /// A cap was breached
    pub exceeded: bool,
    /// The kill switch is set
    pub paused: bool,
    /// Highest utilization across all scopes (0.0 when uncapped)
    pub utilization: f64,
    /// Model override suggested by auto-downgrade
    pub downgrade_model: Option<String>,
    /// Alert severity at the observed utilization
    pub alert: AlertLevel,
    /// User-visible explanation (empty when allowed without remark)
    pub message: String,
}

impl BudgetDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            exceeded: false,
            paused: false,
            utilization: 0.0,
            downgrade_model: None,
            alert: AlertLevel::Ok,
            message: String::new(),
        }
    }
}

/// Pre-execution spend admission
pub struct BudgetGovernor {
    store: Store,
    config: BudgetsConfig,
}

impl BudgetGovernor {
    /// Create a governor over the given history store
    #[must_use]
    pub fn new(store: Store, config: BudgetsConfig) -> Self {
        Self { store, config }
    }

    /// Decide whether a task for `agent` may run.
    ///
    /// `workflow_run_cost` carries the accumulated cost of the current
    /// workflow run when the task belongs to one.
    ///
    /// # Errors
    /// Returns an error when history cannot be queried.
    pub async fn check(
        &self,
        agent: &str,
        workflow_run_cost: Option<f64>,
    ) -> Result<BudgetDecision> {
        if self.config.paused {
            return Ok(BudgetDecision {
                allowed: false,
                paused: true,
                message: "budgets paused: all dispatches are rejected".to_string(),
                ..BudgetDecision::allowed()
            });
        }

        let mut decision = BudgetDecision::allowed();

        if self.config.global.any() {
            let spend = self.store.spend(None).await?;
            if let Some(message) =
                check_scope("global", &self.config.global, spend, &mut decision.utilization)
            {
                return Ok(exceeded(decision, message));
            }
        }

        if let Some(caps) = self.config.agents.get(agent) {
            if caps.any() {
                let spend = self.store.spend(Some(agent)).await?;
                let scope = format!("agent '{agent}'");
                if let Some(message) =
                    check_scope(&scope, caps, spend, &mut decision.utilization)
                {
                    return Ok(exceeded(decision, message));
                }
            }
        }

        if let (Some(run_cost), Some(cap)) = (workflow_run_cost, self.config.per_workflow_run) {
            if cap > 0.0 {
                let utilization = run_cost / cap;
                decision.utilization = decision.utilization.max(utilization);
                if utilization >= 1.0 {
                    let message = format!(
                        "workflow run budget exceeded: ${run_cost:.2} of ${cap:.2}"
                    );
                    return Ok(exceeded(decision, message));
                }
            }
        }

        decision.alert = AlertLevel::from_utilization(decision.utilization);

        if self.config.auto_downgrade.enabled {
            decision.downgrade_model = self
                .config
                .auto_downgrade
                .thresholds
                .iter()
                .filter(|threshold| threshold.at <= decision.utilization)
                .max_by(|a, b| a.at.partial_cmp(&b.at).unwrap_or(std::cmp::Ordering::Equal))
                .map(|threshold| threshold.model.clone());
            if let Some(model) = &decision.downgrade_model {
                debug!(
                    utilization = decision.utilization,
                    model = %model,
                    "auto-downgrade applies"
                );
            }
        }

        Ok(decision)
    }
}

fn exceeded(mut decision: BudgetDecision, message: String) -> BudgetDecision {
    warn!(message = %message, "budget rejection");
    decision.allowed = false;
    decision.exceeded = true;
    decision.alert = AlertLevel::Critical;
    decision.message = message;
    decision
}

/// Check one scope's three periods; returns the breach message if any and
/// folds the scope's utilizations into the running maximum.
fn check_scope(
    scope: &str,
    caps: &PeriodCaps,
    spend: SpendSnapshot,
    max_utilization: &mut f64,
) -> Option<String> {
    let periods = [
        ("daily", caps.daily, spend.today),
        ("weekly", caps.weekly, spend.week),
        ("monthly", caps.monthly, spend.month),
    ];

    for (period, cap, spent) in periods {
        let Some(cap) = cap else { continue };
        if cap <= 0.0 {
            continue;
        }
        let utilization = spent / cap;
        *max_utilization = max_utilization.max(utilization);
        if utilization >= 1.0 {
            let prefix = if scope == "global" {
                String::new()
            } else {
                format!("{scope} ")
            };
            return Some(format!(
                "{prefix}{period} budget exceeded: ${spent:.2} of ${cap:.2}"
            ));
        }
    }
    None
}

/// Deduplicates budget alerts per `scope:period:level` within a cooldown
#[derive(Debug)]
pub struct AlertTracker {
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl Default for AlertTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl AlertTracker {
    /// Create a tracker with the given cooldown
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an alert keyed `scope:period:level` should go out now.
    ///
    /// Records the send time when it returns true.
    pub fn should_notify(&self, key: &str) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match last_sent.get(key) {
            Some(sent) if now.duration_since(*sent) < self.cooldown => false,
            _ => {
                last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DowngradeConfig, DowngradeThreshold};
    use crate::store::JobRun;
    use chrono::Utc;

    async fn store_with_spend(agent: &str, cost: f64) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        let run = JobRun {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: String::new(),
            name: "seed".to_string(),
            source: "test".to_string(),
            started_at: now,
            finished_at: now,
            status: "success".to_string(),
            exit_code: 0,
            cost_usd: cost,
            output_summary: String::new(),
            error: String::new(),
            model: String::new(),
            session_id: None,
            output_file: None,
            tokens_in: 0,
            tokens_out: 0,
            agent: agent.to_string(),
        };
        store.record_run(&run).await.unwrap();
        store
    }

    fn daily(cap: f64) -> PeriodCaps {
        PeriodCaps {
            daily: Some(cap),
            weekly: None,
            monthly: None,
        }
    }

    #[tokio::test]
    async fn test_paused_rejects() {
        let store = Store::open_in_memory().await.unwrap();
        let config = BudgetsConfig {
            paused: true,
            ..Default::default()
        };
        let governor = BudgetGovernor::new(store, config);

        let decision = governor.check("helper", None).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.paused);
        assert!(!decision.exceeded);
    }

    #[tokio::test]
    async fn test_daily_cap_exceeded() {
        let store = store_with_spend("helper", 1.01).await;
        let config = BudgetsConfig {
            global: daily(1.00),
            ..Default::default()
        };
        let governor = BudgetGovernor::new(store, config);

        let decision = governor.check("helper", None).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.exceeded);
        assert!(decision.message.contains("daily budget exceeded"));
    }

    #[tokio::test]
    async fn test_agent_scope_named_in_message() {
        let store = store_with_spend("spender", 2.0).await;
        let mut agents = HashMap::new();
        agents.insert("spender".to_string(), daily(1.0));
        let config = BudgetsConfig {
            agents,
            ..Default::default()
        };
        let governor = BudgetGovernor::new(store, config);

        let decision = governor.check("spender", None).await.unwrap();
        assert!(decision.exceeded);
        assert!(decision.message.contains("agent 'spender'"));
        assert!(decision.message.contains("daily budget exceeded"));

        // a different agent is untouched by the per-agent cap
        let other = governor.check("other", None).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn test_workflow_run_cap() {
        let store = Store::open_in_memory().await.unwrap();
        let config = BudgetsConfig {
            per_workflow_run: Some(0.5),
            ..Default::default()
        };
        let governor = BudgetGovernor::new(store, config);

        let under = governor.check("helper", Some(0.3)).await.unwrap();
        assert!(under.allowed);

        let over = governor.check("helper", Some(0.6)).await.unwrap();
        assert!(!over.allowed);
        assert!(over.message.contains("workflow run budget exceeded"));
    }

    #[tokio::test]
    async fn test_alert_levels_and_downgrade() {
        let store = store_with_spend("helper", 0.8).await;
        let config = BudgetsConfig {
            global: daily(1.0),
            auto_downgrade: DowngradeConfig {
                enabled: true,
                thresholds: vec![
                    DowngradeThreshold {
                        at: 0.5,
                        model: "mid-model".to_string(),
                    },
                    DowngradeThreshold {
                        at: 0.75,
                        model: "cheap-model".to_string(),
                    },
                ],
            },
            ..Default::default()
        };
        let governor = BudgetGovernor::new(store, config);

        let decision = governor.check("helper", None).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.alert, AlertLevel::Warning);
        // highest threshold at or below 0.8 wins
        assert_eq!(decision.downgrade_model.as_deref(), Some("cheap-model"));
    }

    #[tokio::test]
    async fn test_downgrade_disabled() {
        let store = store_with_spend("helper", 0.95).await;
        let config = BudgetsConfig {
            global: daily(1.0),
            auto_downgrade: DowngradeConfig {
                enabled: false,
                thresholds: vec![DowngradeThreshold {
                    at: 0.5,
                    model: "cheap".to_string(),
                }],
            },
            ..Default::default()
        };
        let governor = BudgetGovernor::new(store, config);

        let decision = governor.check("helper", None).await.unwrap();
        assert_eq!(decision.alert, AlertLevel::Critical);
        assert!(decision.downgrade_model.is_none());
    }

    #[test]
    fn test_alert_tracker_cooldown() {
        let tracker = AlertTracker::new(Duration::from_secs(60));
        assert!(tracker.should_notify("global:daily:critical"));
        assert!(!tracker.should_notify("global:daily:critical"));
        assert!(tracker.should_notify("global:weekly:warning"));
    }
}
