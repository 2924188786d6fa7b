//! SLA checker
//!
//! Periodic aggregation over job run history to detect success-rate and
//! p95-latency violations per agent. Each evaluation is persisted to
//! `sla_checks`.

use crate::config::SlaConfig;
use crate::error::Result;
use crate::metrics::global as metrics;
use crate::store::{SlaCheck, Store};
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Evaluates configured SLA targets on a timer
pub struct SlaChecker {
    store: Store,
    config: SlaConfig,
}

impl SlaChecker {
    /// Create a checker
    #[must_use]
    pub fn new(store: Store, config: SlaConfig) -> Self {
        Self { store, config }
    }

    /// Run the periodic loop until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        if self.config.targets.is_empty() {
            debug!("no SLA targets configured, checker idle");
            return;
        }
        info!(
            targets = self.config.targets.len(),
            interval_secs = self.config.check_interval_secs,
            "sla checker started"
        );

        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.check_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // consume the immediate first tick so checks start one interval in
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_all().await {
                        warn!(error = %e, "sla check pass failed");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("sla checker stopped");
                    return;
                }
            }
        }
    }

    /// Evaluate every configured agent once
    ///
    /// # Errors
    /// Returns the first store error encountered.
    pub async fn check_all(&self) -> Result<Vec<SlaCheck>> {
        let since = Utc::now() - Duration::hours(self.config.window_hours);
        let mut checks = Vec::with_capacity(self.config.targets.len());

        for (agent, target) in &self.config.targets {
            let observed = self.store.agent_metrics(agent, since).await?;
            if observed.total == 0 {
                debug!(agent = %agent, "no runs in window, skipping sla check");
                continue;
            }

            let mut breaches = Vec::new();
            if observed.success_rate < target.min_success_rate {
                breaches.push(format!(
                    "success rate {:.3} below target {:.3}",
                    observed.success_rate, target.min_success_rate
                ));
            }
            if observed.p95_latency_ms > target.max_p95_ms {
                breaches.push(format!(
                    "p95 latency {:.0}ms above target {:.0}ms",
                    observed.p95_latency_ms, target.max_p95_ms
                ));
            }

            let violation = !breaches.is_empty();
            let check = SlaCheck {
                agent: agent.clone(),
                checked_at: Utc::now(),
                success_rate: observed.success_rate,
                p95_latency_ms: observed.p95_latency_ms,
                violation,
                detail: breaches.join("; "),
            };

            if violation {
                warn!(agent = %agent, detail = %check.detail, "sla violation");
                metrics::labeled_counter("sla_violations_total").inc(&[("role", agent)]);
            }
            if let Err(e) = self.store.record_sla_check(&check).await {
                warn!(agent = %agent, error = %e, "sla check write failed");
            }
            checks.push(check);
        }
        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlaTarget;
    use crate::store::JobRun;
    use std::collections::HashMap;

    async fn seeded_store(successes: usize, failures: usize) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        for i in 0..successes + failures {
            let status = if i < successes { "success" } else { "error" };
            store
                .record_run(&JobRun {
                    id: format!("run-{i}"),
                    job_id: String::new(),
                    name: String::new(),
                    source: "test".to_string(),
                    started_at: now,
                    finished_at: now + Duration::milliseconds(100),
                    status: status.to_string(),
                    exit_code: 0,
                    cost_usd: 0.0,
                    output_summary: String::new(),
                    error: String::new(),
                    model: String::new(),
                    session_id: None,
                    output_file: None,
                    tokens_in: 0,
                    tokens_out: 0,
                    agent: "helper".to_string(),
                })
                .await
                .unwrap();
        }
        store
    }

    fn config(min_success_rate: f64, max_p95_ms: f64) -> SlaConfig {
        let mut targets = HashMap::new();
        targets.insert(
            "helper".to_string(),
            SlaTarget {
                min_success_rate,
                max_p95_ms,
            },
        );
        SlaConfig {
            check_interval_secs: 900,
            window_hours: 24,
            targets,
        }
    }

    #[tokio::test]
    async fn test_violation_detected_and_recorded() {
        let store = seeded_store(6, 4).await;
        let checker = SlaChecker::new(store.clone(), config(0.95, 60_000.0));

        let checks = checker.check_all().await.unwrap();
        assert_eq!(checks.len(), 1);
        assert!(checks[0].violation);
        assert!(checks[0].detail.contains("success rate"));

        let recorded = store.recent_sla_checks("helper", 5).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].violation);
    }

    #[tokio::test]
    async fn test_healthy_agent_passes() {
        let store = seeded_store(10, 0).await;
        let checker = SlaChecker::new(store, config(0.95, 60_000.0));

        let checks = checker.check_all().await.unwrap();
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].violation);
        assert!(checks[0].detail.is_empty());
    }

    #[tokio::test]
    async fn test_empty_window_skipped() {
        let store = Store::open_in_memory().await.unwrap();
        let checker = SlaChecker::new(store, config(0.95, 60_000.0));
        let checks = checker.check_all().await.unwrap();
        assert!(checks.is_empty());
    }
}
