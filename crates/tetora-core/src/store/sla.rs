//! SLA check persistence

use super::Store;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// One recorded SLA evaluation
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SlaCheck {
    /// Agent persona evaluated
    pub agent: String,
    /// Evaluation time
    pub checked_at: DateTime<Utc>,
    /// Observed success rate (0.0–1.0)
    pub success_rate: f64,
    /// Observed p95 latency in milliseconds
    pub p95_latency_ms: f64,
    /// Whether a target was breached
    pub violation: bool,
    /// Human-readable breach description
    pub detail: String,
}

impl Store {
    /// Persist one check result
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn record_sla_check(&self, check: &SlaCheck) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sla_checks (agent, checked_at, success_rate, p95_latency_ms, violation, detail)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&check.agent)
        .bind(check.checked_at)
        .bind(check.success_rate)
        .bind(check.p95_latency_ms)
        .bind(check.violation)
        .bind(&check.detail)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Latest checks for one agent, newest first
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn recent_sla_checks(&self, agent: &str, limit: u32) -> Result<Vec<SlaCheck>> {
        let checks = sqlx::query_as::<_, SlaCheck>(
            "SELECT agent, checked_at, success_rate, p95_latency_ms, violation, detail
             FROM sla_checks WHERE agent = ? ORDER BY checked_at DESC LIMIT ?",
        )
        .bind(agent)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sla_check_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let check = SlaCheck {
            agent: "helper".to_string(),
            checked_at: Utc::now(),
            success_rate: 0.85,
            p95_latency_ms: 1200.0,
            violation: true,
            detail: "success rate 0.85 below target 0.95".to_string(),
        };
        store.record_sla_check(&check).await.unwrap();

        let recent = store.recent_sla_checks("helper", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].violation);
        assert!((recent[0].success_rate - 0.85).abs() < 1e-9);
    }
}
