//! Job run history
//!
//! One row per task execution that reached the provider step, inserted
//! at most once per task id. Aggregate queries feed the budget governor,
//! the SLA checker, and the dashboard-facing endpoints.

use super::Store;
use crate::error::Result;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Row};

/// Maximum characters kept in `output_summary`
const SUMMARY_MAX_CHARS: usize = 1000;

/// One durably recorded execution
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRun {
    /// Task id; primary key, one row per task
    pub id: String,
    /// External identity (cron job id, workflow step, ...)
    pub job_id: String,
    /// Human-readable name
    pub name: String,
    /// Ingress tag (telegram, http, cron, workflow, cli)
    pub source: String,
    /// When the provider step began
    pub started_at: DateTime<Utc>,
    /// When the result was produced
    pub finished_at: DateTime<Utc>,
    /// Terminal status string
    pub status: String,
    /// Process exit code (0 for HTTP providers)
    pub exit_code: i64,
    /// Cost in USD
    pub cost_usd: f64,
    /// Output truncated to 1000 chars
    pub output_summary: String,
    /// Error text when failed
    pub error: String,
    /// Model that served the call
    pub model: String,
    /// Session the task belonged to
    pub session_id: Option<String>,
    /// Path of the full output file, when persisted
    pub output_file: Option<String>,
    /// Input tokens
    pub tokens_in: i64,
    /// Output tokens
    pub tokens_out: i64,
    /// Agent persona
    pub agent: String,
}

/// History query filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunFilter {
    /// Status to match exactly
    pub status: Option<String>,
    /// Inclusive lower bound on `started_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`
    pub to: Option<DateTime<Utc>>,
    /// Agent to match exactly
    pub agent: Option<String>,
    /// Row cap (default 100)
    pub limit: Option<u32>,
}

/// One day's aggregate
#[derive(Debug, Clone, Serialize)]
pub struct DailyStat {
    /// Day in `YYYY-MM-DD`
    pub day: String,
    /// Total runs
    pub runs: i64,
    /// Successful runs
    pub successes: i64,
    /// Summed cost in USD
    pub cost_usd: f64,
}

/// Aggregate per model
#[derive(Debug, Clone, Serialize)]
pub struct ModelStat {
    /// Model name
    pub model: String,
    /// Total runs
    pub runs: i64,
    /// Summed cost in USD
    pub cost_usd: f64,
    /// Summed input tokens
    pub tokens_in: i64,
    /// Summed output tokens
    pub tokens_out: i64,
}

/// Recurring failure bucket
#[derive(Debug, Clone, Serialize)]
pub struct FailureStat {
    /// Agent persona
    pub agent: String,
    /// Error text
    pub error: String,
    /// Occurrences
    pub count: i64,
}

/// Spend over the governor's three periods
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SpendSnapshot {
    /// Since UTC midnight
    pub today: f64,
    /// Last 7 days
    pub week: f64,
    /// Since the first of the current month
    pub month: f64,
}

/// Success-rate and latency aggregate for one agent
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentMetrics {
    /// Total runs in the window
    pub total: i64,
    /// Successful runs in the window
    pub successes: i64,
    /// successes / total (1.0 for an empty window)
    pub success_rate: f64,
    /// 95th percentile run duration in milliseconds
    pub p95_latency_ms: f64,
}

/// Truncate a summary on a char boundary
fn truncate_summary(text: &str) -> String {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(SUMMARY_MAX_CHARS).collect()
}

impl Store {
    /// Insert one run; a second insert with the same task id is a no-op.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn record_run(&self, run: &JobRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_runs
                (id, job_id, name, source, started_at, finished_at, status, exit_code,
                 cost_usd, output_summary, error, model, session_id, output_file,
                 tokens_in, tokens_out, agent)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.job_id)
        .bind(&run.name)
        .bind(&run.source)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.status)
        .bind(run.exit_code)
        .bind(run.cost_usd)
        .bind(truncate_summary(&run.output_summary))
        .bind(&run.error)
        .bind(&run.model)
        .bind(&run.session_id)
        .bind(&run.output_file)
        .bind(run.tokens_in)
        .bind(run.tokens_out)
        .bind(&run.agent)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch one run by task id
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn get_run(&self, id: &str) -> Result<Option<JobRun>> {
        let run = sqlx::query_as::<_, JobRun>("SELECT * FROM job_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(run)
    }

    /// Fetch runs recorded for an external job id, newest first
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn runs_for_job(&self, job_id: &str, limit: u32) -> Result<Vec<JobRun>> {
        let runs = sqlx::query_as::<_, JobRun>(
            "SELECT * FROM job_runs WHERE job_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(runs)
    }

    /// Filtered listing, newest first
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<JobRun>> {
        let mut builder = QueryBuilder::new("SELECT * FROM job_runs WHERE 1=1");
        if let Some(status) = &filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(agent) = &filter.agent {
            builder.push(" AND agent = ").push_bind(agent);
        }
        if let Some(from) = filter.from {
            builder.push(" AND started_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND started_at < ").push_bind(to);
        }
        builder
            .push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(100));

        let runs = builder
            .build_query_as::<JobRun>()
            .fetch_all(self.pool())
            .await?;
        Ok(runs)
    }

    /// Per-day totals over the last `days` days
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn daily_stats(&self, days: u32) -> Result<Vec<DailyStat>> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let rows = sqlx::query(
            r#"
            SELECT date(started_at) AS day,
                   COUNT(*) AS runs,
                   SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END) AS successes,
                   COALESCE(SUM(cost_usd), 0) AS cost_usd
            FROM job_runs
            WHERE started_at >= ?
            GROUP BY date(started_at)
            ORDER BY day
            "#,
        )
        .bind(since)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DailyStat {
                day: row.get("day"),
                runs: row.get("runs"),
                successes: row.get("successes"),
                cost_usd: row.get("cost_usd"),
            })
            .collect())
    }

    /// Totals per model, highest spend first
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn model_stats(&self) -> Result<Vec<ModelStat>> {
        let rows = sqlx::query(
            r#"
            SELECT model,
                   COUNT(*) AS runs,
                   COALESCE(SUM(cost_usd), 0) AS cost_usd,
                   COALESCE(SUM(tokens_in), 0) AS tokens_in,
                   COALESCE(SUM(tokens_out), 0) AS tokens_out
            FROM job_runs
            WHERE model != ''
            GROUP BY model
            ORDER BY cost_usd DESC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ModelStat {
                model: row.get("model"),
                runs: row.get("runs"),
                cost_usd: row.get("cost_usd"),
                tokens_in: row.get("tokens_in"),
                tokens_out: row.get("tokens_out"),
            })
            .collect())
    }

    /// Most frequent failure buckets, largest first
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn top_failures(&self, limit: u32) -> Result<Vec<FailureStat>> {
        let rows = sqlx::query(
            r#"
            SELECT agent, error, COUNT(*) AS count
            FROM job_runs
            WHERE status != 'success' AND error != ''
            GROUP BY agent, error
            ORDER BY count DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FailureStat {
                agent: row.get("agent"),
                error: row.get("error"),
                count: row.get("count"),
            })
            .collect())
    }

    /// Success rate and p95 latency for one agent since `since`
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn agent_metrics(
        &self,
        agent: &str,
        since: DateTime<Utc>,
    ) -> Result<AgentMetrics> {
        let rows = sqlx::query(
            r#"
            SELECT status, started_at, finished_at
            FROM job_runs
            WHERE agent = ? AND started_at >= ?
            "#,
        )
        .bind(agent)
        .bind(since)
        .fetch_all(self.pool())
        .await?;

        let total = rows.len() as i64;
        let mut successes = 0i64;
        let mut durations_ms: Vec<f64> = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            if status == "success" {
                successes += 1;
            }
            let started: DateTime<Utc> = row.get("started_at");
            let finished: DateTime<Utc> = row.get("finished_at");
            durations_ms.push((finished - started).num_milliseconds() as f64);
        }

        let success_rate = if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        };
        let p95_latency_ms = percentile(&mut durations_ms, 0.95);

        Ok(AgentMetrics {
            total,
            successes,
            success_rate,
            p95_latency_ms,
        })
    }

    /// Sums of `cost_usd` over today / last week / this month.
    ///
    /// With an agent filter the sums cover that agent's runs only.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn spend(&self, agent: Option<&str>) -> Result<SpendSnapshot> {
        let now = Utc::now();
        let today_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        let week_start = now - Duration::days(7);
        let month_start = now
            .date_naive()
            .with_day(1)
            .unwrap_or(now.date_naive())
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();

        let mut snapshot = SpendSnapshot::default();
        for (bound, slot) in [
            (today_start, 0usize),
            (week_start, 1),
            (month_start, 2),
        ] {
            let mut builder = QueryBuilder::new(
                "SELECT COALESCE(SUM(cost_usd), 0) AS total FROM job_runs WHERE started_at >= ",
            );
            builder.push_bind(bound);
            if let Some(agent) = agent {
                builder.push(" AND agent = ").push_bind(agent);
            }
            let total: f64 = builder.build().fetch_one(self.pool()).await?.get("total");
            match slot {
                0 => snapshot.today = total,
                1 => snapshot.week = total,
                _ => snapshot.month = total,
            }
        }
        Ok(snapshot)
    }

    /// Latest successful output for an agent (powers `{{last_output}}`)
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn last_output(&self, agent: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT output_summary FROM job_runs
            WHERE agent = ? AND status = 'success'
            ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .bind(agent)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.get("output_summary")))
    }

    /// Average cost of one run for an agent (workflow dry-run estimates)
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn average_cost(&self, agent: &str) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(AVG(cost_usd), 0) AS avg_cost FROM job_runs WHERE agent = ?",
        )
        .bind(agent)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get("avg_cost"))
    }
}

/// Nearest-rank percentile; 0.0 for an empty slice
fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p * values.len() as f64).ceil() as usize).clamp(1, values.len());
    values[rank - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str, agent: &str, status: &str, cost: f64) -> JobRun {
        let now = Utc::now();
        JobRun {
            id: id.to_string(),
            job_id: String::new(),
            name: format!("run {id}"),
            source: "test".to_string(),
            started_at: now,
            finished_at: now + Duration::milliseconds(250),
            status: status.to_string(),
            exit_code: 0,
            cost_usd: cost,
            output_summary: "done".to_string(),
            error: String::new(),
            model: "test-model".to_string(),
            session_id: None,
            output_file: None,
            tokens_in: 10,
            tokens_out: 5,
            agent: agent.to_string(),
        }
    }

    #[tokio::test]
    async fn test_record_is_at_most_once() {
        let store = Store::open_in_memory().await.unwrap();
        let mut r = run("t1", "helper", "success", 0.5);
        store.record_run(&r).await.unwrap();
        r.cost_usd = 99.0;
        store.record_run(&r).await.unwrap();

        let stored = store.get_run("t1").await.unwrap().unwrap();
        assert!((stored.cost_usd - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_spend_sums_by_agent() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_run(&run("a", "helper", "success", 0.4)).await.unwrap();
        store.record_run(&run("b", "helper", "error", 0.2)).await.unwrap();
        store.record_run(&run("c", "other", "success", 1.0)).await.unwrap();

        let all = store.spend(None).await.unwrap();
        assert!((all.today - 1.6).abs() < 1e-9);

        let helper = store.spend(Some("helper")).await.unwrap();
        assert!((helper.today - 0.6).abs() < 1e-9);
        assert!((helper.week - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_list_runs_filter() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_run(&run("a", "helper", "success", 0.0)).await.unwrap();
        store.record_run(&run("b", "helper", "error", 0.0)).await.unwrap();

        let filter = RunFilter {
            status: Some("error".to_string()),
            ..Default::default()
        };
        let runs = store.list_runs(&filter).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, "b");
    }

    #[tokio::test]
    async fn test_agent_metrics() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_run(&run("a", "helper", "success", 0.0)).await.unwrap();
        store.record_run(&run("b", "helper", "success", 0.0)).await.unwrap();
        store.record_run(&run("c", "helper", "error", 0.0)).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        let metrics = store.agent_metrics("helper", since).await.unwrap();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.successes, 2);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(metrics.p95_latency_ms > 0.0);
    }

    #[tokio::test]
    async fn test_summary_truncated() {
        let store = Store::open_in_memory().await.unwrap();
        let mut r = run("big", "helper", "success", 0.0);
        r.output_summary = "x".repeat(5000);
        store.record_run(&r).await.unwrap();

        let stored = store.get_run("big").await.unwrap().unwrap();
        assert_eq!(stored.output_summary.chars().count(), 1000);
    }

    #[tokio::test]
    async fn test_last_output_and_average_cost() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_run(&run("a", "helper", "success", 1.0)).await.unwrap();
        store.record_run(&run("b", "helper", "success", 3.0)).await.unwrap();

        assert_eq!(
            store.last_output("helper").await.unwrap().as_deref(),
            Some("done")
        );
        assert!((store.average_cost("helper").await.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile() {
        let mut values = vec![10.0, 20.0, 30.0, 40.0, 100.0];
        assert!((percentile(&mut values, 0.95) - 100.0).abs() < 1e-9);
        let mut empty: Vec<f64> = vec![];
        assert_eq!(percentile(&mut empty, 0.95), 0.0);
    }
}
