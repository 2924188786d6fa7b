//! Cron execution engine
//!
//! A one-minute select loop over a ticker and a cancellation token. Each
//! matching job builds a Task and goes through the dispatcher in its own
//! spawned task; a job already at its concurrency cap skips the tick.

use super::expr::CronExpr;
use super::{ApprovalState, CronJobSpec};
use crate::admission::SpawnTracker;
use crate::dispatch::{Dispatcher, Task, TaskResult};
use crate::error::{Error, Result};
use crate::metrics::global as metrics;
use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct JobEntry {
    spec: CronJobSpec,
    expr: CronExpr,
    last_fired_minute: Option<DateTime<Utc>>,
}

/// Job state exposed over the management API
#[derive(Debug, Clone, Serialize)]
pub struct CronJobView {
    /// The job definition
    #[serde(flatten)]
    pub spec: CronJobSpec,
    /// Next fire time in the engine timezone, when computable
    pub next_run: Option<DateTime<FixedOffset>>,
    /// Runs currently in flight
    pub running: u32,
}

/// Fires scheduled jobs through the dispatcher
pub struct CronEngine {
    dispatcher: Arc<Dispatcher>,
    timezone: FixedOffset,
    jobs: RwLock<HashMap<String, JobEntry>>,
    running: SpawnTracker,
}

impl CronEngine {
    /// Create an engine seeded with the configured jobs.
    ///
    /// # Errors
    /// Returns an error when a seeded job's schedule does not parse.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        timezone: FixedOffset,
        seeds: &[CronJobSpec],
    ) -> Result<Self> {
        let mut jobs = HashMap::new();
        for spec in seeds {
            let expr = CronExpr::parse(&spec.schedule)?;
            jobs.insert(
                spec.id.clone(),
                JobEntry {
                    spec: spec.clone(),
                    expr,
                    last_fired_minute: None,
                },
            );
        }
        Ok(Self {
            dispatcher,
            timezone,
            jobs: RwLock::new(jobs),
            running: SpawnTracker::new(),
        })
    }

    /// Run the tick loop until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let job_count = self.jobs.read().await.len();
        info!(jobs = job_count, "cron engine started");
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now(), &cancel).await;
                }
                _ = cancel.cancelled() => {
                    info!("cron engine stopped");
                    return;
                }
            }
        }
    }

    /// Evaluate one tick at the given instant (injectable for tests)
    pub async fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) {
        let local = now.with_timezone(&self.timezone);
        let minute = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let mut due = Vec::new();

        {
            let mut jobs = self.jobs.write().await;
            for entry in jobs.values_mut() {
                if !entry.spec.fireable() || !entry.expr.matches(local) {
                    continue;
                }
                if entry.last_fired_minute == Some(minute) {
                    continue;
                }
                entry.last_fired_minute = Some(minute);
                due.push(entry.spec.clone());
            }
        }

        for spec in due {
            self.fire(spec, cancel).await;
        }
    }

    async fn fire(&self, spec: CronJobSpec, cancel: &CancellationToken) {
        if !self
            .running
            .try_spawn(&spec.id, spec.max_concurrent_runs as usize)
        {
            warn!(job_id = %spec.id, "previous run still in flight, skipping tick");
            metrics::labeled_counter("cron_skipped_total").inc(&[("job", &spec.id)]);
            return;
        }

        debug!(job_id = %spec.id, agent = %spec.agent, "cron job firing");
        let task = build_task(&spec);
        let dispatcher = self.dispatcher.clone();
        let running = self.running.clone();
        let job_id = spec.id.clone();
        let cancel = cancel.child_token();

        tokio::spawn(async move {
            let result = dispatcher.dispatch(task, cancel).await;
            info!(
                job_id = %job_id,
                status = result.status.as_str(),
                cost_usd = result.cost_usd,
                "cron run finished"
            );
            running.release(&job_id);
        });
    }

    /// Dispatch one job immediately, outside its schedule
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown job id.
    pub async fn run_now(&self, id: &str, cancel: CancellationToken) -> Result<TaskResult> {
        let spec = {
            let jobs = self.jobs.read().await;
            jobs.get(id)
                .map(|entry| entry.spec.clone())
                .ok_or_else(|| Error::NotFound(format!("cron job '{id}'")))?
        };
        Ok(self.dispatcher.dispatch(build_task(&spec), cancel).await)
    }

    /// All jobs with their next fire times
    pub async fn list(&self) -> Vec<CronJobView> {
        let now = Utc::now().with_timezone(&self.timezone);
        let jobs = self.jobs.read().await;
        let mut views: Vec<CronJobView> = jobs
            .values()
            .map(|entry| CronJobView {
                spec: entry.spec.clone(),
                next_run: entry.expr.next_after(now),
                running: self.running.active(&entry.spec.id) as u32,
            })
            .collect();
        views.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        views
    }

    /// One job
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown job id.
    pub async fn get(&self, id: &str) -> Result<CronJobView> {
        let now = Utc::now().with_timezone(&self.timezone);
        let jobs = self.jobs.read().await;
        jobs.get(id)
            .map(|entry| CronJobView {
                spec: entry.spec.clone(),
                next_run: entry.expr.next_after(now),
                running: self.running.active(&entry.spec.id) as u32,
            })
            .ok_or_else(|| Error::NotFound(format!("cron job '{id}'")))
    }

    /// Register a job; API-created jobs start pending approval.
    ///
    /// # Errors
    /// Returns an error for a duplicate id or an unparseable schedule.
    pub async fn add(&self, mut spec: CronJobSpec, require_approval: bool) -> Result<()> {
        let expr = CronExpr::parse(&spec.schedule)?;
        if require_approval {
            spec.approval = ApprovalState::Pending;
        }

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&spec.id) {
            return Err(Error::Cron(format!("duplicate cron job id '{}'", spec.id)));
        }
        info!(job_id = %spec.id, schedule = %spec.schedule, "cron job added");
        jobs.insert(
            spec.id.clone(),
            JobEntry {
                spec,
                expr,
                last_fired_minute: None,
            },
        );
        Ok(())
    }

    /// Replace a job definition, keeping its approval state
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id or `Cron` for a bad schedule.
    pub async fn update(&self, id: &str, mut spec: CronJobSpec) -> Result<()> {
        let expr = CronExpr::parse(&spec.schedule)?;
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("cron job '{id}'")))?;
        spec.id = id.to_string();
        spec.approval = entry.spec.approval;
        entry.spec = spec;
        entry.expr = expr;
        entry.last_fired_minute = None;
        Ok(())
    }

    /// Remove a job
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("cron job '{id}'")))
    }

    /// Flip enabled; returns the new value
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn toggle(&self, id: &str) -> Result<bool> {
        self.mutate(id, |spec| {
            spec.enabled = !spec.enabled;
            spec.enabled
        })
        .await
    }

    /// Approve a pending job
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn approve(&self, id: &str) -> Result<()> {
        self.mutate(id, |spec| spec.approval = ApprovalState::Approved)
            .await
    }

    /// Reject a job
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn reject(&self, id: &str) -> Result<()> {
        self.mutate(id, |spec| spec.approval = ApprovalState::Rejected)
            .await
    }

    async fn mutate<T>(&self, id: &str, apply: impl FnOnce(&mut CronJobSpec) -> T) -> Result<T> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("cron job '{id}'")))?;
        Ok(apply(&mut entry.spec))
    }
}

fn build_task(spec: &CronJobSpec) -> Task {
    let mut task = Task::new(&spec.agent, &spec.prompt)
        .with_source("cron")
        .with_job_id(&spec.id);
    task.name = spec.name.clone();
    task.model = spec.model.clone();
    task.timeout_secs = spec.timeout_secs;
    task
}
