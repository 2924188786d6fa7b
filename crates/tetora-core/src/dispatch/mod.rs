//! Dispatcher
//!
//! The single entry point for "execute one task": defaults, template
//! expansion, admission, budget, the provider fallback loop under circuit
//! breakers, and durable recording of the outcome.

mod task;
mod template;

pub use task::{Task, TaskResult, TaskStatus};
pub use template::expand;

use crate::audit::{AuditEntry, AuditLog};
use crate::budget::{AlertLevel, AlertTracker, BudgetGovernor};
use crate::circuit::{Admission, CircuitRegistry};
use crate::config::TetoraConfig;
use crate::error::Error;
use crate::metrics::{global as metrics, Timer};
use crate::store::{JobRun, NewMessage, SessionService, Store};
use crate::AdmissionController;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tetora_llm::{Provider, ProviderRegistry, ProviderRequest, ProviderResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra headroom for the in-process dispatch-as-tool hop
const CHILD_TIMEOUT_BUFFER_SECS: u64 = 10;

/// Timeout for compaction summary calls
const COMPACT_TIMEOUT_SECS: u64 = 60;

/// Outcome of one pass over the provider chain
enum ChainOutcome {
    Served {
        provider: String,
        response: ProviderResponse,
    },
    Cancelled,
    Exhausted {
        message: String,
        timed_out: bool,
    },
}

/// Orchestrates one task from acceptance to a durably recorded result
pub struct Dispatcher {
    config: Arc<TetoraConfig>,
    store: Store,
    sessions: SessionService,
    providers: Arc<ProviderRegistry>,
    circuits: Arc<CircuitRegistry>,
    admission: Arc<AdmissionController>,
    governor: BudgetGovernor,
    alerts: AlertTracker,
    audit: AuditLog,
}

impl Dispatcher {
    /// Assemble a dispatcher over the shared subsystems
    #[must_use]
    pub fn new(
        config: Arc<TetoraConfig>,
        store: Store,
        providers: Arc<ProviderRegistry>,
        admission: Arc<AdmissionController>,
        audit: AuditLog,
    ) -> Self {
        let sessions = SessionService::new(store.clone(), config.sessions.clone());
        let circuits = Arc::new(CircuitRegistry::new(config.circuit));
        let governor = BudgetGovernor::new(store.clone(), config.budgets.clone());
        Self {
            config,
            store,
            sessions,
            providers,
            circuits,
            admission,
            governor,
            alerts: AlertTracker::default(),
            audit,
        }
    }

    /// The session service shared with ingresses
    #[must_use]
    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    /// The history store
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The admission controller (saturation checks, drain)
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// The circuit registry (state gauges, diagnostics)
    #[must_use]
    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    /// Process configuration
    #[must_use]
    pub fn config(&self) -> &Arc<TetoraConfig> {
        &self.config
    }

    /// Execute one task to completion.
    ///
    /// Never fails at the call site: every failure mode folds into the
    /// returned result's status and error text.
    pub async fn dispatch(&self, mut task: Task, cancel: CancellationToken) -> TaskResult {
        task.ensure_id();
        let timer = Timer::start();
        debug!(task_id = %task.id, agent = %task.agent, source = %task.source, "dispatch started");

        let result = self.run(&mut task, &cancel).await;

        let elapsed = timer.elapsed_secs();
        self.observe(&task, &result, elapsed);
        info!(
            task_id = %task.id,
            agent = %task.agent,
            status = result.status.as_str(),
            cost_usd = result.cost_usd,
            elapsed_secs = elapsed,
            "dispatch finished"
        );
        result
    }

    /// Spawn a child task through the in-process dispatch-as-tool path.
    ///
    /// Propagates the parent id and `depth + 1`, and pads the timeout with a
    /// small buffer for the extra hop.
    pub async fn spawn_child(
        &self,
        parent: &Task,
        mut child: Task,
        cancel: CancellationToken,
    ) -> TaskResult {
        child.parent_id = Some(parent.id.clone());
        child.depth = parent.depth + 1;
        if child.source.is_empty() || child.source == "cli" {
            child.source = parent.source.clone();
        }
        let base = child
            .timeout_secs
            .unwrap_or(self.config.defaults.timeout_secs);
        child.timeout_secs = Some(base + CHILD_TIMEOUT_BUFFER_SECS);
        self.dispatch(child, cancel).await
    }

    async fn run(&self, task: &mut Task, cancel: &CancellationToken) -> TaskResult {
        // 1. Defaults from configuration
        let agent = match self.config.agent(&task.agent) {
            Ok(agent) => agent.clone(),
            Err(e) => return TaskResult::error(e.to_string()),
        };
        let timeout = Duration::from_secs(
            task.timeout_secs.unwrap_or(self.config.defaults.timeout_secs),
        );
        let mut model = task
            .model
            .clone()
            .or_else(|| agent.model.clone())
            .or_else(|| self.config.defaults.model.clone())
            .unwrap_or_default();
        let system_prompt = task
            .system_prompt
            .clone()
            .or_else(|| (!agent.system_prompt.is_empty()).then(|| agent.system_prompt.clone()));
        let workdir = task
            .allowed_dirs
            .first()
            .or_else(|| agent.allowed_dirs.first())
            .cloned();
        if task.permission_mode.is_none() {
            task.permission_mode = agent
                .permission_mode
                .or(Some(self.config.defaults.permission_mode));
        }
        if task.budget_usd.is_none() {
            task.budget_usd = agent.budget_usd;
        }
        if task.allowed_dirs.is_empty() {
            task.allowed_dirs = agent.allowed_dirs.clone();
        }

        // 2. Template expansion; a failed store lookup falls back to the raw prompt
        let prompt = match template::expand(
            &task.prompt,
            &self.store,
            &task.agent,
            self.config.knowledge_dir.as_deref(),
        )
        .await
        {
            Ok(expanded) => expanded,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "template expansion failed");
                task.prompt.clone()
            }
        };

        // 3. Admission: depth gate, pool permit, spawn slot
        metrics::gauge("queue_depth").inc();
        let admit = self
            .admission
            .admit(task.depth, task.parent_id.as_deref())
            .await;
        metrics::gauge("queue_depth").dec();
        let _permit = match admit {
            Ok(permit) => permit,
            Err(e) => {
                let mut result = TaskResult::error(e.to_string());
                result.session_id = task.session_id.clone();
                return result;
            }
        };

        // 4. Budget admission; a failed spend query does not lose the dispatch
        match self.governor.check(&task.agent, task.workflow_run_cost).await {
            Ok(decision) => {
                if !decision.allowed {
                    let mut result = TaskResult::skipped(decision.message);
                    result.session_id = task.session_id.clone();
                    return result;
                }
                if decision.alert != AlertLevel::Ok {
                    let key = format!("{}:{}", task.agent, decision.alert.as_str());
                    if self.alerts.should_notify(&key) {
                        warn!(
                            agent = %task.agent,
                            utilization = decision.utilization,
                            level = decision.alert.as_str(),
                            "budget utilization alert"
                        );
                    }
                }
                if let Some(downgrade) = decision.downgrade_model {
                    info!(task_id = %task.id, model = %downgrade, "budget downgrade applied");
                    model = downgrade;
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "budget check failed, allowing dispatch");
                metrics::counter("budget_check_errors_total").inc();
            }
        }

        // 5. Provider chain: task override, then agent chain, then global fallbacks
        let mut chain = self.config.provider_chain(&agent);
        if let Some(override_provider) = &task.provider {
            chain.retain(|name| name != override_provider);
            chain.insert(0, override_provider.clone());
        }
        if chain.is_empty() {
            return TaskResult::error(format!(
                "agent '{}' has no provider configured",
                task.agent
            ));
        }

        // 6. Session context for providers without native sessions
        let context = match &task.session_id {
            Some(session_id) => {
                match self
                    .sessions
                    .build_context(session_id, self.config.sessions.context_max_messages)
                    .await
                {
                    Ok(context) => context,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "context build failed");
                        String::new()
                    }
                }
            }
            None => String::new(),
        };

        // 7. The fallback loop
        let started_at = Utc::now();
        let outcome = self
            .execute_chain(
                &chain,
                &prompt,
                &context,
                system_prompt.as_deref(),
                &model,
                timeout,
                task.session_id.as_deref(),
                workdir,
                cancel,
            )
            .await;
        let finished_at = Utc::now();

        let mut result = match outcome {
            ChainOutcome::Served { provider, response } => {
                metrics::labeled_counter("tokens_total")
                    .inc_by(&[("provider", &provider), ("direction", "in")], response.tokens_in);
                metrics::labeled_counter("tokens_total").inc_by(
                    &[("provider", &provider), ("direction", "out")],
                    response.tokens_out,
                );
                TaskResult {
                    status: TaskStatus::Success,
                    output: response.output,
                    error: String::new(),
                    exit_code: response.exit_code,
                    cost_usd: response.cost_usd,
                    tokens_in: response.tokens_in,
                    tokens_out: response.tokens_out,
                    model: response.model,
                    session_id: task.session_id.clone(),
                    output_file: None,
                }
            }
            ChainOutcome::Cancelled => {
                let mut result = TaskResult::cancelled();
                result.session_id = task.session_id.clone();
                result
            }
            ChainOutcome::Exhausted { message, timed_out } => {
                let mut result = TaskResult::error(message);
                if timed_out {
                    result.status = TaskStatus::Timeout;
                }
                result.session_id = task.session_id.clone();
                result
            }
        };

        if let Some(cap) = task.budget_usd {
            if result.cost_usd > cap {
                warn!(
                    task_id = %task.id,
                    cost_usd = result.cost_usd,
                    cap_usd = cap,
                    "task exceeded its own budget cap"
                );
                metrics::labeled_counter("task_budget_overruns_total")
                    .inc(&[("role", &task.agent)]);
            }
        }

        // 8. Durable recording; history loss is preferred over dispatch loss
        if task.record {
            result.output_file = self.persist_full_output(&task.id, &result.output);
            let run = JobRun {
                id: task.id.clone(),
                job_id: task.job_id.clone().unwrap_or_default(),
                name: task.name.clone(),
                source: task.source.clone(),
                started_at,
                finished_at,
                status: result.status.as_str().to_string(),
                exit_code: i64::from(result.exit_code),
                cost_usd: result.cost_usd,
                output_summary: result.output.clone(),
                error: result.error.clone(),
                model: result.model.clone(),
                session_id: task.session_id.clone(),
                output_file: result
                    .output_file
                    .as_ref()
                    .map(|path| path.display().to_string()),
                tokens_in: result.tokens_in as i64,
                tokens_out: result.tokens_out as i64,
                agent: task.agent.clone(),
            };
            if let Err(e) = self.store.record_run(&run).await {
                warn!(task_id = %task.id, error = %e, "history write failed");
                metrics::counter("history_write_errors_total").inc();
            }
        }

        // 9. Session writes happen only for successful provider completion
        if result.is_success() {
            if let Some(session_id) = task.session_id.clone() {
                self.append_session_turns(&session_id, task, &prompt, &result)
                    .await;
                self.maybe_compact(&session_id, &chain, cancel).await;
            }
        }

        result
    }

    /// Walk the provider chain in order, skipping open circuits.
    #[allow(clippy::too_many_arguments)]
    async fn execute_chain(
        &self,
        chain: &[String],
        prompt: &str,
        context: &str,
        system_prompt: Option<&str>,
        model: &str,
        timeout: Duration,
        session_id: Option<&str>,
        workdir: Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        let mut last_error: Option<String> = None;
        let mut timed_out = false;

        for name in chain {
            let provider = match self.providers.get(name) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(provider = %name, error = %e, "provider missing from registry");
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            let breaker = self.circuits.get(name);
            if breaker.try_acquire() == Admission::Rejected {
                debug!(provider = %name, "circuit open, skipping provider");
                continue;
            }

            let request_prompt = if provider.has_native_session() || context.is_empty() {
                prompt.to_string()
            } else {
                SessionService::wrap_with_context(context, prompt)
            };
            let request = ProviderRequest {
                prompt: request_prompt,
                system_prompt: system_prompt.map(str::to_string),
                model: model.to_string(),
                timeout,
                session_id: provider
                    .has_native_session()
                    .then(|| session_id.map(str::to_string))
                    .flatten(),
                workdir: workdir.clone(),
            };

            let timer = Timer::start();
            let outcome = provider.execute(request, cancel.child_token()).await;
            metrics::labeled_histogram("provider_latency_seconds")
                .observe(&[("provider", name)], timer.elapsed_secs());

            match outcome {
                Ok(response) => {
                    breaker.record_success();
                    metrics::labeled_counter("provider_requests_total")
                        .inc(&[("provider", name), ("status", "success")]);
                    return ChainOutcome::Served {
                        provider: name.clone(),
                        response,
                    };
                }
                Err(e) if e.is_cancelled() => {
                    breaker.record_cancelled();
                    metrics::labeled_counter("provider_requests_total")
                        .inc(&[("provider", name), ("status", "cancelled")]);
                    return ChainOutcome::Cancelled;
                }
                Err(e) => {
                    breaker.record_failure();
                    metrics::labeled_counter("provider_requests_total")
                        .inc(&[("provider", name), ("status", "error")]);
                    warn!(provider = %name, error = %e, "provider failed, trying next in chain");
                    timed_out = matches!(e, tetora_llm::Error::Timeout(_));
                    last_error = Some(Error::Provider(e).to_string());
                }
            }
        }

        ChainOutcome::Exhausted {
            message: last_error
                .unwrap_or_else(|| "no provider available (all circuits open)".to_string()),
            timed_out,
        }
    }

    /// Append the user and assistant turns for one successful dispatch.
    async fn append_session_turns(
        &self,
        session_id: &str,
        task: &Task,
        prompt: &str,
        result: &TaskResult,
    ) {
        let mut user = NewMessage::user(prompt);
        user.task_id = task.id.clone();
        if let Err(e) = self.sessions.append(session_id, user).await {
            warn!(session_id = %session_id, error = %e, "user turn append failed");
            return;
        }

        let mut assistant = NewMessage::assistant(&result.output);
        assistant.cost_usd = result.cost_usd;
        assistant.tokens_in = result.tokens_in as i64;
        assistant.tokens_out = result.tokens_out as i64;
        assistant.model = result.model.clone();
        assistant.task_id = task.id.clone();
        if let Err(e) = self.sessions.append(session_id, assistant).await {
            warn!(session_id = %session_id, error = %e, "assistant turn append failed");
        }

        if let Ok(active) = self.sessions.count_active(&task.agent).await {
            metrics::labeled_gauge("session_active").set(&[("role", &task.agent)], active);
        }
    }

    /// Fold the oldest turns into a summary once the session is over
    /// threshold. Failures are logged and never fatal; the pass is
    /// idempotent.
    async fn maybe_compact(&self, session_id: &str, chain: &[String], cancel: &CancellationToken) {
        match self.sessions.needs_compaction(session_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "compaction check failed");
                return;
            }
        }
        let candidates = match self.sessions.compaction_candidates(session_id).await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => return,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "compaction candidates failed");
                return;
            }
        };

        let mut transcript = String::new();
        for message in &candidates {
            transcript.push_str(&format!("[{}] {}\n", message.role, message.content));
        }
        let prompt = format!(
            "Summarize the following conversation into a short paragraph. \
             Keep concrete facts, names, numbers, and decisions.\n\n{transcript}"
        );
        let model = self
            .config
            .sessions
            .compact_model
            .clone()
            .unwrap_or_default();

        let outcome = self
            .execute_chain(
                chain,
                &prompt,
                "",
                None,
                &model,
                Duration::from_secs(COMPACT_TIMEOUT_SECS),
                None,
                None,
                cancel,
            )
            .await;

        if let ChainOutcome::Served { response, .. } = outcome {
            if let Err(e) = self
                .sessions
                .apply_compaction(session_id, &response.output)
                .await
            {
                warn!(session_id = %session_id, error = %e, "compaction apply failed");
            }
        }
    }

    /// Write the full output to a file when it exceeds the summary cap
    fn persist_full_output(&self, task_id: &str, output: &str) -> Option<PathBuf> {
        let output_dir = self.config.storage.output_dir.as_ref()?;
        if output.chars().count() <= 1000 {
            return None;
        }
        let path = output_dir.join(format!("{task_id}.txt"));
        if let Err(e) = std::fs::create_dir_all(output_dir) {
            warn!(error = %e, "output dir creation failed");
            return None;
        }
        match std::fs::write(&path, output) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "full output write failed");
                None
            }
        }
    }

    /// Emit dispatch-level metrics and the audit entry
    fn observe(&self, task: &Task, result: &TaskResult, elapsed_secs: f64) {
        metrics::labeled_counter("dispatch_total")
            .inc(&[("role", &task.agent), ("status", result.status.as_str())]);
        metrics::labeled_histogram("dispatch_duration_seconds")
            .observe(&[("role", &task.agent)], elapsed_secs);
        if result.cost_usd > 0.0 {
            metrics::labeled_float_counter("cost_usd").add(&[("role", &task.agent)], result.cost_usd);
        }
        for (provider, state) in self.circuits.states() {
            metrics::labeled_gauge("circuit_state")
                .set(&[("provider", &provider)], state.as_gauge());
        }

        self.audit.record(&AuditEntry {
            timestamp: Utc::now(),
            task_id: task.id.clone(),
            agent: task.agent.clone(),
            source: task.source.clone(),
            status: result.status.as_str().to_string(),
            cost_usd: result.cost_usd,
            duration_ms: (elapsed_secs * 1000.0) as u64,
            model: (!result.model.is_empty()).then(|| result.model.clone()),
        });
    }
}

#[cfg(test)]
mod tests;
