//! Workflow DAG execution
//!
//! A workflow is a declared DAG of steps executed through the dispatcher.
//! Step kinds: `dispatch` (one agent call), `skill` (external command),
//! `condition` (expression over prior outputs), `parallel` (concurrent
//! sub-steps). `depends_on` yields a topological order;
//! `{{step_id.output}}` references bind after each step completes.

use crate::dispatch::{Dispatcher, Task, TaskStatus};
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static STEP_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([a-zA-Z0-9_-]+)\.output\s*\}\}")
        .expect("STEP_REF is a compile-time constant")
});

/// Timeout for skill commands
const SKILL_TIMEOUT_SECS: u64 = 300;

/// A declared workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Workflow id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Steps in declaration order
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

/// One step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step id, referenced by `depends_on` and `{{id.output}}`
    pub id: String,
    /// What the step does
    #[serde(flatten)]
    pub kind: StepKind,
    /// Steps that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Expression gating the step; false skips it
    #[serde(default)]
    pub when: Option<String>,
}

/// Step variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke one agent with a rendered prompt
    Dispatch {
        /// Agent persona
        agent: String,
        /// Prompt with optional `{{step.output}}` references
        prompt: String,
        /// Model override
        #[serde(default)]
        model: Option<String>,
    },
    /// Invoke an external command
    Skill {
        /// Binary to run
        command: String,
        /// Arguments, interpolated like prompts
        #[serde(default)]
        args: Vec<String>,
    },
    /// Evaluate an expression over preceding outputs; output is
    /// `"true"` or `"false"`
    Condition {
        /// The expression
        expr: String,
    },
    /// Fan out sub-steps concurrently (sub-steps may not nest another
    /// parallel block)
    Parallel {
        /// The concurrent sub-steps
        steps: Vec<StepDef>,
    },
}

impl WorkflowDef {
    /// Topological execution order over `depends_on`.
    ///
    /// # Errors
    /// Returns `Error::Workflow` on duplicate ids, unknown dependencies,
    /// cycles, or a parallel block nested inside another.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        let mut index_of = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index_of.insert(step.id.as_str(), i).is_some() {
                return Err(Error::Workflow(format!("duplicate step id '{}'", step.id)));
            }
            if let StepKind::Parallel { steps } = &step.kind {
                for sub in steps {
                    if matches!(sub.kind, StepKind::Parallel { .. }) {
                        return Err(Error::Workflow(format!(
                            "step '{}': parallel blocks cannot nest",
                            step.id
                        )));
                    }
                }
            }
        }

        let mut indegree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let Some(&j) = index_of.get(dep.as_str()) else {
                    return Err(Error::Workflow(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.id
                    )));
                };
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..self.steps.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err(Error::Workflow(format!(
                "workflow '{}' contains a dependency cycle",
                self.id
            )));
        }
        Ok(order)
    }
}

/// How a workflow run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    /// Call providers and record history
    Live,
    /// Estimate per-step cost from history averages without provider calls
    DryRun,
    /// Call providers but record nothing to history
    Shadow,
}

/// The outcome of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step id
    pub id: String,
    /// Terminal status
    pub status: TaskStatus,
    /// Step output (bound to `{{id.output}}`)
    pub output: String,
    /// Error text on failure
    pub error: String,
    /// Cost in USD (estimated in dry-run mode)
    pub cost_usd: f64,
}

/// The outcome of one workflow run
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRunResult {
    /// Workflow id
    pub workflow_id: String,
    /// True when no step errored
    pub success: bool,
    /// Per-step outcomes in execution order
    pub steps: Vec<StepResult>,
    /// Accumulated cost of the run
    pub total_cost_usd: f64,
}

/// Executes workflow DAGs through the dispatcher
pub struct WorkflowEngine {
    dispatcher: Arc<Dispatcher>,
}

impl WorkflowEngine {
    /// Create an engine
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Execute one workflow to completion.
    ///
    /// # Errors
    /// Returns an error when the DAG itself is invalid; individual step
    /// failures land in the step results.
    pub async fn run(
        &self,
        def: &WorkflowDef,
        mode: WorkflowMode,
        cancel: CancellationToken,
    ) -> Result<WorkflowRunResult> {
        let order = def.execution_order()?;
        info!(workflow = %def.id, steps = order.len(), mode = ?mode, "workflow started");

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results = Vec::with_capacity(order.len());
        let mut total_cost = 0.0;

        for index in order {
            let step = &def.steps[index];

            let blocked = step.depends_on.iter().any(|dep| failed.contains(dep));
            let gated = match &step.when {
                Some(expr) => !evaluate_condition(&interpolate(expr, &outputs)),
                None => false,
            };
            if blocked || gated {
                debug!(workflow = %def.id, step = %step.id, blocked, "step skipped");
                outputs.insert(step.id.clone(), String::new());
                // a skipped step blocks its dependents too
                if blocked {
                    failed.insert(step.id.clone());
                }
                results.push(StepResult {
                    id: step.id.clone(),
                    status: TaskStatus::Skipped,
                    output: String::new(),
                    error: if blocked {
                        "dependency failed".to_string()
                    } else {
                        String::new()
                    },
                    cost_usd: 0.0,
                });
                continue;
            }

            let result = self
                .run_step(def, step, &outputs, total_cost, mode, &cancel)
                .await;
            total_cost += result.cost_usd;
            outputs.insert(step.id.clone(), result.output.clone());
            if result.status == TaskStatus::Error || result.status == TaskStatus::Timeout {
                failed.insert(step.id.clone());
            }
            results.push(result);
        }

        let success = !results
            .iter()
            .any(|r| matches!(r.status, TaskStatus::Error | TaskStatus::Timeout));
        info!(workflow = %def.id, success, total_cost_usd = total_cost, "workflow finished");
        Ok(WorkflowRunResult {
            workflow_id: def.id.clone(),
            success,
            steps: results,
            total_cost_usd: total_cost,
        })
    }

    async fn run_step(
        &self,
        def: &WorkflowDef,
        step: &StepDef,
        outputs: &HashMap<String, String>,
        run_cost: f64,
        mode: WorkflowMode,
        cancel: &CancellationToken,
    ) -> StepResult {
        match &step.kind {
            StepKind::Parallel { steps } => {
                let branches = steps
                    .iter()
                    .map(|sub| self.run_leaf(def, sub, outputs, run_cost, mode, cancel));
                let branch_results = futures::future::join_all(branches).await;

                let mut output = String::new();
                let mut error = String::new();
                let mut cost = 0.0;
                let mut status = TaskStatus::Success;
                for branch in &branch_results {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&branch.output);
                    cost += branch.cost_usd;
                    if matches!(branch.status, TaskStatus::Error | TaskStatus::Timeout) {
                        status = TaskStatus::Error;
                        error = branch.error.clone();
                    }
                }
                StepResult {
                    id: step.id.clone(),
                    status,
                    output,
                    error,
                    cost_usd: cost,
                }
            }
            _ => self.run_leaf(def, step, outputs, run_cost, mode, cancel).await,
        }
    }

    /// Execute a non-parallel step
    async fn run_leaf(
        &self,
        def: &WorkflowDef,
        step: &StepDef,
        outputs: &HashMap<String, String>,
        run_cost: f64,
        mode: WorkflowMode,
        cancel: &CancellationToken,
    ) -> StepResult {
        match &step.kind {
            StepKind::Dispatch {
                agent,
                prompt,
                model,
            } => {
                self.run_dispatch(
                    def,
                    &step.id,
                    agent,
                    prompt,
                    model.clone(),
                    outputs,
                    run_cost,
                    mode,
                    cancel,
                )
                .await
            }
            StepKind::Skill { command, args } => {
                if mode == WorkflowMode::DryRun {
                    return StepResult {
                        id: step.id.clone(),
                        status: TaskStatus::Success,
                        output: String::new(),
                        error: String::new(),
                        cost_usd: 0.0,
                    };
                }
                run_skill(&step.id, command, args, outputs).await
            }
            StepKind::Condition { expr } => {
                let value = evaluate_condition(&interpolate(expr, outputs));
                StepResult {
                    id: step.id.clone(),
                    status: TaskStatus::Success,
                    output: value.to_string(),
                    error: String::new(),
                    cost_usd: 0.0,
                }
            }
            // parallel nesting is rejected by execution_order
            StepKind::Parallel { .. } => StepResult {
                id: step.id.clone(),
                status: TaskStatus::Error,
                output: String::new(),
                error: "parallel blocks cannot nest".to_string(),
                cost_usd: 0.0,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_dispatch(
        &self,
        def: &WorkflowDef,
        step_id: &str,
        agent: &str,
        prompt: &str,
        model: Option<String>,
        outputs: &HashMap<String, String>,
        run_cost: f64,
        mode: WorkflowMode,
        cancel: &CancellationToken,
    ) -> StepResult {
        if mode == WorkflowMode::DryRun {
            let estimate = self
                .dispatcher
                .store()
                .average_cost(agent)
                .await
                .unwrap_or(0.0);
            return StepResult {
                id: step_id.to_string(),
                status: TaskStatus::Success,
                output: String::new(),
                error: String::new(),
                cost_usd: estimate,
            };
        }

        let mut task = Task::new(agent, interpolate(prompt, outputs))
            .with_source("workflow")
            .with_job_id(format!("{}:{}", def.id, step_id));
        task.name = format!("{} / {}", def.name, step_id);
        task.model = model;
        task.workflow_run_cost = Some(run_cost);
        task.record = mode != WorkflowMode::Shadow;

        let result = self.dispatcher.dispatch(task, cancel.child_token()).await;
        StepResult {
            id: step_id.to_string(),
            status: result.status,
            output: result.output,
            error: result.error,
            cost_usd: result.cost_usd,
        }
    }
}

/// Bind `{{step_id.output}}` references from completed steps
#[must_use]
pub fn interpolate(text: &str, outputs: &HashMap<String, String>) -> String {
    STEP_REF
        .replace_all(text, |caps: &regex::Captures<'_>| {
            outputs.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Evaluate a condition expression after interpolation.
///
/// Supported forms: `a == b`, `a != b`, `a contains b`, and bare
/// truthiness (non-empty, not `"false"`, not `"0"`). Operands may be
/// single-quoted literals.
#[must_use]
pub fn evaluate_condition(expr: &str) -> bool {
    fn operand(raw: &str) -> String {
        raw.trim().trim_matches('\'').to_string()
    }

    let expr = expr.trim();
    if let Some((lhs, rhs)) = expr.split_once("==") {
        return operand(lhs) == operand(rhs);
    }
    if let Some((lhs, rhs)) = expr.split_once("!=") {
        return operand(lhs) != operand(rhs);
    }
    if let Some((lhs, rhs)) = expr.split_once(" contains ") {
        return operand(lhs).contains(&operand(rhs));
    }
    let value = operand(expr);
    !value.is_empty() && value != "false" && value != "0"
}

async fn run_skill(
    step_id: &str,
    command: &str,
    args: &[String],
    outputs: &HashMap<String, String>,
) -> StepResult {
    let args: Vec<String> = args.iter().map(|arg| interpolate(arg, outputs)).collect();
    debug!(step = %step_id, command = %command, "running skill");

    let mut cmd = tokio::process::Command::new(command);
    cmd.args(&args).kill_on_drop(true);

    let outcome = tokio::time::timeout(Duration::from_secs(SKILL_TIMEOUT_SECS), cmd.output()).await;
    match outcome {
        Err(_) => StepResult {
            id: step_id.to_string(),
            status: TaskStatus::Timeout,
            output: String::new(),
            error: format!("skill '{command}' timed out"),
            cost_usd: 0.0,
        },
        Ok(Err(e)) => StepResult {
            id: step_id.to_string(),
            status: TaskStatus::Error,
            output: String::new(),
            error: format!("skill '{command}' failed to start: {e}"),
            cost_usd: 0.0,
        },
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if output.status.success() {
                StepResult {
                    id: step_id.to_string(),
                    status: TaskStatus::Success,
                    output: stdout,
                    error: String::new(),
                    cost_usd: 0.0,
                }
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(step = %step_id, command = %command, "skill exited non-zero");
                StepResult {
                    id: step_id.to_string(),
                    status: TaskStatus::Error,
                    output: stdout,
                    error: stderr,
                    cost_usd: 0.0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
