use super::*;
use crate::audit::AuditLog;
use crate::config::TetoraConfig;
use crate::store::{RunFilter, Store};
use crate::AdmissionController;
use tetora_llm::{MockProvider, ProviderRegistry};

const CONFIG: &str = r#"
    [[providers]]
    kind = "cli"
    name = "echo"
    command = "true"

    [agents.writer]
    system_prompt = "Write."
    provider = "echo"

    [agents.reviewer]
    system_prompt = "Review."
    provider = "echo"
"#;

async fn engine_with(mock: MockProvider) -> (WorkflowEngine, Arc<Dispatcher>, Arc<MockProvider>) {
    let config = Arc::new(TetoraConfig::from_toml(CONFIG).unwrap());
    let store = Store::open_in_memory().await.unwrap();
    let mock = Arc::new(mock);
    let providers = Arc::new(ProviderRegistry::new());
    providers.register(mock.clone());
    let admission = Arc::new(AdmissionController::new(config.concurrency.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        store,
        providers,
        admission,
        AuditLog::disabled(),
    ));
    (WorkflowEngine::new(dispatcher.clone()), dispatcher, mock)
}

fn dispatch_step(id: &str, agent: &str, prompt: &str, depends_on: &[&str]) -> StepDef {
    StepDef {
        id: id.to_string(),
        kind: StepKind::Dispatch {
            agent: agent.to_string(),
            prompt: prompt.to_string(),
            model: None,
        },
        depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
        when: None,
    }
}

fn workflow(id: &str, steps: Vec<StepDef>) -> WorkflowDef {
    WorkflowDef {
        id: id.to_string(),
        name: format!("workflow {id}"),
        steps,
    }
}

#[test]
fn test_topological_order() {
    let def = workflow(
        "w",
        vec![
            dispatch_step("c", "writer", "c", &["b"]),
            dispatch_step("a", "writer", "a", &[]),
            dispatch_step("b", "writer", "b", &["a"]),
        ],
    );
    let order = def.execution_order().unwrap();
    let ids: Vec<&str> = order.iter().map(|&i| def.steps[i].id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn test_cycle_and_unknown_dep_rejected() {
    let cyclic = workflow(
        "w",
        vec![
            dispatch_step("a", "writer", "a", &["b"]),
            dispatch_step("b", "writer", "b", &["a"]),
        ],
    );
    assert!(cyclic.execution_order().is_err());

    let dangling = workflow("w", vec![dispatch_step("a", "writer", "a", &["ghost"])]);
    assert!(dangling.execution_order().is_err());

    let duplicate = workflow(
        "w",
        vec![
            dispatch_step("a", "writer", "a", &[]),
            dispatch_step("a", "writer", "again", &[]),
        ],
    );
    assert!(duplicate.execution_order().is_err());
}

#[test]
fn test_nested_parallel_rejected() {
    let def = workflow(
        "w",
        vec![StepDef {
            id: "outer".to_string(),
            kind: StepKind::Parallel {
                steps: vec![StepDef {
                    id: "inner".to_string(),
                    kind: StepKind::Parallel { steps: vec![] },
                    depends_on: vec![],
                    when: None,
                }],
            },
            depends_on: vec![],
            when: None,
        }],
    );
    assert!(def.execution_order().is_err());
}

#[test]
fn test_interpolate_and_conditions() {
    let mut outputs = HashMap::new();
    outputs.insert("draft".to_string(), "hello world".to_string());

    assert_eq!(
        interpolate("Review this: {{draft.output}}", &outputs),
        "Review this: hello world"
    );
    assert_eq!(interpolate("{{missing.output}}", &outputs), "");

    assert!(evaluate_condition("'a' == 'a'"));
    assert!(evaluate_condition("'a' != 'b'"));
    assert!(evaluate_condition("'hello world' contains 'world'"));
    assert!(!evaluate_condition("'hello' contains 'world'"));
    assert!(evaluate_condition("nonempty"));
    assert!(!evaluate_condition(""));
    assert!(!evaluate_condition("false"));
    assert!(!evaluate_condition("0"));
}

#[tokio::test]
async fn test_sequential_run_binds_outputs() {
    let (engine, dispatcher, mock) = engine_with(MockProvider::new("echo")).await;
    let def = workflow(
        "draft-review",
        vec![
            dispatch_step("draft", "writer", "write a haiku", &[]),
            dispatch_step("review", "reviewer", "review: {{draft.output}}", &["draft"]),
        ],
    );

    let result = engine
        .run(&def, WorkflowMode::Live, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.steps.len(), 2);

    // the echo mock returned the first prompt, which was bound into the second
    let prompts = mock.prompts();
    assert_eq!(prompts[1], "review: write a haiku");

    // both steps were recorded with workflow-scoped job ids
    let runs = dispatcher
        .store()
        .list_runs(&RunFilter::default())
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().any(|r| r.job_id == "draft-review:draft"));
    assert!(runs.iter().any(|r| r.job_id == "draft-review:review"));
}

#[tokio::test]
async fn test_condition_gates_dependent_step() {
    let (engine, _dispatcher, mock) = engine_with(MockProvider::new("echo")).await;
    let mut gated = dispatch_step("notify", "writer", "send alert", &["check"]);
    gated.when = Some("{{check.output}} == 'true'".to_string());

    let def = workflow(
        "conditional",
        vec![
            dispatch_step("scan", "writer", "scan result: clean", &[]),
            StepDef {
                id: "check".to_string(),
                kind: StepKind::Condition {
                    expr: "{{scan.output}} contains 'danger'".to_string(),
                },
                depends_on: vec!["scan".to_string()],
                when: None,
            },
            gated,
        ],
    );

    let result = engine
        .run(&def, WorkflowMode::Live, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.steps[1].output, "false");
    assert_eq!(result.steps[2].status, TaskStatus::Skipped);
    // only the scan step reached a provider
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_failed_dependency_skips_downstream() {
    let (engine, _dispatcher, _mock) =
        engine_with(MockProvider::new("echo").with_fail_first(usize::MAX)).await;
    let def = workflow(
        "failing",
        vec![
            dispatch_step("first", "writer", "will fail", &[]),
            dispatch_step("second", "writer", "never runs", &["first"]),
        ],
    );

    let result = engine
        .run(&def, WorkflowMode::Live, CancellationToken::new())
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.steps[0].status, TaskStatus::Error);
    assert_eq!(result.steps[1].status, TaskStatus::Skipped);
    assert_eq!(result.steps[1].error, "dependency failed");
}

#[tokio::test]
async fn test_parallel_fan_out() {
    let (engine, _dispatcher, mock) = engine_with(MockProvider::new("echo")).await;
    let def = workflow(
        "fanout",
        vec![StepDef {
            id: "branches".to_string(),
            kind: StepKind::Parallel {
                steps: vec![
                    dispatch_step("left", "writer", "left branch", &[]),
                    dispatch_step("right", "reviewer", "right branch", &[]),
                ],
            },
            depends_on: vec![],
            when: None,
        }],
    );

    let result = engine
        .run(&def, WorkflowMode::Live, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(mock.call_count(), 2);
    assert!(result.steps[0].output.contains("left branch"));
    assert!(result.steps[0].output.contains("right branch"));
}

#[tokio::test]
async fn test_dry_run_estimates_without_provider_calls() {
    let (engine, dispatcher, mock) = engine_with(MockProvider::new("echo")).await;

    // seed history so the estimate has an average to draw from
    let now = chrono::Utc::now();
    dispatcher
        .store()
        .record_run(&crate::store::JobRun {
            id: "seed".to_string(),
            job_id: String::new(),
            name: String::new(),
            source: "test".to_string(),
            started_at: now,
            finished_at: now,
            status: "success".to_string(),
            exit_code: 0,
            cost_usd: 0.30,
            output_summary: String::new(),
            error: String::new(),
            model: String::new(),
            session_id: None,
            output_file: None,
            tokens_in: 0,
            tokens_out: 0,
            agent: "writer".to_string(),
        })
        .await
        .unwrap();

    let def = workflow(
        "estimate",
        vec![dispatch_step("only", "writer", "hi", &[])],
    );
    let result = engine
        .run(&def, WorkflowMode::DryRun, CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(mock.call_count(), 0);
    assert!((result.total_cost_usd - 0.30).abs() < 1e-9);
    // dry runs leave no new history rows
    let runs = dispatcher
        .store()
        .list_runs(&RunFilter::default())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_shadow_mode_calls_providers_but_records_nothing() {
    let (engine, dispatcher, mock) = engine_with(MockProvider::new("echo")).await;
    let def = workflow("shadow", vec![dispatch_step("only", "writer", "hi", &[])]);

    let result = engine
        .run(&def, WorkflowMode::Shadow, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(mock.call_count(), 1);
    assert_eq!(
        dispatcher
            .store()
            .list_runs(&RunFilter::default())
            .await
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn test_skill_step_runs_command() {
    let (engine, _dispatcher, _mock) = engine_with(MockProvider::new("echo")).await;
    let def = workflow(
        "skills",
        vec![StepDef {
            id: "shell".to_string(),
            kind: StepKind::Skill {
                command: "echo".to_string(),
                args: vec!["skill output".to_string()],
            },
            depends_on: vec![],
            when: None,
        }],
    );

    let result = engine
        .run(&def, WorkflowMode::Live, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.steps[0].output, "skill output");
}
