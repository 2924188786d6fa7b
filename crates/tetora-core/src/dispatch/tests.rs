use super::*;
use crate::store::RunFilter;
use std::time::Duration;
use tetora_llm::MockProvider;

const BASE_CONFIG: &str = r#"
    [[providers]]
    kind = "cli"
    name = "primary"
    command = "true"

    [[providers]]
    kind = "cli"
    name = "backup"
    command = "true"

    [agents.helper]
    system_prompt = "You are helpful."
    provider = "primary"
    fallback_providers = ["backup"]
"#;

struct Harness {
    dispatcher: Dispatcher,
    primary: Arc<MockProvider>,
    backup: Arc<MockProvider>,
}

async fn harness(config_toml: &str, primary: MockProvider, backup: MockProvider) -> Harness {
    let config = Arc::new(TetoraConfig::from_toml(config_toml).unwrap());
    let store = Store::open_in_memory().await.unwrap();

    let primary = Arc::new(primary);
    let backup = Arc::new(backup);
    let providers = Arc::new(ProviderRegistry::new());
    providers.register(primary.clone());
    providers.register(backup.clone());

    let admission = Arc::new(AdmissionController::new(config.concurrency.clone()));
    let dispatcher = Dispatcher::new(config, store, providers, admission, AuditLog::disabled());
    Harness {
        dispatcher,
        primary,
        backup,
    }
}

async fn run_count(dispatcher: &Dispatcher) -> usize {
    dispatcher
        .store()
        .list_runs(&RunFilter::default())
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_dispatch_success_records_run() {
    let h = harness(
        BASE_CONFIG,
        MockProvider::new("primary").with_cost(0.01),
        MockProvider::new("backup"),
    )
    .await;

    let task = Task::new("helper", "say hi").with_job_id("job-7");
    let task_id = task.id.clone();
    let result = h
        .dispatcher
        .dispatch(task, CancellationToken::new())
        .await;

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.output, "say hi");
    assert_eq!(h.primary.call_count(), 1);
    assert_eq!(h.backup.call_count(), 0);

    let run = h.dispatcher.store().get_run(&task_id).await.unwrap().unwrap();
    assert_eq!(run.status, "success");
    assert_eq!(run.job_id, "job-7");
    assert_eq!(run.agent, "helper");
    assert!((run.cost_usd - 0.01).abs() < 1e-9);
    assert!(run.started_at <= run.finished_at);
}

#[tokio::test]
async fn test_unknown_agent_is_terminal() {
    let h = harness(
        BASE_CONFIG,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let result = h
        .dispatcher
        .dispatch(Task::new("ghost", "hi"), CancellationToken::new())
        .await;
    assert_eq!(result.status, TaskStatus::Error);
    assert!(result.error.contains("ghost"));
    assert_eq!(run_count(&h.dispatcher).await, 0);
}

#[tokio::test]
async fn test_fallback_after_circuit_opens() {
    let config = format!(
        "{BASE_CONFIG}\n[circuit]\nfail_threshold = 2\nsuccess_threshold = 1\nopen_timeout_secs = 3600\n"
    );
    let h = harness(
        &config,
        MockProvider::new("primary").with_fail_first(usize::MAX),
        MockProvider::new("backup").with_model("backup-model"),
    )
    .await;

    // first two dispatches hit the failing primary, then fall through
    for _ in 0..2 {
        let result = h
            .dispatcher
            .dispatch(Task::new("helper", "hi"), CancellationToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.model, "backup-model");
    }
    assert_eq!(h.primary.call_count(), 2);

    // circuit is open now: the third dispatch goes straight to backup
    let result = h
        .dispatcher
        .dispatch(Task::new("helper", "hi"), CancellationToken::new())
        .await;
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.model, "backup-model");
    assert_eq!(h.primary.call_count(), 2);
    assert_eq!(h.backup.call_count(), 3);
}

#[tokio::test]
async fn test_chain_exhausted_returns_last_error() {
    let h = harness(
        BASE_CONFIG,
        MockProvider::new("primary").with_fail_first(usize::MAX),
        MockProvider::new("backup").with_fail_first(usize::MAX),
    )
    .await;

    let result = h
        .dispatcher
        .dispatch(Task::new("helper", "hi"), CancellationToken::new())
        .await;
    assert_eq!(result.status, TaskStatus::Error);
    assert!(result.error.contains("scripted failure"));
    // failed dispatches that reached the provider step are still recorded
    assert_eq!(run_count(&h.dispatcher).await, 1);
}

#[tokio::test]
async fn test_budget_block_skips_without_provider_call() {
    let config = format!("{BASE_CONFIG}\n[budgets.global]\ndaily = 1.00\n");
    let h = harness(
        &config,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    // seed today's spend over the cap
    let now = chrono::Utc::now();
    h.dispatcher
        .store()
        .record_run(&JobRun {
            id: "seed".to_string(),
            job_id: String::new(),
            name: String::new(),
            source: "test".to_string(),
            started_at: now,
            finished_at: now,
            status: "success".to_string(),
            exit_code: 0,
            cost_usd: 1.01,
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

    let result = h
        .dispatcher
        .dispatch(Task::new("helper", "hi"), CancellationToken::new())
        .await;

    assert_eq!(result.status, TaskStatus::Skipped);
    assert!(result.error.contains("daily budget exceeded"));
    assert_eq!(h.primary.call_count(), 0);
    assert_eq!(run_count(&h.dispatcher).await, 1); // only the seed row
}

#[tokio::test]
async fn test_budget_downgrade_overrides_model() {
    let config = format!(
        "{BASE_CONFIG}\n\
         [budgets.global]\ndaily = 1.00\n\
         [budgets.auto_downgrade]\nenabled = true\n\
         thresholds = [{{ at = 0.5, model = \"cheap-model\" }}]\n"
    );
    let h = harness(
        &config,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let now = chrono::Utc::now();
    h.dispatcher
        .store()
        .record_run(&JobRun {
            id: "seed".to_string(),
            job_id: String::new(),
            name: String::new(),
            source: "test".to_string(),
            started_at: now,
            finished_at: now,
            status: "success".to_string(),
            exit_code: 0,
            cost_usd: 0.6,
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

    let result = h
        .dispatcher
        .dispatch(Task::new("helper", "hi"), CancellationToken::new())
        .await;
    assert_eq!(result.status, TaskStatus::Success);
    // the mock reports the requested model back
    assert_eq!(result.model, "cheap-model");
}

#[tokio::test]
async fn test_session_continuity_wraps_prompt() {
    let h = harness(
        BASE_CONFIG,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let session = h
        .dispatcher
        .sessions()
        .get_or_create("telegram", "telegram:alice", "helper")
        .await
        .unwrap();

    let first = Task::new("helper", "remember the number 42").with_session(&session.id);
    let result = h.dispatcher.dispatch(first, CancellationToken::new()).await;
    assert_eq!(result.status, TaskStatus::Success);

    let second = Task::new("helper", "what number did I ask you to remember?")
        .with_session(&session.id);
    let result = h.dispatcher.dispatch(second, CancellationToken::new()).await;
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.session_id.as_deref(), Some(session.id.as_str()));

    let prompts = h.primary.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].starts_with("[Conversation history]"));
    assert!(prompts[1].contains("remember the number 42"));
    assert!(prompts[1].contains("[Current message]\nwhat number did I ask you to remember?"));

    // totals were kept in step with the appended turns
    let updated = h.dispatcher.sessions().get(&session.id).await.unwrap();
    assert_eq!(updated.message_count, 4);
}

#[tokio::test]
async fn test_depth_cap_rejected() {
    let config = format!("{BASE_CONFIG}\n[concurrency]\nmax_depth = 2\n");
    let h = harness(
        &config,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let mut task = Task::new("helper", "go deeper");
    task.depth = 2;
    let result = h.dispatcher.dispatch(task, CancellationToken::new()).await;
    assert_eq!(result.status, TaskStatus::Error);
    assert!(result.error.contains("max nesting depth"));
    assert_eq!(h.primary.call_count(), 0);
}

#[tokio::test]
async fn test_spawn_child_propagates_depth() {
    let config = format!("{BASE_CONFIG}\n[concurrency]\nmax_depth = 2\n");
    let h = harness(
        &config,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let parent = Task::new("helper", "parent work");
    let child = Task::new("helper", "child work");
    let result = h
        .dispatcher
        .spawn_child(&parent, child, CancellationToken::new())
        .await;
    assert_eq!(result.status, TaskStatus::Success);

    // a grandchild would sit at depth 2 and must be rejected
    let mut mid = Task::new("helper", "mid");
    mid.depth = 1;
    mid.id = "mid-task".to_string();
    let grandchild = Task::new("helper", "too deep");
    let result = h
        .dispatcher
        .spawn_child(&mid, grandchild, CancellationToken::new())
        .await;
    assert_eq!(result.status, TaskStatus::Error);
    assert!(result.error.contains("max nesting depth"));
}

#[tokio::test]
async fn test_parallel_spawn_cap() {
    let config = format!(
        "{BASE_CONFIG}\n[concurrency]\nmax_concurrent = 4\nchild_pool_multiplier = 4\nmax_children_per_task = 3\n"
    );
    let h = harness(
        &config,
        MockProvider::new("primary").with_delay(Duration::from_millis(300)),
        MockProvider::new("backup"),
    )
    .await;
    let dispatcher = Arc::new(h.dispatcher);

    let mut handles = Vec::new();
    for i in 0..5 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let mut task = Task::new("helper", format!("child {i}"));
            task.parent_id = Some("parent-1".to_string());
            task.depth = 1;
            dispatcher.dispatch(task, CancellationToken::new()).await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        match result.status {
            TaskStatus::Success => admitted += 1,
            TaskStatus::Error => {
                assert!(result.error.contains("max children per task exceeded"));
                rejected += 1;
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(rejected, 2);

    // once the first batch finished, the same parent may spawn again
    let mut task = Task::new("helper", "late child");
    task.parent_id = Some("parent-1".to_string());
    task.depth = 1;
    let result = dispatcher.dispatch(task, CancellationToken::new()).await;
    assert_eq!(result.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_cancelled_dispatch_not_counted_by_circuit() {
    let config = format!(
        "{BASE_CONFIG}\n[circuit]\nfail_threshold = 1\nsuccess_threshold = 1\nopen_timeout_secs = 3600\n"
    );
    let h = harness(
        &config,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = h.dispatcher.dispatch(Task::new("helper", "hi"), cancel).await;
    assert_eq!(result.status, TaskStatus::Cancelled);

    // even with fail_threshold = 1 the breaker stayed closed
    assert_eq!(
        h.dispatcher.circuits().get("primary").state(),
        crate::circuit::CircuitState::Closed
    );
    // a fresh dispatch still reaches the primary
    let result = h
        .dispatcher
        .dispatch(Task::new("helper", "hi"), CancellationToken::new())
        .await;
    assert_eq!(result.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_shadow_mode_skips_history() {
    let h = harness(
        BASE_CONFIG,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let mut task = Task::new("helper", "quiet run");
    task.record = false;
    let result = h.dispatcher.dispatch(task, CancellationToken::new()).await;
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(run_count(&h.dispatcher).await, 0);
}

#[tokio::test]
async fn test_compaction_triggered_over_threshold() {
    let config = format!(
        "{BASE_CONFIG}\n[sessions]\ncompact_after = 5\ncompact_keep = 2\ncontext_max_messages = 20\n"
    );
    let h = harness(
        &config,
        MockProvider::new("primary"),
        MockProvider::new("backup"),
    )
    .await;

    let session = h
        .dispatcher
        .sessions()
        .get_or_create("cli", "cli:local", "helper")
        .await
        .unwrap();

    // each successful dispatch appends two turns; three pushes the count to 6
    for i in 0..3 {
        let task = Task::new("helper", format!("message {i}")).with_session(&session.id);
        let result = h.dispatcher.dispatch(task, CancellationToken::new()).await;
        assert_eq!(result.status, TaskStatus::Success);
    }

    let updated = h.dispatcher.sessions().get(&session.id).await.unwrap();
    // folded to one summary plus the kept tail
    assert_eq!(updated.message_count, 3);
    let messages = h.dispatcher.sessions().messages(&session.id).await.unwrap();
    assert_eq!(messages[0].role, "system");
}
