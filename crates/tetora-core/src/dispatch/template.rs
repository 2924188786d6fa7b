//! Prompt template expansion
//!
//! Supported variables:
//! - `{{last_output}}` - the agent's latest successful output from history
//! - `{{knowledge_dir}}` - the configured knowledge directory
//! - `{{memory.<key>}}` - a value from the memory store
//!
//! Unknown variables are left untouched so downstream tooling can carry its
//! own placeholders through.

use crate::error::Result;
use crate::store::Store;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").expect("VARIABLE is a compile-time constant")
});

/// Expand template variables in a prompt.
///
/// # Errors
/// Returns an error when a store lookup fails.
pub async fn expand(
    prompt: &str,
    store: &Store,
    agent: &str,
    knowledge_dir: Option<&Path>,
) -> Result<String> {
    if !prompt.contains("{{") {
        return Ok(prompt.to_string());
    }

    let mut expanded = String::with_capacity(prompt.len());
    let mut cursor = 0;

    for capture in VARIABLE.captures_iter(prompt) {
        let whole = capture.get(0).expect("capture 0 always present");
        let name = &capture[1];

        expanded.push_str(&prompt[cursor..whole.start()]);
        cursor = whole.end();

        let replacement = match name {
            "last_output" => store.last_output(agent).await?.unwrap_or_default(),
            "knowledge_dir" => knowledge_dir
                .map(|dir| dir.display().to_string())
                .unwrap_or_default(),
            other => match other.strip_prefix("memory.") {
                Some(key) => store.memory_get(key).await?.unwrap_or_default(),
                None => whole.as_str().to_string(),
            },
        };
        expanded.push_str(&replacement);
    }
    expanded.push_str(&prompt[cursor..]);
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobRun;
    use chrono::Utc;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_expand_memory_and_knowledge() {
        let store = Store::open_in_memory().await.unwrap();
        store.memory_set("city", "Kyoto").await.unwrap();

        let expanded = expand(
            "Weather in {{memory.city}}, docs at {{knowledge_dir}}",
            &store,
            "helper",
            Some(&PathBuf::from("/srv/knowledge")),
        )
        .await
        .unwrap();
        assert_eq!(expanded, "Weather in Kyoto, docs at /srv/knowledge");
    }

    #[tokio::test]
    async fn test_expand_last_output() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store
            .record_run(&JobRun {
                id: "t1".to_string(),
                job_id: String::new(),
                name: String::new(),
                source: "test".to_string(),
                started_at: now,
                finished_at: now,
                status: "success".to_string(),
                exit_code: 0,
                cost_usd: 0.0,
                output_summary: "the answer is 42".to_string(),
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

        let expanded = expand("Continue from: {{last_output}}", &store, "helper", None)
            .await
            .unwrap();
        assert_eq!(expanded, "Continue from: the answer is 42");
    }

    #[tokio::test]
    async fn test_unknown_variable_left_untouched() {
        let store = Store::open_in_memory().await.unwrap();
        let expanded = expand("keep {{mystery_var}} intact", &store, "helper", None)
            .await
            .unwrap();
        assert_eq!(expanded, "keep {{mystery_var}} intact");
    }

    #[tokio::test]
    async fn test_missing_memory_yields_empty() {
        let store = Store::open_in_memory().await.unwrap();
        let expanded = expand("value: {{memory.absent}}", &store, "helper", None)
            .await
            .unwrap();
        assert_eq!(expanded, "value: ");
    }
}
