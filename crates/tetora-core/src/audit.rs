//! Structured audit log
//!
//! Append-only JSONL record of every dispatch outcome. Write failures are
//! logged and never fail the dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the dispatch finished
    pub timestamp: DateTime<Utc>,
    /// Task id
    pub task_id: String,
    /// Agent persona
    pub agent: String,
    /// Ingress tag
    pub source: String,
    /// Terminal status
    pub status: String,
    /// Cost in USD
    pub cost_usd: f64,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Model that served the call, when one was reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Append-only JSONL audit sink
pub struct AuditLog {
    path: Option<PathBuf>,
    file: Mutex<Option<std::fs::File>>,
}

impl AuditLog {
    /// An audit log writing to the given file (created on first write)
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            file: Mutex::new(None),
        }
    }

    /// A disabled audit log that drops every entry
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    /// Append one entry; errors are logged, never propagated.
    pub fn record(&self, entry: &AuditEntry) {
        let Some(path) = &self.path else { return };

        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if file.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(opened) => *file = Some(opened),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to open audit log");
                    return;
                }
            }
        }

        if let Some(file) = file.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "failed to write audit entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task_id: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            task_id: task_id.to_string(),
            agent: "helper".to_string(),
            source: "test".to_string(),
            status: "success".to_string(),
            cost_usd: 0.01,
            duration_ms: 120,
            model: Some("mock-model".to_string()),
        }
    }

    #[test]
    fn test_record_appends_jsonl() {
        let dir = std::env::temp_dir().join(format!("tetora-audit-{}", uuid::Uuid::new_v4()));
        let path = dir.join("audit.jsonl");
        let log = AuditLog::new(path.clone());

        log.record(&entry("t1"));
        log.record(&entry("t2"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.task_id, "t1");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_disabled_log_is_silent() {
        let log = AuditLog::disabled();
        log.record(&entry("t1"));
    }
}
