//! Conversation sessions
//!
//! One active session per channel key; append-only message log with running
//! totals kept in step inside a transaction. Appends on the same session are
//! serialized through a per-session lock so context reads see a consistent
//! tail.

use super::Store;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// A persistent conversation scope
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Session id
    pub id: String,
    /// Agent persona bound to the conversation
    pub agent: String,
    /// Ingress tag
    pub source: String,
    /// `active` or `archived`
    pub status: String,
    /// `<source>:<identifier>` naming the conversation stream
    pub channel_key: String,
    /// Display title
    pub title: String,
    /// Running cost total in USD
    pub total_cost: f64,
    /// Running input token total
    pub total_tokens_in: i64,
    /// Running output token total
    pub total_tokens_out: i64,
    /// Message count
    pub message_count: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last append time
    pub updated_at: DateTime<Utc>,
}

/// One appended turn
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionMessage {
    /// Owning session
    pub session_id: String,
    /// `user`, `assistant`, or `system`
    pub role: String,
    /// Message text
    pub content: String,
    /// Cost attributed to this turn
    pub cost_usd: f64,
    /// Input tokens for this turn
    pub tokens_in: i64,
    /// Output tokens for this turn
    pub tokens_out: i64,
    /// Model that produced the turn (assistant turns)
    pub model: String,
    /// Task that produced the turn
    pub task_id: String,
    /// Insert time
    pub created_at: DateTime<Utc>,
}

/// Message fields supplied by the caller on append
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    /// `user`, `assistant`, or `system`
    pub role: String,
    /// Message text
    pub content: String,
    /// Cost attributed to this turn
    pub cost_usd: f64,
    /// Input tokens
    pub tokens_in: i64,
    /// Output tokens
    pub tokens_out: i64,
    /// Model name
    pub model: String,
    /// Task id
    pub task_id: String,
}

impl NewMessage {
    /// A user turn
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            ..Default::default()
        }
    }

    /// An assistant turn
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            ..Default::default()
        }
    }

    /// A system turn (compaction summaries)
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Session operations over the store
#[derive(Clone)]
pub struct SessionService {
    store: Store,
    config: SessionConfig,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionService {
    /// Create the service
    #[must_use]
    pub fn new(store: Store, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Session behavior settings
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return the active session for a channel key, creating one if none.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn get_or_create(
        &self,
        source: &str,
        channel_key: &str,
        agent: &str,
    ) -> Result<Session> {
        if let Some(session) = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE channel_key = ? AND status = 'active' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(channel_key)
        .fetch_optional(self.store.pool())
        .await?
        {
            return Ok(session);
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            source: source.to_string(),
            status: "active".to_string(),
            channel_key: channel_key.to_string(),
            title: String::new(),
            total_cost: 0.0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            message_count: 0,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, agent, source, status, channel_key, title, total_cost,
                 total_tokens_in, total_tokens_out, message_count, created_at, updated_at)
            VALUES (?, ?, ?, 'active', ?, '', 0, 0, 0, 0, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.agent)
        .bind(&session.source)
        .bind(&session.channel_key)
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        info!(session_id = %session.id, channel_key = %channel_key, "session created");
        Ok(session)
    }

    /// Fetch one session by id
    ///
    /// # Errors
    /// Returns `NotFound` when the id is unknown.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))
    }

    /// Resolve a session by id prefix.
    ///
    /// # Errors
    /// Returns `AmbiguousSession` when two or more sessions share the
    /// prefix, so callers can present disambiguation.
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Session> {
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        let mut matches = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE id LIKE ? ORDER BY created_at DESC LIMIT 10",
        )
        .bind(&pattern)
        .fetch_all(self.store.pool())
        .await?;

        match matches.len() {
            0 => Err(Error::NotFound(format!("session '{prefix}'"))),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::AmbiguousSession {
                prefix: prefix.to_string(),
                matches: matches.into_iter().map(|s| s.id).collect(),
            }),
        }
    }

    /// Active sessions, newest first
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn list_active(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE status = 'active' ORDER BY updated_at DESC",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(sessions)
    }

    /// Number of active sessions bound to one agent
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn count_active(&self, agent: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE agent = ? AND status = 'active'",
        )
        .bind(agent)
        .fetch_one(self.store.pool())
        .await?;
        Ok(row.0)
    }

    /// Append one message and update running totals atomically.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn append(&self, session_id: &str, message: NewMessage) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO session_messages
                (session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(message.cost_usd)
        .bind(message.tokens_in)
        .bind(message.tokens_out)
        .bind(&message.model)
        .bind(&message.task_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE sessions SET
                total_cost = total_cost + ?,
                total_tokens_in = total_tokens_in + ?,
                total_tokens_out = total_tokens_out + ?,
                message_count = message_count + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(message.cost_usd)
        .bind(message.tokens_in)
        .bind(message.tokens_out)
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(session_id = %session_id, role = %message.role, "message appended");
        Ok(())
    }

    /// Messages of one session, chronologically ascending
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let messages = sqlx::query_as::<_, SessionMessage>(
            "SELECT session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, created_at
             FROM session_messages WHERE session_id = ? ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(messages)
    }

    /// Render the last `max_messages` turns as `[role] content` lines,
    /// chronologically ascending.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn build_context(&self, session_id: &str, max_messages: u32) -> Result<String> {
        let mut recent = sqlx::query_as::<_, SessionMessage>(
            "SELECT session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, created_at
             FROM session_messages WHERE session_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(max_messages)
        .fetch_all(self.store.pool())
        .await?;
        recent.reverse();

        let mut context = String::new();
        for message in recent {
            context.push_str(&format!("[{}] {}\n", message.role, message.content));
        }
        Ok(context)
    }

    /// Prefix a prompt with conversation history when there is any
    #[must_use]
    pub fn wrap_with_context(context: &str, prompt: &str) -> String {
        if context.is_empty() {
            return prompt.to_string();
        }
        format!("[Conversation history]\n{context}\n[Current message]\n{prompt}")
    }

    /// Whether the session is due for compaction
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn needs_compaction(&self, session_id: &str) -> Result<bool> {
        let session = self.get(session_id).await?;
        Ok(session.message_count > i64::from(self.config.compact_after))
    }

    /// Oldest messages that a compaction pass would fold away
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn compaction_candidates(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let session = self.get(session_id).await?;
        let fold = session.message_count - i64::from(self.config.compact_keep);
        if fold <= 0 {
            return Ok(Vec::new());
        }
        let messages = sqlx::query_as::<_, SessionMessage>(
            "SELECT session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, created_at
             FROM session_messages WHERE session_id = ? ORDER BY created_at, id LIMIT ?",
        )
        .bind(session_id)
        .bind(fold)
        .fetch_all(self.store.pool())
        .await?;
        Ok(messages)
    }

    /// Replace the oldest messages with one system summary.
    ///
    /// Cost and token totals are untouched (that spend happened); the
    /// message count is recomputed from what remains. Idempotent: a second
    /// call on a compacted session folds nothing.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn apply_compaction(&self, session_id: &str, summary: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = self.get(session_id).await?;
        let fold = session.message_count - i64::from(self.config.compact_keep);
        if fold <= 0 {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            r#"
            DELETE FROM session_messages WHERE id IN (
                SELECT id FROM session_messages
                WHERE session_id = ? ORDER BY created_at, id LIMIT ?
            )
            "#,
        )
        .bind(session_id)
        .bind(fold)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO session_messages
                (session_id, role, content, cost_usd, tokens_in, tokens_out, model, task_id, created_at)
            VALUES (?, 'system', ?, 0, 0, 0, '', '', ?)
            "#,
        )
        .bind(session_id)
        .bind(summary)
        .bind(session.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE sessions SET
                message_count = (SELECT COUNT(*) FROM session_messages WHERE session_id = ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(session_id)
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(session_id = %session_id, folded = fold, "session compacted");
        Ok(())
    }

    /// Archive the active session for a channel key; the next message
    /// creates a fresh one.
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn archive(&self, channel_key: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'archived', updated_at = ? WHERE channel_key = ? AND status = 'active'",
        )
        .bind(Utc::now())
        .bind(channel_key)
        .execute(self.store.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
