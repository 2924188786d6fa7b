//! Key-value memory
//!
//! Small facts agents can read back through `{{memory.<key>}}` template
//! variables.

use super::Store;
use crate::error::Result;
use chrono::Utc;
use sqlx::Row;

impl Store {
    /// Set a memory value, replacing any previous one
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn memory_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Get a memory value
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn memory_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM memory WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Delete a memory value; returns whether a row existed
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn memory_delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memory WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All memory keys, sorted
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn memory_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM memory ORDER BY key")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.get("key")).collect())
    }
}
