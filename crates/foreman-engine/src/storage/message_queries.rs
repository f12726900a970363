//! Durable message queries.

use foreman_core::db::{DatabaseError, unix_timestamp_ms};

use super::db::Database;
use super::models::MessageRow;

impl Database {
    /// Insert a durable message for a session.
    pub async fn insert_message(
        &self,
        session_key: &str,
        run_id: &str,
        role: &str,
        content: &str,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            r"
            INSERT INTO messages (session_key, run_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(session_key)
        .bind(run_id)
        .bind(role)
        .bind(content)
        .bind(unix_timestamp_ms())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// All messages of a session in insertion order.
    pub async fn session_messages(
        &self,
        session_key: &str,
    ) -> Result<Vec<MessageRow>, DatabaseError> {
        let messages = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE session_key = ? ORDER BY id ASC",
        )
        .bind(session_key)
        .fetch_all(self.pool())
        .await?;
        Ok(messages)
    }
}
