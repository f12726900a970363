//! Agent run collection queries.

use foreman_core::db::{DatabaseError, unix_timestamp_ms};

use super::db::Database;
use super::models::{RunRow, RunStatus};

impl Database {
    /// Insert a new run record in `started` state.
    pub async fn insert_run(
        &self,
        id: &str,
        agent_id: &str,
        project_id: &str,
        feature_id: &str,
        role: &str,
    ) -> Result<RunRow, DatabaseError> {
        let now = unix_timestamp_ms();

        sqlx::query(
            r"
            INSERT INTO agent_runs (id, agent_id, project_id, feature_id, role, status, started_at)
            VALUES (?, ?, ?, ?, ?, 'started', ?)
            ",
        )
        .bind(id)
        .bind(agent_id)
        .bind(project_id)
        .bind(feature_id)
        .bind(role)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_run(id)
            .await?
            .ok_or_else(|| DatabaseError::Query(format!("run {id} vanished after insert")))
    }

    /// Get a run by id.
    pub async fn get_run(&self, id: &str) -> Result<Option<RunRow>, DatabaseError> {
        let run = sqlx::query_as::<_, RunRow>("SELECT * FROM agent_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(run)
    }

    /// Conditionally move a run to a non-terminal status, optionally
    /// appending progress output. A run already in a terminal state is left
    /// untouched (`rows_affected == 0`).
    pub async fn try_update_run_status(
        &self,
        id: &str,
        status: RunStatus,
        output_append: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = if let Some(append) = output_append {
            sqlx::query(
                r"
                UPDATE agent_runs
                SET status = ?, output = COALESCE(output, '') || ?
                WHERE id = ? AND status NOT IN ('completed', 'failed')
                ",
            )
            .bind(status.as_str())
            .bind(append)
            .bind(id)
            .execute(self.pool())
            .await?
        } else {
            sqlx::query(
                r"
                UPDATE agent_runs
                SET status = ?
                WHERE id = ? AND status NOT IN ('completed', 'failed')
                ",
            )
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?
        };
        Ok(result.rows_affected() > 0)
    }

    /// Conditionally complete a run: terminal status, completion stamp, and
    /// `duration_ms` derived from `started_at`. A second call is a no-op.
    pub async fn try_complete_run(
        &self,
        id: &str,
        status: RunStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp_ms();
        let result = sqlx::query(
            r"
            UPDATE agent_runs
            SET status = ?, completed_at = ?, duration_ms = ? - started_at, summary = ?, error = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            ",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(summary)
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All runs of a project not yet in a terminal state.
    pub async fn active_runs(&self, project_id: &str) -> Result<Vec<RunRow>, DatabaseError> {
        let runs = sqlx::query_as::<_, RunRow>(
            r"
            SELECT * FROM agent_runs
            WHERE project_id = ? AND status NOT IN ('completed', 'failed')
            ORDER BY started_at ASC
            ",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        Ok(runs)
    }

    /// All runs for a feature, oldest first.
    pub async fn runs_by_feature(&self, feature_id: &str) -> Result<Vec<RunRow>, DatabaseError> {
        let runs = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM agent_runs WHERE feature_id = ? ORDER BY started_at ASC",
        )
        .bind(feature_id)
        .fetch_all(self.pool())
        .await?;
        Ok(runs)
    }

    /// All runs for an agent, oldest first.
    pub async fn runs_by_agent(&self, agent_id: &str) -> Result<Vec<RunRow>, DatabaseError> {
        let runs = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM agent_runs WHERE agent_id = ? ORDER BY started_at ASC",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        Ok(runs)
    }
}
