//! Per-agent job queue queries.

use foreman_core::db::{DatabaseError, unix_timestamp_ms};

use super::db::Database;
use super::models::{JobRow, JobStatus};

impl Database {
    /// Insert a job at the back of an agent's queue.
    ///
    /// The position is assigned inside the INSERT's subselect
    /// (`max(existing) + gap`, first item gets `gap`), so the append is a
    /// single atomic statement and never rewrites existing rows.
    pub async fn insert_job(
        &self,
        id: &str,
        agent_name: &str,
        project_id: &str,
        prompt: &str,
        gap: i64,
    ) -> Result<JobRow, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO queued_jobs (id, agent_name, project_id, prompt, position, status, queued_at)
            VALUES (?, ?, ?, ?,
                (SELECT COALESCE(MAX(position), 0) + ? FROM queued_jobs WHERE agent_name = ?),
                'queued', ?)
            ",
        )
        .bind(id)
        .bind(agent_name)
        .bind(project_id)
        .bind(prompt)
        .bind(gap)
        .bind(agent_name)
        .bind(unix_timestamp_ms())
        .execute(self.pool())
        .await?;

        self.get_job(id)
            .await?
            .ok_or_else(|| DatabaseError::Query(format!("job {id} vanished after insert")))
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<JobRow>, DatabaseError> {
        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM queued_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(job)
    }

    /// The queued job with the lowest position for an agent, if any.
    pub async fn lowest_queued_job(
        &self,
        agent_name: &str,
    ) -> Result<Option<JobRow>, DatabaseError> {
        let job = sqlx::query_as::<_, JobRow>(
            r"
            SELECT * FROM queued_jobs
            WHERE agent_name = ? AND status = 'queued'
            ORDER BY position ASC
            LIMIT 1
            ",
        )
        .bind(agent_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    /// Conditionally transition a job queued → processing, stamping
    /// `started_at`. Guards against double-dequeue races.
    pub async fn try_start_job(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE queued_jobs
            SET status = 'processing', started_at = ?
            WHERE id = ? AND status = 'queued'
            ",
        )
        .bind(unix_timestamp_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a job regardless of status (cancellation).
    pub async fn delete_job(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM queued_jobs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-key a job to a new position.
    pub async fn set_job_position(&self, id: &str, position: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE queued_jobs SET position = ? WHERE id = ?")
            .bind(position)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lowest position among an agent's queued jobs.
    pub async fn min_queued_position(
        &self,
        agent_name: &str,
    ) -> Result<Option<i64>, DatabaseError> {
        let min: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(position) FROM queued_jobs WHERE agent_name = ? AND status = 'queued'",
        )
        .bind(agent_name)
        .fetch_one(self.pool())
        .await?;
        Ok(min)
    }

    /// Number of queued jobs for an agent.
    pub async fn queued_job_count(&self, agent_name: &str) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queued_jobs WHERE agent_name = ? AND status = 'queued'",
        )
        .bind(agent_name)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Active view: an agent's queued jobs in dequeue order.
    pub async fn queued_jobs(&self, agent_name: &str) -> Result<Vec<JobRow>, DatabaseError> {
        let jobs = sqlx::query_as::<_, JobRow>(
            r"
            SELECT * FROM queued_jobs
            WHERE agent_name = ? AND status = 'queued'
            ORDER BY position ASC
            ",
        )
        .bind(agent_name)
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// Return a processing job to the queue at its old position.
    pub async fn requeue_job(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE queued_jobs
            SET status = 'queued', started_at = NULL
            WHERE id = ? AND status = 'processing'
            ",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp a terminal job status; the row is retained for audit.
    pub async fn finish_job(&self, id: &str, status: JobStatus) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE queued_jobs SET status = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(unix_timestamp_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
