//! Feature collection queries.

use foreman_core::db::{DatabaseError, unix_timestamp_ms};

use super::db::Database;
use super::models::FeatureRow;

/// Input for bulk feature creation at project setup.
#[derive(Debug, Clone)]
pub struct NewFeature {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub dependencies: Vec<String>,
}

impl Database {
    /// Insert a batch of features for a project in one transaction.
    pub async fn create_features(
        &self,
        project_id: &str,
        features: &[NewFeature],
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp_ms();
        let mut tx = self.pool().begin().await?;

        for feature in features {
            let deps = serde_json::to_string(&feature.dependencies)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            sqlx::query(
                r"
                INSERT INTO features (id, project_id, name, priority, status, dependencies, created_at, updated_at)
                VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
                ",
            )
            .bind(&feature.id)
            .bind(project_id)
            .bind(&feature.name)
            .bind(feature.priority)
            .bind(deps)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get a feature by id.
    pub async fn get_feature(&self, id: &str) -> Result<Option<FeatureRow>, DatabaseError> {
        let feature = sqlx::query_as::<_, FeatureRow>("SELECT * FROM features WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(feature)
    }

    /// List all features of a project.
    pub async fn project_features(
        &self,
        project_id: &str,
    ) -> Result<Vec<FeatureRow>, DatabaseError> {
        let features = sqlx::query_as::<_, FeatureRow>(
            "SELECT * FROM features WHERE project_id = ? ORDER BY priority ASC, created_at ASC",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        Ok(features)
    }

    /// Replace a feature's dependency set.
    pub async fn set_feature_dependencies(
        &self,
        id: &str,
        dependencies: &[String],
    ) -> Result<bool, DatabaseError> {
        let deps = serde_json::to_string(dependencies)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let result =
            sqlx::query("UPDATE features SET dependencies = ?, updated_at = ? WHERE id = ?")
                .bind(deps)
                .bind(unix_timestamp_ms())
                .bind(id)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Conditionally claim a feature: pending → `in_progress` with an owner.
    ///
    /// The guard (`still pending and still unassigned`) is the engine's sole
    /// concurrency-control mechanism for claims; exactly one of N racing
    /// callers observes `rows_affected == 1`.
    pub async fn try_claim_feature(
        &self,
        id: &str,
        agent_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features
            SET status = 'in_progress', assigned_agent_id = ?, updated_at = ?
            WHERE id = ? AND status = 'pending' AND assigned_agent_id IS NULL
            ",
        )
        .bind(agent_id)
        .bind(unix_timestamp_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a feature passing: stamps completion, clears assignment.
    pub async fn set_feature_passing(&self, id: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp_ms();
        let result = sqlx::query(
            r"
            UPDATE features
            SET status = 'passing', assigned_agent_id = NULL, completed_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a feature failing: clears assignment, no automatic requeue.
    pub async fn set_feature_failing(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features
            SET status = 'failing', assigned_agent_id = NULL, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(unix_timestamp_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Directly assign a feature to an agent, bypassing ready-set ordering.
    pub async fn set_feature_in_progress(
        &self,
        id: &str,
        agent_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features
            SET status = 'in_progress', assigned_agent_id = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(agent_id)
        .bind(unix_timestamp_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every feature of a project (teardown).
    pub async fn delete_project_features(&self, project_id: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM features WHERE project_id = ?")
            .bind(project_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
