//! Agent run lifecycle ledger.
//!
//! One execution record per (agent, feature) claim. Runs move
//! `started → {thinking|coding|testing|reviewing} → {completed|failed}`;
//! terminal states are entered exactly once and later writes never corrupt
//! the terminal record.

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::storage::{Database, RunRow, RunStatus};

/// Query key for [`RunLedger::get_logs`]: exactly one of the two.
#[derive(Debug, Clone, Copy)]
pub enum LogKey<'a> {
    Feature(&'a str),
    Agent(&'a str),
}

/// Ledger of agent runs.
#[derive(Clone)]
pub struct RunLedger {
    db: Database,
}

impl RunLedger {
    /// Create a ledger backed by the given database.
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a run record for a fresh claim. Called exactly once per claim.
    pub async fn create_run(
        &self,
        agent_id: &str,
        project_id: &str,
        feature_id: &str,
        role: &str,
    ) -> EngineResult<RunRow> {
        let id = Uuid::new_v4().to_string();
        let run = self
            .db
            .insert_run(&id, agent_id, project_id, feature_id, role)
            .await?;
        info!(run_id = %run.id, agent_id, feature_id, "Run created");
        Ok(run)
    }

    /// Get a run by id.
    pub async fn get_run(&self, run_id: &str) -> EngineResult<RunRow> {
        self.db
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
    }

    /// Move a run to a non-terminal status, optionally appending output.
    ///
    /// Terminal statuses must go through [`Self::complete_run`]. A call
    /// against an already-terminal run is ignored; the terminal record stays
    /// untouched.
    pub async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        output_append: Option<&str>,
    ) -> EngineResult<()> {
        if status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "status {status} is terminal; use complete_run"
            )));
        }

        // Existence first, so unknown runs surface as NotFound rather than
        // silently falling into the ignored-terminal path.
        let _ = self.get_run(run_id).await?;

        if !self
            .db
            .try_update_run_status(run_id, status, output_append)
            .await?
        {
            debug!(run_id, %status, "Ignoring status update on terminal run");
        }
        Ok(())
    }

    /// Complete a run with a terminal status. Stamps `completed_at` and
    /// computes `duration_ms` from `started_at`; a second call is a no-op so
    /// the duration stays well-defined.
    pub async fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        message: Option<&str>,
    ) -> EngineResult<()> {
        if !status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "status {status} is not terminal"
            )));
        }

        let _ = self.get_run(run_id).await?;

        let (summary, error) = match status {
            RunStatus::Failed => (None, message),
            _ => (message, None),
        };

        if self
            .db
            .try_complete_run(run_id, status, summary, error)
            .await?
        {
            info!(run_id, %status, "Run completed");
        } else {
            debug!(run_id, %status, "Run already terminal; completion ignored");
        }
        Ok(())
    }

    /// All runs of a project not yet terminal.
    pub async fn list_active(&self, project_id: &str) -> EngineResult<Vec<RunRow>> {
        Ok(self.db.active_runs(project_id).await?)
    }

    /// Run history for a feature or an agent, ascending by start time.
    pub async fn get_logs(&self, key: LogKey<'_>) -> EngineResult<Vec<RunRow>> {
        match key {
            LogKey::Feature(feature_id) => Ok(self.db.runs_by_feature(feature_id).await?),
            LogKey::Agent(agent_id) => Ok(self.db.runs_by_agent(agent_id).await?),
        }
    }

    /// Resolve the optional feature/agent pair callers hand in: exactly one
    /// key must be supplied.
    pub fn log_key<'a>(
        feature_id: Option<&'a str>,
        agent_id: Option<&'a str>,
    ) -> EngineResult<LogKey<'a>> {
        match (feature_id, agent_id) {
            (Some(feature), None) => Ok(LogKey::Feature(feature)),
            (None, Some(agent)) => Ok(LogKey::Agent(agent)),
            _ => Err(EngineError::Validation(
                "exactly one of feature_id or agent_id must be supplied".to_string(),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn ledger() -> RunLedger {
        RunLedger::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_then_update_status() {
        let ledger = ledger().await;
        let run = ledger
            .create_run("agent-a", "proj", "f-1", "worker")
            .await
            .unwrap();
        assert_eq!(run.status, "started");

        ledger
            .update_status(&run.id, RunStatus::Coding, Some("opened src/lib.rs\n"))
            .await
            .unwrap();

        let run = ledger.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, "coding");
        assert_eq!(run.output.as_deref(), Some("opened src/lib.rs\n"));
    }

    #[tokio::test]
    async fn terminal_status_rejected_by_update() {
        let ledger = ledger().await;
        let run = ledger
            .create_run("agent-a", "proj", "f-1", "worker")
            .await
            .unwrap();

        let err = ledger
            .update_status(&run.id, RunStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn post_terminal_update_does_not_corrupt_record() {
        let ledger = ledger().await;
        let run = ledger
            .create_run("agent-a", "proj", "f-1", "worker")
            .await
            .unwrap();

        ledger
            .complete_run(&run.id, RunStatus::Completed, Some("done"))
            .await
            .unwrap();
        ledger
            .update_status(&run.id, RunStatus::Coding, Some("late write"))
            .await
            .unwrap();

        let run = ledger.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, "completed");
        assert!(run.output.is_none());
    }

    #[tokio::test]
    async fn complete_run_is_idempotent() {
        let ledger = ledger().await;
        let run = ledger
            .create_run("agent-a", "proj", "f-1", "worker")
            .await
            .unwrap();

        ledger
            .complete_run(&run.id, RunStatus::Completed, Some("first"))
            .await
            .unwrap();
        let first = ledger.get_run(&run.id).await.unwrap();

        ledger
            .complete_run(&run.id, RunStatus::Failed, Some("second"))
            .await
            .unwrap();
        let second = ledger.get_run(&run.id).await.unwrap();

        assert_eq!(second.status, "completed");
        assert_eq!(second.duration_ms, first.duration_ms);
        assert_eq!(second.completed_at, first.completed_at);
        assert_eq!(second.summary.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn completion_computes_duration() {
        let ledger = ledger().await;
        let run = ledger
            .create_run("agent-a", "proj", "f-1", "worker")
            .await
            .unwrap();

        ledger
            .complete_run(&run.id, RunStatus::Failed, Some("subprocess exited 1"))
            .await
            .unwrap();

        let run = ledger.get_run(&run.id).await.unwrap();
        assert!(run.completed_at.is_some());
        let duration = run.duration_ms.unwrap();
        assert!(duration >= 0);
        assert_eq!(run.completed_at.unwrap() - run.started_at, duration);
        assert_eq!(run.error.as_deref(), Some("subprocess exited 1"));
        assert!(run.summary.is_none());
    }

    #[tokio::test]
    async fn list_active_excludes_terminal() {
        let ledger = ledger().await;
        let live = ledger
            .create_run("agent-a", "proj", "f-1", "worker")
            .await
            .unwrap();
        let done = ledger
            .create_run("agent-b", "proj", "f-2", "worker")
            .await
            .unwrap();
        ledger
            .complete_run(&done.id, RunStatus::Completed, None)
            .await
            .unwrap();

        let active = ledger.list_active("proj").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
    }

    #[tokio::test]
    async fn logs_require_exactly_one_key() {
        assert!(RunLedger::log_key(Some("f"), Some("a")).is_err());
        assert!(RunLedger::log_key(None, None).is_err());
        assert!(RunLedger::log_key(Some("f"), None).is_ok());
        assert!(RunLedger::log_key(None, Some("a")).is_ok());
    }

    #[tokio::test]
    async fn logs_ordered_by_start_time() {
        let ledger = ledger().await;
        let first = ledger
            .create_run("agent-a", "proj", "f-1", "worker")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = ledger
            .create_run("agent-a", "proj", "f-1", "reviewer")
            .await
            .unwrap();

        let logs = ledger.get_logs(LogKey::Feature("f-1")).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].id, first.id);
        assert_eq!(logs[1].id, second.id);

        let by_agent = ledger.get_logs(LogKey::Agent("agent-a")).await.unwrap();
        assert_eq!(by_agent.len(), 2);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let ledger = ledger().await;
        let err = ledger
            .update_status("ghost", RunStatus::Coding, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
