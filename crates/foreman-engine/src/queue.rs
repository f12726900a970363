//! Per-agent FIFO job queue.
//!
//! One queue per agent identity, backed by the `queued_jobs` collection.
//! Positions use gap numbering (GAP = 10) so appends are O(1) and a job can
//! be re-keyed between neighbours without rewriting the rest of the queue.
//! Dequeue uses the same conditional-update discipline as feature claiming
//! to rule out double-dequeue races.

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::storage::{Database, JobRow, JobStatus};

/// Spacing between consecutive queue positions.
pub const POSITION_GAP: i64 = 10;

/// FIFO backlog of pending work requests, one lane per agent.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    /// Create a queue backed by the given database.
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a job to the back of an agent's queue.
    pub async fn enqueue(
        &self,
        agent_name: &str,
        project_id: &str,
        prompt: &str,
    ) -> EngineResult<JobRow> {
        if prompt.is_empty() {
            return Err(EngineError::Validation("prompt must not be empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        let job = self
            .db
            .insert_job(&id, agent_name, project_id, prompt, POSITION_GAP)
            .await?;
        info!(job_id = %job.id, agent_name, position = job.position, "Job enqueued");
        Ok(job)
    }

    /// Take the lowest-position queued job for an agent, transitioning it to
    /// processing. Returns `Ok(None)` when the queue is empty.
    ///
    /// Selection and transition are separate statements, so the transition
    /// is conditioned on the job still being queued; a lost race reselects.
    pub async fn dequeue(&self, agent_name: &str) -> EngineResult<Option<JobRow>> {
        loop {
            let Some(job) = self.db.lowest_queued_job(agent_name).await? else {
                return Ok(None);
            };

            if self.db.try_start_job(&job.id).await? {
                info!(job_id = %job.id, agent_name, "Job dequeued");
                return Ok(self.db.get_job(&job.id).await?);
            }
            // Another dequeuer got there first; pick the next candidate.
            debug!(job_id = %job.id, agent_name, "Dequeue lost, reselecting");
        }
    }

    /// The job the next dequeue would return, without mutating it.
    pub async fn peek(&self, agent_name: &str) -> EngineResult<Option<JobRow>> {
        Ok(self.db.lowest_queued_job(agent_name).await?)
    }

    /// Delete a job regardless of status (cancellation).
    pub async fn remove(&self, job_id: &str) -> EngineResult<()> {
        if !self.db.delete_job(job_id).await? {
            return Err(EngineError::NotFound(format!("job {job_id}")));
        }
        info!(job_id, "Job removed");
        Ok(())
    }

    /// Re-key a job to a new position in its agent's queue.
    pub async fn reorder(&self, job_id: &str, new_position: i64) -> EngineResult<()> {
        if !self.db.set_job_position(job_id, new_position).await? {
            return Err(EngineError::NotFound(format!("job {job_id}")));
        }
        info!(job_id, new_position, "Job reordered");
        Ok(())
    }

    /// A position that sorts ahead of everything queued for the agent.
    pub async fn front_position(&self, agent_name: &str) -> EngineResult<i64> {
        let min = self.db.min_queued_position(agent_name).await?;
        Ok(min.map_or(POSITION_GAP, |m| m - POSITION_GAP))
    }

    /// Number of queued jobs for an agent.
    #[allow(clippy::cast_sign_loss)]
    pub async fn depth(&self, agent_name: &str) -> EngineResult<u64> {
        Ok(self.db.queued_job_count(agent_name).await?.max(0) as u64)
    }

    /// Active view: queued jobs in dequeue order. Completed and failed rows
    /// are retained in storage but filtered out here.
    pub async fn list(&self, agent_name: &str) -> EngineResult<Vec<JobRow>> {
        Ok(self.db.queued_jobs(agent_name).await?)
    }

    /// Put a dequeued job back at its old position, e.g. when dispatch lost
    /// a race to a concurrent sender and the agent is busy again.
    pub async fn requeue(&self, job_id: &str) -> EngineResult<()> {
        if !self.db.requeue_job(job_id).await? {
            return Err(EngineError::NotFound(format!("processing job {job_id}")));
        }
        info!(job_id, "Job requeued");
        Ok(())
    }

    /// Stamp a job completed. The row is kept for audit.
    pub async fn mark_completed(&self, job_id: &str) -> EngineResult<()> {
        if !self.db.finish_job(job_id, JobStatus::Completed).await? {
            return Err(EngineError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    /// Stamp a job failed. The row is kept for audit.
    pub async fn mark_failed(&self, job_id: &str) -> EngineResult<()> {
        if !self.db.finish_job(job_id, JobStatus::Failed).await? {
            return Err(EngineError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn queue() -> JobQueue {
        JobQueue::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn positions_use_gap_numbering() {
        let queue = queue().await;
        let j1 = queue.enqueue("agent-a", "proj", "one").await.unwrap();
        let j2 = queue.enqueue("agent-a", "proj", "two").await.unwrap();
        let j3 = queue.enqueue("agent-a", "proj", "three").await.unwrap();

        assert_eq!(j1.position, POSITION_GAP);
        assert_eq!(j2.position, 2 * POSITION_GAP);
        assert_eq!(j3.position, 3 * POSITION_GAP);
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let queue = queue().await;
        let j1 = queue.enqueue("agent-a", "proj", "one").await.unwrap();
        let j2 = queue.enqueue("agent-a", "proj", "two").await.unwrap();
        let j3 = queue.enqueue("agent-a", "proj", "three").await.unwrap();

        for expected in [&j1, &j2, &j3] {
            let job = queue.dequeue("agent-a").await.unwrap().unwrap();
            assert_eq!(job.id, expected.id);
            assert_eq!(job.status, "processing");
            assert!(job.started_at.is_some());
        }
        assert!(queue.dequeue("agent-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reorder_to_front_jumps_the_line() {
        let queue = queue().await;
        let _j1 = queue.enqueue("agent-a", "proj", "one").await.unwrap();
        let _j2 = queue.enqueue("agent-a", "proj", "two").await.unwrap();
        let j3 = queue.enqueue("agent-a", "proj", "three").await.unwrap();

        let front = queue.front_position("agent-a").await.unwrap();
        queue.reorder(&j3.id, front).await.unwrap();

        let next = queue.dequeue("agent-a").await.unwrap().unwrap();
        assert_eq!(next.id, j3.id);
    }

    #[tokio::test]
    async fn queues_are_per_agent() {
        let queue = queue().await;
        queue.enqueue("agent-a", "proj", "for a").await.unwrap();
        let b_job = queue.enqueue("agent-b", "proj", "for b").await.unwrap();

        let job = queue.dequeue("agent-b").await.unwrap().unwrap();
        assert_eq!(job.id, b_job.id);
        assert_eq!(queue.depth("agent-a").await.unwrap(), 1);
        assert_eq!(queue.depth("agent-b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn peek_does_not_mutate() {
        let queue = queue().await;
        let j1 = queue.enqueue("agent-a", "proj", "one").await.unwrap();

        let peeked = queue.peek("agent-a").await.unwrap().unwrap();
        assert_eq!(peeked.id, j1.id);
        assert_eq!(peeked.status, "queued");
        assert_eq!(queue.depth("agent-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn each_job_dequeued_once_under_racing_consumers() {
        let queue = queue().await;
        for i in 0..5 {
            queue
                .enqueue("agent-a", "proj", &format!("job {i}"))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(job) = queue.dequeue("agent-a").await.unwrap() {
                    taken.push(job.id);
                }
                taken
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 5, "every job taken exactly once");
    }

    #[tokio::test]
    async fn completed_jobs_leave_the_active_view_but_not_storage() {
        let queue = queue().await;
        let job = queue.enqueue("agent-a", "proj", "one").await.unwrap();
        queue.dequeue("agent-a").await.unwrap();
        queue.mark_completed(&job.id).await.unwrap();

        assert!(queue.list("agent-a").await.unwrap().is_empty());
        assert_eq!(queue.depth("agent-a").await.unwrap(), 0);

        let stored = queue.db.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "completed");
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn remove_cancels_any_status() {
        let queue = queue().await;
        let first = queue.enqueue("agent-a", "proj", "one").await.unwrap();
        let second = queue.enqueue("agent-a", "proj", "two").await.unwrap();
        // First job moves to processing; second stays queued.
        queue.dequeue("agent-a").await.unwrap();

        queue.remove(&first.id).await.unwrap();
        queue.remove(&second.id).await.unwrap();
        assert!(queue.db.get_job(&first.id).await.unwrap().is_none());
        assert!(queue.db.get_job(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let queue = queue().await;
        let err = queue.enqueue("agent-a", "proj", "").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let queue = queue().await;
        assert!(matches!(
            queue.remove("ghost").await.unwrap_err(),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            queue.reorder("ghost", 5).await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }
}
