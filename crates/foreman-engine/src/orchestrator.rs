//! Top-level orchestrator: the engine's command surface.
//!
//! Composes the graph, claim, ledger, queue, relay, and supervisor
//! components and owns the queue-advance loop: whenever an agent's slot
//! frees up, the next queued job for that agent is dequeued and dispatched
//! into its session.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::claim::ClaimEngine;
use crate::error::{EngineError, EngineResult};
use crate::graph::DependencyGraph;
use crate::ledger::RunLedger;
use crate::queue::JobQueue;
use crate::relay::{EventRelay, RelayEvent};
use crate::session::{
    AgentIdle, StartSession, SupervisorConfig, WorkSessionSupervisor, session_key,
};
use crate::storage::{Database, FeatureRow, JobRow, MessageRow, NewFeature, RunRow, RunStatus};
use crate::workspace::Workspaces;

/// What happened to a message sent at a session.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The turn is running.
    Sent,
    /// The session was busy; the message was queued for the agent instead.
    Queued(JobRow),
}

/// The orchestration engine's public face.
pub struct Orchestrator {
    db: Database,
    graph: DependencyGraph,
    claims: ClaimEngine,
    ledger: RunLedger,
    queue: JobQueue,
    relay: EventRelay,
    supervisor: Arc<WorkSessionSupervisor>,
    advance_task: tokio::task::JoinHandle<()>,
}

impl Orchestrator {
    /// Assemble an engine over an opened database.
    pub fn new(
        db: Database,
        config: SupervisorConfig,
        workspaces: Arc<dyn Workspaces>,
    ) -> Self {
        let relay = EventRelay::with_defaults();
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(WorkSessionSupervisor::new(
            db.clone(),
            relay.clone(),
            workspaces,
            config,
            idle_tx,
        ));
        let queue = JobQueue::new(db.clone());

        let advance_task = tokio::spawn(advance_loop(
            idle_rx,
            queue.clone(),
            Arc::clone(&supervisor),
        ));

        Self {
            graph: DependencyGraph::new(db.clone()),
            claims: ClaimEngine::new(db.clone()),
            ledger: RunLedger::new(db.clone()),
            queue,
            relay,
            supervisor,
            advance_task,
            db,
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Start (or idempotently reuse) a work session.
    pub async fn start_session(&self, request: StartSession) -> EngineResult<RunRow> {
        self.supervisor.start(request).await
    }

    /// Send a message to a session. A busy session queues the message for
    /// the agent instead; the queue-advance loop delivers it once the
    /// current turn finishes.
    pub async fn send_message(&self, run_id: &str, message: &str) -> EngineResult<SendOutcome> {
        match self.supervisor.send_message(run_id, message).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(EngineError::Busy { .. }) => {
                let session = self
                    .supervisor
                    .session_for_run(run_id)
                    .await
                    .ok_or_else(|| EngineError::NotFound(format!("session for run {run_id}")))?;
                let project_ref = session
                    .project_id
                    .clone()
                    .unwrap_or_else(|| session.thread_id.clone());
                let job = self
                    .queue
                    .enqueue(&session.agent_name, &project_ref, message)
                    .await?;
                info!(run_id, job_id = %job.id, "Session busy; message queued");
                Ok(SendOutcome::Queued(job))
            }
            Err(e) => Err(e),
        }
    }

    /// End a session (idempotent).
    pub async fn end_session(&self, run_id: &str) -> EngineResult<()> {
        self.supervisor.end(run_id).await
    }

    /// Subscribe to a session's live event stream.
    pub async fn subscribe(&self, session_key: &str) -> broadcast::Receiver<RelayEvent> {
        self.relay.subscribe(session_key).await
    }

    /// Durable transcript of a session.
    pub async fn session_messages(&self, session_key: &str) -> EngineResult<Vec<MessageRow>> {
        Ok(self.db.session_messages(session_key).await?)
    }

    /// Snapshot of the live session owning a run, if any.
    pub async fn session_for_run(&self, run_id: &str) -> Option<crate::session::WorkSession> {
        self.supervisor.session_for_run(run_id).await
    }

    /// Number of live sessions.
    pub async fn active_sessions(&self) -> usize {
        self.supervisor.active_count().await
    }

    // =========================================================================
    // Features
    // =========================================================================

    /// Bulk-create a project's features at setup.
    pub async fn create_features(
        &self,
        project_id: &str,
        features: &[NewFeature],
    ) -> EngineResult<()> {
        self.db.create_features(project_id, features).await?;
        Ok(())
    }

    /// Remove every feature of a project (teardown).
    pub async fn teardown_project(&self, project_id: &str) -> EngineResult<u64> {
        Ok(self.db.delete_project_features(project_id).await?)
    }

    /// Ready features of a project in claim order.
    pub async fn ready_features(&self, project_id: &str) -> EngineResult<Vec<FeatureRow>> {
        self.graph.ready_features(project_id).await
    }

    /// Atomically claim the most urgent ready feature for an agent.
    pub async fn claim_feature(
        &self,
        project_id: &str,
        agent_id: &str,
    ) -> EngineResult<Option<FeatureRow>> {
        self.claims.claim_feature(project_id, agent_id).await
    }

    pub async fn mark_feature_passing(&self, feature_id: &str) -> EngineResult<()> {
        self.claims.mark_feature_passing(feature_id).await
    }

    pub async fn mark_feature_failing(&self, feature_id: &str) -> EngineResult<()> {
        self.claims.mark_feature_failing(feature_id).await
    }

    pub async fn mark_feature_in_progress(
        &self,
        feature_id: &str,
        agent_id: &str,
    ) -> EngineResult<()> {
        self.claims
            .mark_feature_in_progress(feature_id, agent_id)
            .await
    }

    /// Add a dependency edge, keeping the project graph acyclic.
    pub async fn add_dependency(&self, feature_id: &str, depends_on: &str) -> EngineResult<()> {
        self.graph.add_dependency(feature_id, depends_on).await
    }

    /// Remove a dependency edge.
    pub async fn remove_dependency(&self, feature_id: &str, depends_on: &str) -> EngineResult<()> {
        self.graph.remove_dependency(feature_id, depends_on).await
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Move a run through its working phases. The phase label is relayed to
    /// the owning session's subscribers when one is active.
    pub async fn update_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output_append: Option<&str>,
    ) -> EngineResult<()> {
        self.ledger
            .update_status(run_id, status, output_append)
            .await?;

        if let Some(key) = self.supervisor.key_for_run(run_id).await {
            self.relay
                .publish(
                    &key,
                    RelayEvent::Token(format!("[{}]", status.phase_label())),
                )
                .await;
        }
        Ok(())
    }

    /// Complete a run with a terminal status (idempotent).
    pub async fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        message: Option<&str>,
    ) -> EngineResult<()> {
        self.ledger.complete_run(run_id, status, message).await
    }

    /// Runs of a project not yet terminal.
    pub async fn active_runs(&self, project_id: &str) -> EngineResult<Vec<RunRow>> {
        self.ledger.list_active(project_id).await
    }

    /// Run history by feature or agent; exactly one key must be supplied.
    pub async fn run_logs(
        &self,
        feature_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> EngineResult<Vec<RunRow>> {
        let key = RunLedger::log_key(feature_id, agent_id)?;
        self.ledger.get_logs(key).await
    }

    // =========================================================================
    // Job queue
    // =========================================================================

    pub async fn enqueue_job(
        &self,
        agent_name: &str,
        project_id: &str,
        prompt: &str,
    ) -> EngineResult<JobRow> {
        self.queue.enqueue(agent_name, project_id, prompt).await
    }

    pub async fn dequeue_job(&self, agent_name: &str) -> EngineResult<Option<JobRow>> {
        self.queue.dequeue(agent_name).await
    }

    pub async fn peek_job(&self, agent_name: &str) -> EngineResult<Option<JobRow>> {
        self.queue.peek(agent_name).await
    }

    pub async fn remove_job(&self, job_id: &str) -> EngineResult<()> {
        self.queue.remove(job_id).await
    }

    pub async fn reorder_job(&self, job_id: &str, new_position: i64) -> EngineResult<()> {
        self.queue.reorder(job_id, new_position).await
    }

    /// A position sorting ahead of everything queued for the agent.
    pub async fn front_position(&self, agent_name: &str) -> EngineResult<i64> {
        self.queue.front_position(agent_name).await
    }

    pub async fn queue_depth(&self, agent_name: &str) -> EngineResult<u64> {
        self.queue.depth(agent_name).await
    }

    /// Stamp a job completed (rows are retained for audit).
    pub async fn complete_job(&self, job_id: &str) -> EngineResult<()> {
        self.queue.mark_completed(job_id).await
    }

    /// Stamp a job failed (rows are retained for audit).
    pub async fn fail_job(&self, job_id: &str) -> EngineResult<()> {
        self.queue.mark_failed(job_id).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// End every session and stop the queue-advance loop.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.advance_task.abort();
    }
}

/// Drain agent-idle notifications and advance the owning agent's queue.
async fn advance_loop(
    mut idle_rx: mpsc::UnboundedReceiver<AgentIdle>,
    queue: JobQueue,
    supervisor: Arc<WorkSessionSupervisor>,
) {
    while let Some(signal) = idle_rx.recv().await {
        match queue.dequeue(&signal.agent_name).await {
            Ok(Some(job)) => dispatch_job(&queue, &supervisor, job).await,
            Ok(None) => {}
            Err(e) => warn!(agent = %signal.agent_name, error = %e, "Queue advance failed"),
        }
    }
    debug!("Queue-advance loop stopped");
}

/// Hand a dequeued job to its agent: resume the project's session when one
/// is live, otherwise start a fresh one.
async fn dispatch_job(queue: &JobQueue, supervisor: &Arc<WorkSessionSupervisor>, job: JobRow) {
    let key = session_key(Some(&job.project_id), &job.project_id);

    let result = match supervisor.session_for_key(&key).await {
        Some(session) => supervisor.send_message(&session.run_id, &job.prompt).await,
        None => supervisor
            .start(StartSession {
                agent_name: job.agent_name.clone(),
                project_id: Some(job.project_id.clone()),
                thread_id: job.project_id.clone(),
                feature_id: None,
                role: "worker".to_string(),
                prompt: job.prompt.clone(),
            })
            .await
            .map(|_| ()),
    };

    match result {
        Ok(()) => {
            info!(job_id = %job.id, agent = %job.agent_name, "Queued job dispatched");
            if let Err(e) = queue.mark_completed(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to mark job completed");
            }
        }
        Err(EngineError::Busy { .. } | EngineError::NotReady { .. }) => {
            // Lost a race to a concurrent sender; the job goes back to the
            // front of the line for the next idle signal.
            if let Err(e) = queue.requeue(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to requeue job");
            }
        }
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Job dispatch failed");
            if let Err(mark_err) = queue.mark_failed(&job.id).await {
                warn!(job_id = %job.id, error = %mark_err, "Failed to mark job failed");
            }
        }
    }
}
