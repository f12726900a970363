//! Work-session supervisor.
//!
//! Owns the 1:1 mapping between a live subprocess and a logical
//! (agent, project-or-thread) identity, enforcing at most one active session
//! per project. The registry is an explicitly owned map held by the
//! supervisor instance so tests and shutdown can enumerate it; nothing is
//! global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Notify, RwLock, Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::ledger::RunLedger;
use crate::relay::{EventRelay, RelayEvent};
use crate::storage::{Database, RunRow, RunStatus};
use crate::turn::{self, TurnConfig, TurnOutcome};
use crate::workspace::Workspaces;

use super::bridge::TurnBridge;
use super::types::{AgentIdle, StartSession, SupervisorConfig, WorkSession, session_key};

/// Supervises work sessions and their subprocess turns.
pub struct WorkSessionSupervisor {
    db: Database,
    ledger: RunLedger,
    relay: EventRelay,
    workspaces: Arc<dyn Workspaces>,
    config: SupervisorConfig,
    /// Concurrency cap across all sessions' subprocesses.
    slots: Arc<Semaphore>,
    /// Active sessions keyed by session key.
    sessions: Arc<RwLock<HashMap<String, WorkSession>>>,
    /// Maps run id → session key for run-addressed operations.
    run_index: Arc<RwLock<HashMap<String, String>>>,
    /// Queue-advance notifications drained by the orchestrator.
    idle_tx: mpsc::UnboundedSender<AgentIdle>,
}

impl WorkSessionSupervisor {
    /// Create a supervisor.
    pub fn new(
        db: Database,
        relay: EventRelay,
        workspaces: Arc<dyn Workspaces>,
        config: SupervisorConfig,
        idle_tx: mpsc::UnboundedSender<AgentIdle>,
    ) -> Self {
        let ledger = RunLedger::new(db.clone());
        let slots = Arc::new(Semaphore::new(config.max_processes.max(1)));
        Self {
            db,
            ledger,
            relay,
            workspaces,
            config,
            slots,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            run_index: Arc::new(RwLock::new(HashMap::new())),
            idle_tx,
        }
    }

    /// Start a session, or return the existing one for the same
    /// project/thread unchanged (idempotent reuse, no duplicate spawn).
    #[allow(clippy::significant_drop_tightening)]
    pub async fn start(self: &Arc<Self>, req: StartSession) -> EngineResult<RunRow> {
        if req.prompt.is_empty() {
            return Err(EngineError::Validation("prompt must not be empty".into()));
        }

        let key = session_key(req.project_id.as_deref(), &req.thread_id);

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&key) {
            debug!(session_key = %key, run_id = %existing.run_id, "Reusing active session");
            return self.ledger.get_run(&existing.run_id).await;
        }

        let workspace = self
            .workspaces
            .provision(&req.agent_name, &key)
            .map_err(|e| EngineError::Subprocess(format!("workspace provisioning failed: {e}")))?;

        // Sessions without a project or feature are ledgered against their
        // thread id so the run record stays addressable.
        let project_ref = req
            .project_id
            .clone()
            .unwrap_or_else(|| req.thread_id.clone());
        let feature_ref = req
            .feature_id
            .clone()
            .unwrap_or_else(|| req.thread_id.clone());

        let run = self
            .ledger
            .create_run(&req.agent_name, &project_ref, &feature_ref, &req.role)
            .await?;

        sessions.insert(
            key.clone(),
            WorkSession {
                run_id: run.id.clone(),
                agent_name: req.agent_name.clone(),
                project_id: req.project_id.clone(),
                thread_id: req.thread_id.clone(),
                resume_token: None,
                busy: true,
                last_activity: Instant::now(),
                workspace,
                cancel_turn: None,
            },
        );
        drop(sessions);
        self.run_index
            .write()
            .await
            .insert(run.id.clone(), key.clone());

        if let Err(e) = self
            .db
            .insert_message(&key, &run.id, "user", &req.prompt)
            .await
        {
            warn!(session_key = %key, error = %e, "Failed to store user prompt");
        }

        if let Err(e) = self.spawn_turn_pipeline(&key, &run.id, &req.prompt, None).await {
            // Roll back the half-open session so a retry can start clean.
            self.sessions.write().await.remove(&key);
            self.run_index.write().await.remove(&run.id);
            let _ = self
                .ledger
                .complete_run(&run.id, RunStatus::Failed, Some(&e.to_string()))
                .await;
            return Err(e);
        }

        self.spawn_watchdog(key.clone());

        info!(session_key = %key, run_id = %run.id, agent = %req.agent_name, "Session started");
        Ok(run)
    }

    /// Send a message to an existing session, spawning a fresh subprocess
    /// invocation that resumes the prior conversation.
    ///
    /// Fails with [`EngineError::Busy`] while a turn is in flight (callers
    /// should enqueue instead) and with [`EngineError::NotReady`] before the
    /// first turn has produced a resume token.
    pub async fn send_message(self: &Arc<Self>, run_id: &str, message: &str) -> EngineResult<()> {
        if message.is_empty() {
            return Err(EngineError::Validation("message must not be empty".into()));
        }

        let key = self.key_for_run(run_id).await.ok_or_else(|| {
            EngineError::NotFound(format!("session for run {run_id}"))
        })?;

        let resume_token = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| EngineError::NotFound(format!("session {key}")))?;

            if session.busy {
                return Err(EngineError::Busy {
                    run_id: run_id.to_string(),
                });
            }
            let Some(token) = session.resume_token.clone() else {
                return Err(EngineError::NotReady {
                    run_id: run_id.to_string(),
                });
            };
            session.busy = true;
            session.last_activity = Instant::now();
            token
        };

        if let Err(e) = self
            .db
            .insert_message(&key, run_id, "user", message)
            .await
        {
            warn!(session_key = %key, error = %e, "Failed to store user message");
        }

        match self
            .spawn_turn_pipeline(&key, run_id, message, Some(resume_token))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // The turn never started; release the busy flag.
                if let Some(session) = self.sessions.write().await.get_mut(&key) {
                    session.busy = false;
                }
                Err(e)
            }
        }
    }

    /// End a session. Idempotent: an unknown run id is already ended.
    pub async fn end(self: &Arc<Self>, run_id: &str) -> EngineResult<()> {
        match self.key_for_run(run_id).await {
            None => Ok(()),
            Some(key) => {
                self.end_by_key(&key, RunStatus::Completed, Some("session ended"))
                    .await;
                Ok(())
            }
        }
    }

    /// End every live session (clean teardown enumeration).
    pub async fn shutdown(self: &Arc<Self>) {
        let keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for key in keys {
            self.end_by_key(&key, RunStatus::Completed, Some("supervisor shutdown"))
                .await;
        }
    }

    /// Snapshot of the session owning a run, if it is still active.
    pub async fn session_for_run(&self, run_id: &str) -> Option<WorkSession> {
        let key = self.key_for_run(run_id).await?;
        self.sessions.read().await.get(&key).cloned()
    }

    /// Snapshot of the session under a key, if any.
    pub async fn session_for_key(&self, session_key: &str) -> Option<WorkSession> {
        self.sessions.read().await.get(session_key).cloned()
    }

    /// Session key owning a run id.
    pub async fn key_for_run(&self, run_id: &str) -> Option<String> {
        self.run_index.read().await.get(run_id).cloned()
    }

    /// Number of active sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Access to the relay shared with subscribers.
    pub const fn relay(&self) -> &EventRelay {
        &self.relay
    }

    // =========================================================================
    // Turn pipeline
    // =========================================================================

    /// Spawn the subprocess for one turn and the pipeline task that bridges
    /// its protocol stream to the relay. The end-of-turn continuation runs
    /// when the process exits, on every exit path.
    async fn spawn_turn_pipeline(
        self: &Arc<Self>,
        key: &str,
        run_id: &str,
        prompt: &str,
        resume_token: Option<String>,
    ) -> EngineResult<()> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            EngineError::Subprocess(format!(
                "subprocess pool exhausted (max {})",
                self.config.max_processes
            ))
        })?;

        let workspace = self
            .session_for_key(key)
            .await
            .map(|s| s.workspace)
            .ok_or_else(|| EngineError::NotFound(format!("session {key}")))?;

        let (message_tx, mut message_rx) = mpsc::channel(256);
        let cancel = Arc::new(Notify::new());

        let turn_handle = turn::spawn_turn(
            TurnConfig {
                agent_bin: self.config.agent_bin.clone(),
                prompt: prompt.to_string(),
                resume_token,
                working_directory: workspace,
                terminate_timeout: self.config.terminate_timeout,
            },
            message_tx,
            Arc::clone(&cancel),
        )?;

        if let Some(session) = self.sessions.write().await.get_mut(key) {
            session.cancel_turn = Some(cancel);
        }

        self.relay.publish(key, RelayEvent::ThinkingStart).await;

        let supervisor = Arc::clone(self);
        let key = key.to_string();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            let mut bridge = TurnBridge::new();

            while let Some(msg) = message_rx.recv().await {
                let events = bridge.convert(&msg);

                if let Some(token) = bridge.take_resume_token() {
                    supervisor.set_resume_token(&key, token).await;
                }
                if let Some(text) = bridge.take_final_text() {
                    if let Err(e) = supervisor
                        .db
                        .insert_message(&key, &run_id, "assistant", &text)
                        .await
                    {
                        warn!(session_key = %key, error = %e, "Failed to store response");
                    }
                }

                for event in events {
                    supervisor.relay.publish(&key, event).await;
                }
                supervisor.touch(&key).await;
            }

            let outcome = match turn_handle.await {
                Ok(outcome) => outcome,
                Err(e) => TurnOutcome {
                    exit_ok: false,
                    cancelled: false,
                    error: Some(format!("turn task failed: {e}")),
                },
            };
            supervisor.finish_turn(&key, outcome).await;
        });

        Ok(())
    }

    /// End-of-turn continuation. Clean exits return the session to idle and
    /// free the agent's slot; abnormal exits surface a stream error and end
    /// the session; either way the queue can advance.
    async fn finish_turn(self: &Arc<Self>, key: &str, outcome: TurnOutcome) {
        let agent_name = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(key) else {
                // Explicit end (or the watchdog) already tore the session
                // down; nothing left to do.
                return;
            };
            session.busy = false;
            session.cancel_turn = None;
            session.last_activity = Instant::now();
            session.agent_name.clone()
        };

        if outcome.exit_ok {
            debug!(session_key = %key, "Turn finished");
            let _ = self.idle_tx.send(AgentIdle {
                agent_name,
                session_key: key.to_string(),
            });
        } else {
            let reason = outcome
                .error
                .unwrap_or_else(|| "subprocess failed".to_string());
            warn!(session_key = %key, reason = %reason, "Turn failed; ending session");
            self.relay
                .publish(key, RelayEvent::StreamError(reason.clone()))
                .await;
            self.end_by_key(key, RunStatus::Failed, Some(&reason)).await;
        }
    }

    /// Remove a session, cancel its live turn, complete the ledger entry,
    /// close the relay channel, and notify the queue-advance loop.
    async fn end_by_key(self: &Arc<Self>, key: &str, status: RunStatus, message: Option<&str>) {
        let Some(session) = self.sessions.write().await.remove(key) else {
            return;
        };
        self.run_index.write().await.remove(&session.run_id);

        if let Some(cancel) = session.cancel_turn {
            cancel.notify_one();
        }

        if let Err(e) = self
            .ledger
            .complete_run(&session.run_id, status, message)
            .await
        {
            warn!(run_id = %session.run_id, error = %e, "Failed to complete run on end");
        }

        self.relay.close(key).await;

        let _ = self.idle_tx.send(AgentIdle {
            agent_name: session.agent_name,
            session_key: key.to_string(),
        });

        info!(session_key = %key, run_id = %session.run_id, %status, "Session ended");
    }

    /// Per-session inactivity watchdog. Exits when the session goes away;
    /// firing force-ends the session identically to an explicit `end`.
    fn spawn_watchdog(self: &Arc<Self>, key: String) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(supervisor.config.watchdog_interval).await;

                let idle_for = {
                    let sessions = supervisor.sessions.read().await;
                    match sessions.get(&key) {
                        None => break,
                        Some(session) => session.last_activity.elapsed(),
                    }
                };

                if idle_for >= supervisor.config.idle_timeout {
                    warn!(session_key = %key, ?idle_for, "Inactivity watchdog fired");
                    supervisor
                        .relay
                        .publish(
                            &key,
                            RelayEvent::StreamError("inactivity timeout".to_string()),
                        )
                        .await;
                    supervisor
                        .end_by_key(&key, RunStatus::Completed, Some("inactivity timeout"))
                        .await;
                    break;
                }
            }
        });
    }

    async fn set_resume_token(&self, key: &str, token: String) {
        if let Some(session) = self.sessions.write().await.get_mut(key) {
            debug!(session_key = %key, "Resume token captured");
            session.resume_token = Some(token);
        }
    }

    /// Refresh the inactivity clock; called on every protocol message.
    async fn touch(&self, key: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(key) {
            session.last_activity = Instant::now();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::workspace::FixedWorkspace;
    use std::time::Duration;

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            // The stub never spawns in most tests; `true` exits immediately
            // when it does.
            agent_bin: "true".into(),
            max_processes: 3,
            idle_timeout: Duration::from_secs(30),
            watchdog_interval: Duration::from_millis(20),
            terminate_timeout: Duration::from_secs(1),
        }
    }

    async fn test_supervisor(
        config: SupervisorConfig,
    ) -> (
        Arc<WorkSessionSupervisor>,
        mpsc::UnboundedReceiver<AgentIdle>,
    ) {
        let db = Database::open_in_memory().await.unwrap();
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(WorkSessionSupervisor::new(
            db,
            EventRelay::with_defaults(),
            Arc::new(FixedWorkspace::new(std::env::temp_dir())),
            config,
            idle_tx,
        ));
        (supervisor, idle_rx)
    }

    fn start_request(agent: &str, project: &str) -> StartSession {
        StartSession {
            agent_name: agent.to_string(),
            project_id: Some(project.to_string()),
            thread_id: "t-1".to_string(),
            feature_id: Some("f-1".to_string()),
            role: "worker".to_string(),
            prompt: "build the feature".to_string(),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_per_project() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;

        let first = supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        let second = supervisor
            .start(start_request("agent-a", "p1"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id, "same project reuses the session");
        assert_eq!(supervisor.active_count().await, 1);
    }

    #[tokio::test]
    async fn different_projects_get_distinct_sessions() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;

        let a = supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        let b = supervisor.start(start_request("agent-b", "p2")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(supervisor.active_count().await, 2);
    }

    #[tokio::test]
    async fn busy_session_refuses_messages() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;

        let run = supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        // Let the first turn drain, then pin the session busy with a resume
        // token present, as if a second turn were mid-flight.
        for _ in 0..100 {
            if supervisor
                .session_for_key("project:p1")
                .await
                .is_some_and(|s| !s.busy)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let mut sessions = supervisor.sessions.write().await;
            let session = sessions.get_mut("project:p1").unwrap();
            session.busy = true;
            session.resume_token = Some("tok".into());
        }

        let err = supervisor.send_message(&run.id, "another").await.unwrap_err();
        assert!(matches!(err, EngineError::Busy { .. }));
    }

    #[tokio::test]
    async fn first_turn_in_flight_is_not_ready() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;

        let run = supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        {
            let mut sessions = supervisor.sessions.write().await;
            let session = sessions.get_mut("project:p1").unwrap();
            session.busy = false;
            session.resume_token = None;
        }

        let err = supervisor.send_message(&run.id, "too soon").await.unwrap_err();
        assert!(matches!(err, EngineError::NotReady { .. }));
    }

    #[tokio::test]
    async fn end_is_idempotent_and_completes_the_run() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;

        let run = supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        supervisor.end(&run.id).await.unwrap();
        supervisor.end(&run.id).await.unwrap();

        assert_eq!(supervisor.active_count().await, 0);
        let run = supervisor.ledger.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, "completed");
        assert!(run.duration_ms.is_some());
    }

    #[tokio::test]
    async fn end_notifies_the_queue_advance_channel() {
        let (supervisor, mut idle) = test_supervisor(test_config()).await;

        let run = supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        supervisor.end(&run.id).await.unwrap();

        // Drain until the explicit-end notification shows up; the first
        // turn's own completion may race ahead of it.
        let signal = tokio::time::timeout(Duration::from_secs(2), idle.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.agent_name, "agent-a");
        assert_eq!(signal.session_key, "project:p1");
    }

    #[tokio::test]
    async fn subscribers_see_close_on_end() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;

        let run = supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        let mut rx = supervisor.relay().subscribe("project:p1").await;
        supervisor.end(&run.id).await.unwrap();

        // Skip whatever turn events arrived first; Close must terminate the
        // stream.
        let mut saw_close = false;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            if event == RelayEvent::Close {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn watchdog_force_ends_idle_sessions() {
        let config = SupervisorConfig {
            idle_timeout: Duration::from_millis(40),
            watchdog_interval: Duration::from_millis(10),
            ..test_config()
        };
        let (supervisor, _idle) = test_supervisor(config).await;

        let run = supervisor.start(start_request("agent-a", "p1")).await.unwrap();

        // Wait out the idle window plus a couple of watchdog ticks.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(supervisor.active_count().await, 0);
        let run = supervisor.ledger.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.summary.as_deref(), Some("inactivity timeout"));
    }

    #[tokio::test]
    async fn shutdown_ends_every_session() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;

        supervisor.start(start_request("agent-a", "p1")).await.unwrap();
        supervisor.start(start_request("agent-b", "p2")).await.unwrap();
        assert_eq!(supervisor.active_count().await, 2);

        supervisor.shutdown().await;
        assert_eq!(supervisor.active_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found_for_send() {
        let (supervisor, _idle) = test_supervisor(test_config()).await;
        let err = supervisor.send_message("ghost", "hello").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
