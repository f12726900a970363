//! Work-session types.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Configuration for the work-session supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the assistant CLI binary.
    pub agent_bin: PathBuf,
    /// Maximum concurrent assistant subprocesses across all sessions.
    pub max_processes: usize,
    /// Inactivity window before the watchdog force-ends a session.
    pub idle_timeout: Duration,
    /// How often the watchdog checks for idle sessions.
    pub watchdog_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when cancelling a turn.
    pub terminate_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_bin: PathBuf::from("claude"),
            max_processes: 5,
            idle_timeout: Duration::from_secs(30 * 60),
            watchdog_interval: Duration::from_secs(30),
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Build supervisor settings from the loaded configuration file.
    pub fn from_config(config: &foreman_core::Config) -> Self {
        Self {
            agent_bin: config.engine.agent_bin.clone(),
            max_processes: config.engine.max_processes as usize,
            idle_timeout: Duration::from_secs(config.sessions.idle_timeout_secs),
            watchdog_interval: Duration::from_secs(config.sessions.watchdog_interval_secs),
            terminate_timeout: Duration::from_secs(config.sessions.terminate_timeout_secs),
        }
    }
}

/// Request to start (or idempotently reuse) a work session.
#[derive(Debug, Clone)]
pub struct StartSession {
    pub agent_name: String,
    /// Project scope; sessions without one are scoped per thread.
    pub project_id: Option<String>,
    pub thread_id: String,
    /// Feature the run works on. Sessions without one (ad-hoc threads) are
    /// ledgered against the thread id.
    pub feature_id: Option<String>,
    pub role: String,
    pub prompt: String,
}

/// Registry entry for one live session.
#[derive(Debug, Clone)]
pub struct WorkSession {
    pub run_id: String,
    pub agent_name: String,
    pub project_id: Option<String>,
    pub thread_id: String,
    /// Opaque resume handle, set once the first turn's init arrives.
    pub resume_token: Option<String>,
    /// A turn is in flight; `send_message` is refused while set.
    pub busy: bool,
    pub last_activity: Instant,
    pub workspace: PathBuf,
    /// Cancellation handle for the live turn, if any.
    pub(crate) cancel_turn: Option<Arc<Notify>>,
}

/// Notification that an agent's slot is free and its queue can advance.
#[derive(Debug, Clone)]
pub struct AgentIdle {
    pub agent_name: String,
    pub session_key: String,
}

/// Registry key: one active session per project, per thread otherwise.
pub fn session_key(project_id: Option<&str>, thread_id: &str) -> String {
    project_id.map_or_else(
        || format!("thread:{thread_id}"),
        |project| format!("project:{project}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_scope_wins_over_thread() {
        assert_eq!(session_key(Some("p1"), "t1"), "project:p1");
        assert_eq!(session_key(None, "t1"), "thread:t1");
    }

    #[test]
    fn same_project_different_threads_share_a_key() {
        assert_eq!(
            session_key(Some("p1"), "t1"),
            session_key(Some("p1"), "t2")
        );
    }

    #[test]
    fn settings_map_from_the_config_file() {
        let mut config = foreman_core::Config::default();
        config.engine.agent_bin = PathBuf::from("/opt/assistant");
        config.engine.max_processes = 2;
        config.sessions.idle_timeout_secs = 90;

        let settings = SupervisorConfig::from_config(&config);
        assert_eq!(settings.agent_bin, PathBuf::from("/opt/assistant"));
        assert_eq!(settings.max_processes, 2);
        assert_eq!(settings.idle_timeout, Duration::from_secs(90));
        assert_eq!(settings.terminate_timeout, Duration::from_secs(5));
    }
}
