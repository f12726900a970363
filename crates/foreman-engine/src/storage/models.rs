//! Database models for the Foreman engine.

use serde::{Deserialize, Serialize};

/// Feature record from the database.
///
/// `dependencies` holds a JSON array of feature ids; use
/// [`FeatureRow::dependency_ids`] to decode it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeatureRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub priority: i64,
    pub status: String,
    pub dependencies: String,
    pub assigned_agent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl FeatureRow {
    /// Decode the JSON dependency set. Malformed data reads as empty.
    pub fn dependency_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.dependencies).unwrap_or_default()
    }
}

/// Feature status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStatus {
    Pending,
    InProgress,
    ReviewReady,
    Passing,
    Failing,
}

impl FeatureStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::ReviewReady => "review_ready",
            Self::Passing => "passing",
            Self::Failing => "failing",
        }
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Agent run record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRow {
    pub id: String,
    pub agent_id: String,
    pub project_id: String,
    pub feature_id: String,
    pub role: String,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub output: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Agent run status state machine:
/// `started → {thinking|coding|testing|reviewing} → {completed|failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started,
    Thinking,
    Coding,
    Testing,
    Reviewing,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Thinking => "thinking",
            Self::Coding => "coding",
            Self::Testing => "testing",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are entered exactly once and never left.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Human-readable phase label relayed to session subscribers.
    pub const fn phase_label(&self) -> &'static str {
        match self {
            Self::Started => "starting up",
            Self::Thinking => "thinking",
            Self::Coding => "writing code",
            Self::Testing => "running tests",
            Self::Reviewing => "reviewing changes",
            Self::Completed => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queued job record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub agent_name: String,
    pub project_id: String,
    pub prompt: String,
    pub position: i64,
    pub status: String,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Queued job status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable message record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub session_key: String,
    pub run_id: String,
    pub role: String,
    pub content: String,
    pub created_at: i64,
}
