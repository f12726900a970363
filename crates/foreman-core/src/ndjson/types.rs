//! Message types for the assistant NDJSON protocol.

use serde_json::Value;
use std::path::PathBuf;

/// Canonical message types from the assistant stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    Result(TurnResult),
    Unknown { msg_type: String, payload: Value },
}

/// System initialization message. Carries the resumable session token used
/// for every later turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
}

/// Complete assistant message with ordered content blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

/// Content block in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Turn completion result. Carries the final full response text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub kind: ResultKind,
    pub session_id: String,
    pub text: String,
    pub duration_ms: u64,
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultKind {
    #[default]
    Success,
    Error,
    Unknown(String),
}

impl ResultKind {
    /// Whether this result reports a successful turn.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
