//! Protocol-to-relay event bridge.
//!
//! Converts decoded NDJSON messages from one subprocess turn into relay
//! events, tracking the per-turn block counter for separators and capturing
//! the resume token and final response text along the way.

use tracing::debug;

use foreman_core::ndjson::{ContentBlock, Message, tool_status_line};

use crate::relay::{BLOCK_SEPARATOR, RelayEvent};

/// Per-turn conversion state. One bridge per turn; the block counter starts
/// at zero and resets again when the result arrives.
#[derive(Debug, Default)]
pub(crate) struct TurnBridge {
    blocks_emitted: usize,
    resume_token: Option<String>,
    final_text: Option<String>,
    result_ok: bool,
}

impl TurnBridge {
    pub fn new() -> Self {
        Self {
            result_ok: true,
            ..Self::default()
        }
    }

    /// Convert one message into the relay events it produces.
    pub fn convert(&mut self, msg: &Message) -> Vec<RelayEvent> {
        match msg {
            Message::SystemInit(init) => {
                self.resume_token = Some(init.session_id.clone());
                self.blocks_emitted = 0;
                Vec::new()
            }
            Message::Assistant(assistant) => {
                let mut events = Vec::new();
                for block in &assistant.content {
                    if self.blocks_emitted > 0 {
                        events.push(RelayEvent::Token(BLOCK_SEPARATOR.to_string()));
                    }
                    match block {
                        ContentBlock::Text { text } => {
                            events.push(RelayEvent::Token(text.clone()));
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            events.push(RelayEvent::Token(tool_status_line(name, input)));
                        }
                    }
                    self.blocks_emitted += 1;
                }
                events
            }
            Message::Result(result) => {
                self.final_text = Some(result.text.clone());
                self.result_ok = result.kind.is_success();
                self.blocks_emitted = 0;
                vec![RelayEvent::ThinkingEnd]
            }
            Message::Unknown { msg_type, .. } => {
                debug!(msg_type, "Skipping unknown protocol message");
                Vec::new()
            }
        }
    }

    /// Resume token captured from `system/init`, if it arrived yet.
    pub fn take_resume_token(&mut self) -> Option<String> {
        self.resume_token.take()
    }

    /// Final response text captured from `result`, if it arrived yet.
    pub fn take_final_text(&mut self) -> Option<String> {
        self.final_text.take()
    }

    /// Whether the turn's result reported success.
    pub const fn result_ok(&self) -> bool {
        self.result_ok
    }
}
