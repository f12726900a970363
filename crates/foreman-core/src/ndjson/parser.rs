//! NDJSON parser and incremental line decoder.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! passed through as [`Message::Unknown`] so callers can skip them.

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Incremental decoder that reassembles newline-delimited lines from raw
/// byte chunks.
///
/// Subprocess stdout arrives in arbitrary read-sized chunks; a JSON line may
/// span several chunks or a chunk may hold several lines. Bytes are buffered
/// until a `\n` completes a line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    ///
    /// Trailing `\r` is stripped so CRLF output decodes the same as LF.
    /// Empty lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    /// Drain any trailing partial line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }
}

/// Parse a single NDJSON line from the assistant's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::NdjsonDecode("Missing 'type' field".into()))?;

    match msg_type {
        "system" => Ok(parse_system(raw)),
        "assistant" => Ok(parse_assistant(raw)),
        "result" => Ok(parse_result(raw)),
        _ => Ok(Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn parse_system(raw: &Value) -> Message {
    // Only the init subtype carries the resumable session token; other
    // system messages are informational and skipped.
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    if subtype != "init" {
        return Message::Unknown {
            msg_type: format!("system/{subtype}"),
            payload: raw.clone(),
        };
    }

    let session_id = raw
        .get("session_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let model = raw
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let cwd = raw
        .get("cwd")
        .and_then(|v| v.as_str())
        .map(std::path::PathBuf::from)
        .unwrap_or_default();

    Message::SystemInit(SystemInit {
        session_id,
        model,
        cwd,
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let content = parse_content_blocks(msg.get("content"));
    Message::Assistant(AssistantMessage { content })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    let Some(arr) = content.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|block| {
            let block_type = block.get("type")?.as_str()?;
            match block_type {
                "text" => {
                    let text = block.get("text")?.as_str()?.to_string();
                    Some(ContentBlock::Text { text })
                }
                "tool_use" => {
                    let id = block.get("id")?.as_str()?.to_string();
                    let name = block.get("name")?.as_str()?.to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                _ => None,
            }
        })
        .collect()
}

fn parse_result(raw: &Value) -> Message {
    let kind = match raw.get("subtype").and_then(|v| v.as_str()) {
        Some("success") | None => ResultKind::Success,
        Some(other) if other.starts_with("error") => ResultKind::Error,
        Some(other) => ResultKind::Unknown(other.to_string()),
    };

    let session_id = raw
        .get("session_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let text = raw
        .get("result")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let duration_ms = raw.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0);

    Message::Result(TurnResult {
        kind,
        session_id,
        text,
        duration_ms,
    })
}
