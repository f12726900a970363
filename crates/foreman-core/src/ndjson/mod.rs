//! NDJSON decoding for the coding-assistant stream-json protocol.
//!
//! The assistant CLI writes one JSON object per stdout line. This module
//! provides the canonical message types, a tolerant single-line parser, an
//! incremental byte decoder that reassembles lines across read-chunk
//! boundaries, and the human-readable tool status lines relayed to
//! subscribers.

mod describe;
mod parser;
mod types;

pub use describe::tool_status_line;
pub use parser::{LineDecoder, parse_line, parse_value};
pub use types::{AssistantMessage, ContentBlock, Message, ResultKind, SystemInit, TurnResult};
