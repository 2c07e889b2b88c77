//! Incremental decoder for newline-delimited JSON stream bodies.
//!
//! Each complete line is one record. A record that fails to parse, or whose
//! shape is unknown, is logged and skipped; decoding carries on with the next
//! line. A `complete` record ends decoding for the stream and any later input
//! is ignored.
//!
//! Buffering is done on bytes, so a multi-byte character split across two
//! reads is reassembled before the line is parsed.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ChatError;
use crate::models::StreamEvent;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    UserMessageId {
        #[serde(default)]
        user_message_id: Value,
    },
    AiChunk {
        #[serde(default)]
        content: Option<String>,
    },
    Complete {
        #[serde(default)]
        ai_message_id: Option<i64>,
    },
}

/// Per-stream decoder state. Create a fresh one for every response body.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    completed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a `complete` record has been decoded.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Feeds one fragment and returns the events of every line it completed.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<StreamEvent> {
        if self.completed {
            return Vec::new();
        }
        self.buffer.extend_from_slice(fragment);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(event) = decode_line(&self.buffer[start..end]) {
                let done = matches!(event, StreamEvent::Completed { .. });
                events.push(event);
                if done {
                    self.completed = true;
                    self.buffer.clear();
                    return events;
                }
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        events
    }

    pub fn push_str(&mut self, fragment: &str) -> Vec<StreamEvent> {
        self.push(fragment.as_bytes())
    }

    /// Decodes whatever is left once the body has ended. A last record
    /// without a trailing newline is still delivered.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.completed {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let event = decode_line(&rest);
        if matches!(event, Some(StreamEvent::Completed { .. })) {
            self.completed = true;
        }
        event
    }
}

fn decode_line(line: &[u8]) -> Option<StreamEvent> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match parse_record(line) {
        Ok(event) => event,
        Err(err) => {
            warn!(
                record = %String::from_utf8_lossy(line),
                "Skipping stream record: {err}"
            );
            None
        }
    }
}

fn parse_record(line: &[u8]) -> Result<Option<StreamEvent>, ChatError> {
    let value: Value = serde_json::from_slice(line).map_err(|e| ChatError::Decode {
        message: e.to_string(),
    })?;
    let record = Record::deserialize(value).map_err(|e| ChatError::Protocol {
        message: e.to_string(),
    })?;

    let event = match record {
        Record::UserMessageId { user_message_id } => match user_message_id.as_i64() {
            Some(id) if id != 0 => Some(StreamEvent::UserMessageAssigned { id }),
            _ if is_truthy(&user_message_id) => {
                return Err(ChatError::Protocol {
                    message: format!("user_message_id is not an integer: {user_message_id}"),
                });
            }
            _ => {
                debug!("Ignoring user_message_id record without an id");
                None
            }
        },
        Record::AiChunk { content: Some(text) } => Some(StreamEvent::Chunk { text }),
        Record::AiChunk { content: None } => {
            debug!("Ignoring ai_chunk record without content");
            None
        }
        Record::Complete { ai_message_id } => Some(StreamEvent::Completed {
            assistant_message_id: ai_message_id,
        }),
    };
    Ok(event)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
