//! Incremental decoder for the `text/event-stream` reply body.
//!
//! Each frame carries one JSON object in its `data:` field:
//! `{"type": "chunk" | "command" | "complete" | "error", ...}`.

use super::StreamEvent;
use crate::models::Message;
use serde::Deserialize;
use tracing::warn;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Chunk {
        content: Option<String>,
        data: Option<serde_json::Value>,
    },
    Command {
        message: Option<Message>,
        content: Option<String>,
        data: Option<serde_json::Value>,
    },
    Complete {
        message: Option<Message>,
    },
    Error {
        error: Option<String>,
    },
    #[serde(other)]
    Other,
}

pub struct SseDecoder {
    chat_id: String,
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            pending: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Feeds raw body bytes. Frames split across calls are held back until
    /// complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            self.line(line, &mut events);
        }

        events
    }

    /// Flushes a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            self.line(&line, &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
    }

    fn dispatch(&mut self, events: &mut Vec<StreamEvent>) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();

        if payload == "[DONE]" {
            return;
        }

        match serde_json::from_str::<WireEvent>(&payload) {
            Ok(wire) => {
                if let Some(event) = self.convert(wire) {
                    events.push(event);
                }
            }
            Err(e) => warn!("Skipping malformed stream frame: {}", e),
        }
    }

    fn convert(&self, wire: WireEvent) -> Option<StreamEvent> {
        match wire {
            WireEvent::Chunk { content, data } => {
                let text = content.or_else(|| data.and_then(|d| d.as_str().map(String::from)))?;
                Some(StreamEvent::Chunk(text))
            }
            WireEvent::Command {
                message,
                content,
                data,
            } => {
                if let Some(message) = message {
                    return Some(StreamEvent::Command(message));
                }
                let text = content.or_else(|| data.map(|d| d.to_string()))?;
                Some(StreamEvent::Command(Message::assistant(&self.chat_id, &text)))
            }
            WireEvent::Complete { message } => Some(StreamEvent::Complete(message)),
            WireEvent::Error { error } => Some(StreamEvent::Error(
                error.unwrap_or_else(|| "Unknown stream error".to_string()),
            )),
            WireEvent::Other => None,
        }
    }
}
