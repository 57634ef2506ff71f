//! Incremental decoder for streamed chat replies
//!
//! The chat endpoint streams `data: {...}` lines terminated by a
//! `data: [DONE]` sentinel. Network chunks may split lines (and UTF-8
//! sequences) anywhere, so bytes are buffered until a full line is seen.

use fleety_shared::ChatStreamChunk;

const DATA_PREFIX: &str = "data:";

/// Payload of the end-of-stream line
pub const DONE_SENTINEL: &str = "[DONE]";

/// Meaningful line of a chat stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text (may be empty for role-only chunks)
    Delta(String),
    /// End-of-stream sentinel
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk and return the events of every completed line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

/// Parse one line. Non-data lines and malformed payloads yield nothing.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    let data = line.strip_prefix(DATA_PREFIX)?;
    let data = data.strip_prefix(' ').unwrap_or(data);

    if data.trim() == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<ChatStreamChunk>(data) {
        Ok(chunk) => Some(StreamEvent::Delta(chunk.delta_text().to_string())),
        Err(e) => {
            tracing::trace!(error = %e, "Skipping malformed stream line");
            None
        }
    }
}
