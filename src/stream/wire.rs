//! Incremental decoder for the `text/event-stream` wire format.
//!
//! The decoder is transport-agnostic: it consumes body chunks as they arrive
//! and yields complete frames, carrying partial lines and half-built frames
//! across chunk boundaries. Comment lines, `id:`/`retry:` fields, and unknown
//! fields are tolerated and skipped.

/// Event name applied when a frame carries no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// One complete wire-level event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    /// Server-declared event name, when the frame carried one.
    pub event: Option<String>,
    /// Payload with multi-line `data:` fields joined by newlines.
    pub data: String,
}

/// Stateful `text/event-stream` decoder.
///
/// Feed raw body chunks in arrival order; every call returns the frames
/// completed by that chunk. Lines may end in LF, CRLF, or a bare CR, and may
/// be split at any byte by chunking.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    skip_leading_lf: bool,
    at_stream_start: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            event: None,
            data: Vec::new(),
            skip_leading_lf: false,
            at_stream_start: true,
        }
    }

    /// Decodes one body chunk, returning the frames it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if self.skip_leading_lf {
                self.skip_leading_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }

            match byte {
                b'\n' => self.end_line(&mut frames),
                b'\r' => {
                    self.end_line(&mut frames);
                    self.skip_leading_lf = true;
                }
                other => self.line.push(other),
            }
        }

        frames
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        let mut raw = std::mem::take(&mut self.line);
        if self.at_stream_start {
            self.at_stream_start = false;
            if raw.starts_with(UTF8_BOM) {
                raw.drain(..UTF8_BOM.len());
            }
        }

        let line = String::from_utf8_lossy(&raw).into_owned();
        if line.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return;
        }
        self.process_field_line(&line);
    }

    /// Drains the current frame buffers.
    ///
    /// An empty data buffer yields nothing but still resets the event name.
    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }

    fn process_field_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // `id` and `retry` are part of the format but unused here; the
            // reconnect schedule is owned by the client, not the server.
            _ => {}
        }
    }
}
