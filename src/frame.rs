//! Incremental decoding of the chat event stream.
//!
//! Network reads arrive as arbitrary byte chunks. [`Utf8Decoder`] turns them
//! into text while carrying partial characters across chunks, and
//! [`FrameParser`] reassembles that text into lines and extracts the
//! `data: <json>` frames. [`FrameDecoder`] chains the two.

use crate::protocol::Frame;
use tracing::trace;

const DATA_PREFIX: &str = "data: ";

/// Stateful UTF-8 decoder that never splits a character across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `bytes` as forms complete characters.
    ///
    /// A trailing incomplete sequence is held back until the next call.
    /// Invalid sequences decode to U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    let prefix = std::str::from_utf8(&self.pending[..valid_up_to]);
                    text.push_str(prefix.unwrap_or_default());
                    match err.error_len() {
                        Some(invalid_len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid_len);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return text;
                        }
                    }
                }
            }
        }
    }

    /// Flushes a dangling partial character at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Line-buffering parser for `data: ` framed events.
///
/// Text that does not yet end in a newline stays in the residual buffer. There
/// is no line length limit: a peer that never sends a newline grows the buffer
/// without bound.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a decoded fragment and returns every frame completed by it, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<Frame> {
        self.buffer.push_str(fragment);
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let residual = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, residual);
        complete.split('\n').filter_map(parse_line).collect()
    }

    /// Resolves the residual buffer as a final line once the stream has ended.
    pub fn finish(&mut self) -> Option<Frame> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }

    pub fn residual(&self) -> &str {
        &self.buffer
    }
}

fn parse_line(line: &str) -> Option<Frame> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    match serde_json::from_str::<Frame>(payload) {
        Ok(frame) => Some(frame),
        Err(err) => {
            trace!(error = %err, line, "discarding malformed frame");
            None
        }
    }
}

/// Bytes in, frames out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    text: Utf8Decoder,
    lines: FrameParser,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let text = self.text.decode(bytes);
        if text.is_empty() {
            return Vec::new();
        }
        self.lines.push(&text)
    }

    pub fn finish(&mut self) -> Option<Frame> {
        let tail = self.text.finish();
        self.lines.buffer.push_str(&tail);
        if !self.lines.residual().is_empty() {
            trace!(residual = self.lines.residual(), "flushing unterminated line at end of body");
        }
        self.lines.finish()
    }
}
