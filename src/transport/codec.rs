//! Newline-delimited JSON-RPC codec
//!
//! The child's stdout carries protocol envelopes interleaved with banners and
//! other diagnostic text. The decoder keeps one carry-over buffer, remembers
//! how far it has already scanned, and only yields lines that parse into an
//! envelope. Everything else is dropped without failing the stream.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Incoming, Outgoing};

/// Default longest accepted line: 16 MiB
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Codec for both directions of the child's stdio
#[derive(Debug)]
pub struct EnvelopeCodec {
    /// Bytes of the buffered partial line already searched for a newline
    next_index: usize,
    max_line_bytes: usize,
    /// Set while skipping the remainder of an oversized line
    discarding: bool,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            next_index: 0,
            max_line_bytes,
            discarding: false,
        }
    }

    /// Split the next complete line off the front of `src`, newline removed.
    fn next_line(&mut self, src: &mut BytesMut) -> Option<BytesMut> {
        loop {
            let offset = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = offset else {
                if self.discarding || src.len() > self.max_line_bytes {
                    if !self.discarding {
                        tracing::warn!(
                            max_line_bytes = self.max_line_bytes,
                            "Discarding oversized line from tool server"
                        );
                    }
                    self.discarding = true;
                    src.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = src.len();
                }
                return None;
            };

            let newline = self.next_index + offset;
            self.next_index = 0;
            let mut line = src.split_to(newline + 1);
            line.truncate(newline);

            if self.discarding {
                // Tail end of a line that was already dropped
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_line_bytes {
                tracing::warn!(
                    line_bytes = line.len(),
                    max_line_bytes = self.max_line_bytes,
                    "Discarding oversized line from tool server"
                );
                continue;
            }

            return Some(line);
        }
    }
}

/// Parse one complete line, returning `None` for anything that is not an envelope.
pub fn parse_line(line: &[u8]) -> Option<Incoming> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();

    if !text.starts_with('{') {
        if !text.is_empty() {
            tracing::debug!(target: "tool_bridge::child", "{}", text);
        }
        return None;
    }

    match serde_json::from_str(text) {
        Ok(value) => {
            let message = Incoming::classify(value);
            if message.is_none() {
                tracing::debug!(line = %text, "Dropping JSON line with no envelope shape");
            }
            message
        }
        Err(e) => {
            tracing::debug!(error = %e, line = %text, "Dropping malformed protocol line");
            None
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Incoming;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.next_line(src) {
            if let Some(message) = parse_line(&line) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }

        // Final line without a trailing newline
        let line = src.split_to(src.len());
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        Ok(parse_line(&line))
    }
}

impl Encoder<Outgoing> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Compact serde_json output never contains a raw newline
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
