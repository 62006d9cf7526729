//! Newline framing for the rchat byte stream.
//!
//! Wire format: `<UTF-8 text>\n`. A trailing `\r` is tolerated and stripped.

use tracing::warn;

use crate::error::{ChatError, ChatResult};

/// Largest line accepted from a peer (1 MiB).
///
/// A full 64 KiB file chunk is ~118 KB once base64-encoded twice and sealed.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Terminate a frame for the wire.
pub fn frame_line(text: &str) -> String {
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    line.push('\n');
    line
}

/// Streaming line decoder: accumulates bytes and yields complete lines.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_LINE_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    /// Feed bytes into the decoder and return all complete lines.
    ///
    /// A line that is not UTF-8 is dropped and the rest of the batch kept.
    /// Only an oversized line is an error.
    pub fn feed(&mut self, data: &[u8]) -> ChatResult<Vec<String>> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if raw.len() > self.max_len {
                return Err(ChatError::InvalidMessage(format!(
                    "line too long: {} bytes",
                    raw.len()
                )));
            }
            match String::from_utf8(raw) {
                Ok(line) => lines.push(line),
                Err(e) => warn!(error = %e, "dropping line that is not UTF-8"),
            }
        }

        if self.buffer.len() > self.max_len {
            return Err(ChatError::InvalidMessage(format!(
                "line too long: more than {} bytes without newline",
                self.max_len
            )));
        }

        Ok(lines)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes buffered without a terminating newline yet.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
