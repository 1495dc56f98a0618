//! Newline-delimited JSON framing for child stdout.
//!
//! [`LineFramer`] is a [`Decoder`] so each child's stdout can be wrapped in a
//! `FramedRead`. The read buffer doubles as the residue: bytes after the last
//! newline stay there until a later read completes the line.

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::Decoder;

/// Longest line accepted from a child, in bytes.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into complete JSON objects, one per line.
///
/// Empty lines are skipped. Lines that are not JSON objects, and lines over
/// [`MAX_LINE_BYTES`], are logged and dropped.
#[derive(Debug)]
pub struct LineFramer {
    child: String,
    /// Bytes of the buffer already scanned for a newline.
    scanned: usize,
    /// Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl LineFramer {
    pub fn new(child: impl Into<String>) -> Self {
        Self {
            child: child.into(),
            scanned: 0,
            discarding: false,
        }
    }

    fn parse_line(&self, line: &[u8]) -> Option<Value> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value @ Value::Object(_)) => Some(value),
            Ok(other) => {
                tracing::warn!(child = %self.child, "Dropping non-object message: {other}");
                None
            }
            Err(e) => {
                tracing::warn!(
                    child = %self.child,
                    "Dropping malformed line: {e}: {}",
                    String::from_utf8_lossy(line)
                );
                None
            }
        }
    }
}

impl Decoder for LineFramer {
    type Item = Value;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, Self::Error> {
        loop {
            let newline = buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if self.discarding {
                    buf.clear();
                    self.scanned = 0;
                } else if buf.len() > MAX_LINE_BYTES {
                    tracing::warn!(
                        child = %self.child,
                        "Line exceeds {MAX_LINE_BYTES} bytes, discarding it"
                    );
                    self.discarding = true;
                    buf.clear();
                    self.scanned = 0;
                } else {
                    self.scanned = buf.len();
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            let line = buf.split_to(end + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if end > MAX_LINE_BYTES {
                tracing::warn!(
                    child = %self.child,
                    "Line exceeds {MAX_LINE_BYTES} bytes, discarding it"
                );
                continue;
            }
            if let Some(value) = self.parse_line(&line[..end]) {
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, Self::Error> {
        if let Some(value) = self.decode(buf)? {
            return Ok(Some(value));
        }
        if !buf.is_empty() {
            tracing::debug!(
                child = %self.child,
                "Dropping {} unterminated bytes at end of stream",
                buf.len()
            );
            buf.clear();
        }
        self.scanned = 0;
        Ok(None)
    }
}
