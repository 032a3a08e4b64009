//! Newline framing for chunked JSON streams.
//!
//! A [`Framer`] accumulates raw bytes from one stream (child stdout, an HTTP
//! response body, the HTTP event channel) and yields one decoded JSON value
//! per complete line. Chunks may split a message anywhere, including inside a
//! multi-byte UTF-8 sequence; nothing is decoded until its terminating `\n`
//! has arrived.
//!
//! Lines that are empty or do not start with `{` / `[` are treated as stray
//! log output and skipped. A line holding several back-to-back JSON values
//! (`{"a":1}{"b":2}`) yields each of them. Malformed JSON is reported as
//! [`SdkError::Decode`] carrying the raw line and the stream identity, after
//! which framing continues with the next line. A line that is not valid
//! UTF-8 is reported the same way rather than decoded with replacement
//! characters.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut framer = Framer::new("stdout");
//! for frame in framer.feed(chunk) {
//!     match frame {
//!         Ok(value) => route(value),
//!         Err(err) => warn!(%err, "skipping malformed line"),
//!     }
//! }
//! // At end of stream, flush an unterminated trailing line.
//! for frame in framer.finish() { /* … */ }
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::debug;

use crate::{Result, SdkError};

/// Default maximum accepted line length: 1 MiB.
///
/// Longer lines are reported once as a decode error and their remaining
/// bytes are discarded up to the next newline, so an unterminated or hostile
/// stream cannot grow the buffer without bound.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Bytes of an oversized line kept in the decode error for diagnostics.
const OVERSIZE_PREVIEW_BYTES: usize = 256;

/// Incremental NDJSON framer bound to one stream.
#[derive(Debug)]
pub struct Framer {
    stream: String,
    buf: BytesMut,
    /// Bytes at the front of `buf` already searched for a newline.
    scanned: usize,
    max_line_bytes: usize,
    /// Inside an oversized line; drop bytes until the next newline.
    discarding: bool,
    /// Values decoded from a line but not yet handed out.
    ready: VecDeque<Result<Value>>,
}

impl Framer {
    /// Create a framer for `stream` with the default [`MAX_LINE_BYTES`] ceiling.
    #[must_use]
    pub fn new(stream: impl Into<String>) -> Self {
        Self::with_max_line_bytes(stream, MAX_LINE_BYTES)
    }

    /// Create a framer with an explicit line ceiling.
    #[must_use]
    pub fn with_max_line_bytes(stream: impl Into<String>, max_line_bytes: usize) -> Self {
        Self {
            stream: stream.into(),
            buf: BytesMut::new(),
            scanned: 0,
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
            ready: VecDeque::new(),
        }
    }

    /// Stream identity used in decode errors.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Bytes held past the last confirmed message boundary.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `chunk` and iterate over every message it completes.
    ///
    /// The iterator is lazy: frames not pulled before it is dropped remain
    /// buffered and are yielded by the next `feed` or `finish` call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(chunk);
        Frames {
            framer: self,
            eof: false,
        }
    }

    /// Signal end of stream, yielding any unterminated trailing line.
    pub fn finish(&mut self) -> Frames<'_> {
        Frames {
            framer: self,
            eof: true,
        }
    }

    /// Drop all buffered state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.discarding = false;
        self.ready.clear();
    }

    fn next_frame(&mut self, eof: bool) -> Option<Result<Value>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(frame);
            }
            match self.next_line(eof)? {
                Ok(line) => self.decode_line(&line),
                Err(err) => return Some(Err(err)),
            }
        }
    }

    /// Split the next complete line off the buffer, newline excluded.
    fn next_line(&mut self, eof: bool) -> Option<Result<Bytes>> {
        loop {
            let found = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);

            if let Some(end) = found {
                let mut line = self.buf.split_to(end + 1);
                line.truncate(end);
                self.scanned = 0;

                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                if line.len() > self.max_line_bytes {
                    return Some(Err(self.oversize_error(&line)));
                }
                return Some(Ok(line.freeze()));
            }

            self.scanned = self.buf.len();

            if self.buf.len() > self.max_line_bytes {
                let dropped = self.buf.split();
                self.scanned = 0;
                if self.discarding {
                    return None;
                }
                self.discarding = true;
                return Some(Err(self.oversize_error(&dropped)));
            }

            if eof && !self.buf.is_empty() {
                let line = self.buf.split();
                self.scanned = 0;
                if std::mem::take(&mut self.discarding) {
                    return None;
                }
                return Some(Ok(line.freeze()));
            }

            return None;
        }
    }

    fn decode_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim();

        if trimmed.is_empty() {
            return;
        }
        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
            debug!(stream = %self.stream, line = trimmed, "framer: skipping non-JSON line");
            return;
        }

        if let Err(err) = std::str::from_utf8(line) {
            self.ready.push_back(Err(SdkError::Decode {
                stream: self.stream.clone(),
                raw: trimmed.to_owned(),
                reason: format!("invalid UTF-8: {err}"),
            }));
            return;
        }

        for item in serde_json::Deserializer::from_str(trimmed).into_iter::<Value>() {
            match item {
                Ok(value) => self.ready.push_back(Ok(value)),
                Err(err) => {
                    self.ready
                        .push_back(Err(SdkError::decode(&self.stream, trimmed, &err)));
                    break;
                }
            }
        }
    }

    fn oversize_error(&self, line: &[u8]) -> SdkError {
        let preview = &line[..line.len().min(OVERSIZE_PREVIEW_BYTES)];
        SdkError::Decode {
            stream: self.stream.clone(),
            raw: String::from_utf8_lossy(preview).into_owned(),
            reason: format!("line too long: exceeded {} bytes", self.max_line_bytes),
        }
    }
}

/// Lazy iterator over the frames completed by one `feed`/`finish` call.
#[derive(Debug)]
pub struct Frames<'a> {
    framer: &'a mut Framer,
    eof: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame(self.eof)
    }
}
