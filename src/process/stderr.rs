//! Size-capped, line-oriented stderr capture.
//!
//! Child stderr is diagnostics only. It is kept so a non-zero exit can be
//! reported with context, but a chatty or hostile child must not be able to
//! exhaust memory, so retention is capped at a configured byte ceiling:
//!
//! - complete lines are retained newest-last; once the ceiling would be
//!   exceeded the oldest whole lines are evicted;
//! - a single line longer than the ceiling is dropped entirely (it can never
//!   fit without being cut);
//! - the unterminated tail counts against the same ceiling, so a snapshot
//!   is never longer than the ceiling; a tail that alone outgrows it is
//!   dropped up to the next newline.

use std::collections::VecDeque;

/// Bounded stderr ring.
#[derive(Debug)]
pub struct StderrBuffer {
    ceiling: usize,
    lines: VecDeque<String>,
    /// Bytes charged for `lines`: each line costs its length plus one newline.
    retained: usize,
    partial: Vec<u8>,
    /// The current partial line overflowed; skip to the next newline.
    skipping: bool,
    dropped: u64,
}

impl StderrBuffer {
    /// Create a buffer retaining at most `ceiling` bytes.
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            lines: VecDeque::new(),
            retained: 0,
            partial: Vec::new(),
            skipping: false,
            dropped: 0,
        }
    }

    /// Configured ceiling.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Bytes currently retained, complete lines plus the unterminated tail
    /// (never above the ceiling).
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.retained + self.partial.len()
    }

    /// Bytes discarded so far, whether evicted or never retained.
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }

    /// `true` when nothing has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    /// Append a raw chunk read from the pipe.
    pub fn push(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.skipping {
                self.skipping = false;
                self.dropped += head.len() as u64 + 1;
                continue;
            }

            self.partial.extend_from_slice(head);
            let raw = std::mem::take(&mut self.partial);
            let line = String::from_utf8_lossy(&raw);
            self.commit(line.trim_end_matches('\r').to_owned());
        }

        if rest.is_empty() {
            return;
        }
        if self.skipping {
            self.dropped += rest.len() as u64;
            return;
        }
        self.partial.extend_from_slice(rest);
        if self.partial.len() > self.ceiling {
            self.dropped += self.partial.len() as u64;
            self.partial.clear();
            self.skipping = true;
            return;
        }
        self.evict_until(self.partial.len());
    }

    /// Treat an unterminated tail as a complete line (stream closed).
    pub fn flush_partial(&mut self) {
        self.skipping = false;
        if self.partial.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&raw).into_owned();
        self.commit(line);
    }

    /// Retained lines joined with `\n`, followed by any unterminated tail.
    #[must_use]
    pub fn snapshot(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if !self.partial.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&String::from_utf8_lossy(&self.partial));
        }
        out
    }

    fn commit(&mut self, line: String) {
        let cost = line.len() + 1;
        if cost > self.ceiling {
            self.dropped += cost as u64;
            return;
        }
        self.evict_until(cost);
        self.retained += cost;
        self.lines.push_back(line);
    }

    /// Evict the oldest lines until `extra` more bytes fit under the ceiling.
    fn evict_until(&mut self, extra: usize) {
        while self.retained + extra > self.ceiling {
            match self.lines.pop_front() {
                Some(old) => {
                    self.retained -= old.len() + 1;
                    self.dropped += old.len() as u64 + 1;
                }
                None => break,
            }
        }
    }
}
