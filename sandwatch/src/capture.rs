//! Bounded per-command output capture.
//!
//! Each command gets separate stdout and stderr buffers. When a buffer would
//! exceed the byte ceiling, the oldest bytes are dropped (never splitting a
//! UTF-8 sequence) and the command's `truncated` flag is set.

use std::collections::BTreeMap;

use crate::types::CommandOutput;

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Output buffers for every command in one run.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    max_bytes: usize,
    outputs: BTreeMap<String, CommandOutput>,
}

impl OutputCapture {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            outputs: BTreeMap::new(),
        }
    }

    /// Appends one line (a newline is added) to the command's buffer.
    pub fn append(&mut self, name: &str, stream: Stream, line: &str) {
        let entry = self.outputs.entry(name.to_string()).or_default();
        let buf = match stream {
            Stream::Stdout => &mut entry.stdout,
            Stream::Stderr => &mut entry.stderr,
        };
        buf.push_str(line);
        buf.push('\n');

        if buf.len() > self.max_bytes {
            let mut start = buf.len() - self.max_bytes;
            while start < buf.len() && !buf.is_char_boundary(start) {
                start += 1;
            }
            buf.drain(..start);
            entry.truncated = true;
        }
    }

    /// Consumes the capture, returning the buffers.
    #[must_use]
    pub fn into_outputs(self) -> BTreeMap<String, CommandOutput> {
        self.outputs
    }
}
