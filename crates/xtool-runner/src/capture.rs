//! Capture of external process output.
//!
//! Lines are forwarded as [`OutputLine`] messages to an optional
//! [`OutputSink`] as they arrive, and the most recent ones are retained per
//! stream for diagnostics.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of output of one chunk's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub chunk: usize,
    pub stream: Stream,
    pub line: String,
}

pub type OutputSink = mpsc::UnboundedSender<OutputLine>;

/// Create a sink and the receiver draining it.
pub fn output_channel() -> (OutputSink, mpsc::UnboundedReceiver<OutputLine>) {
    mpsc::unbounded_channel()
}

/// Keeps the last `capacity` lines, dropping the oldest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineRing {
    capacity: usize,
    lines: VecDeque<String>,
    dropped: u64,
}

impl LineRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(64)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Retained stdout and stderr of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputCapture {
    pub stdout: LineRing,
    pub stderr: LineRing,
}

impl OutputCapture {
    pub fn new(capacity: usize) -> Self {
        Self {
            stdout: LineRing::new(capacity),
            stderr: LineRing::new(capacity),
        }
    }

    pub fn stream(&self, stream: Stream) -> &LineRing {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    pub fn stream_mut(&mut self, stream: Stream) -> &mut LineRing {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    pub fn push(&mut self, stream: Stream, line: String) {
        self.stream_mut(stream).push(line);
    }

    pub fn capacity(&self) -> usize {
        self.stdout.capacity()
    }
}
