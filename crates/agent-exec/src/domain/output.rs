//! Bounded capture of process output.

use serde::Deserialize;
use serde::Serialize;

pub const DEFAULT_MAX_LINES: usize = 100_000;
pub const DEFAULT_MAX_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One line (or line fragment) read from a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
    /// The line exceeded the per-line limit and was split here.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
    pub max_line_bytes: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            max_bytes: DEFAULT_MAX_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    pub lines: usize,
    pub bytes: usize,
    pub dropped: u64,
    /// Accepted lines the client queue could not take.
    pub undelivered: u64,
}

/// Ordered capture bounded by a line cap and a byte cap.
///
/// Accepts the longest prefix of pushed lines that fits both caps. After the
/// first rejection the buffer is sealed: every later line is counted in
/// `dropped_count` and discarded, even one that would still fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    lines: Vec<String>,
    total_bytes: usize,
    dropped_count: u64,
    max_lines: usize,
    max_bytes: usize,
    sealed: bool,
}

impl OutputBuffer {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            lines: Vec::new(),
            total_bytes: 0,
            dropped_count: 0,
            max_lines,
            max_bytes,
            sealed: false,
        }
    }

    pub fn with_limits(limits: &OutputLimits) -> Self {
        Self::new(limits.max_lines, limits.max_bytes)
    }

    /// Returns whether the line was kept.
    pub fn push(&mut self, line: &str) -> bool {
        if !self.sealed
            && self.lines.len() < self.max_lines
            && self.total_bytes.saturating_add(line.len()) <= self.max_bytes
        {
            self.total_bytes += line.len();
            self.lines.push(line.to_string());
            return true;
        }
        self.sealed = true;
        self.dropped_count = self.dropped_count.saturating_add(1);
        false
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    #[cfg(test)]
    pub fn is_capped(&self) -> bool {
        self.sealed
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Last `n` captured lines, oldest first.
    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.lines.len().saturating_sub(n);
        &self.lines[start..]
    }

    pub fn summary(&self) -> OutputSummary {
        OutputSummary {
            lines: self.lines.len(),
            bytes: self.total_bytes,
            dropped: self.dropped_count,
            undelivered: 0,
        }
    }
}
