//! Screen emulation and raw-output buffering for one terminal.
//!
//! `ScreenBuffer` wraps a `vt100` parser: PTY bytes go in, a rendered text
//! snapshot comes out. `OutputRing` keeps the raw byte stream in a bounded
//! chunked ring so `stdout(mode="stream")` can serve history without ever
//! growing past its cap.

use std::collections::VecDeque;

/// VT-100/xterm-256color screen with scrollback.
pub struct ScreenBuffer {
    parser: vt100::Parser,
}

impl ScreenBuffer {
    pub fn new(rows: u16, cols: u16, scrollback: usize) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, scrollback),
        }
    }

    /// Advance the emulator. Partial escape sequences are buffered inside
    /// the parser, so chunk boundaries never corrupt the grid.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    /// The currently visible screen as text, one line per row, trailing
    /// blank lines trimmed.
    pub fn snapshot(&self) -> String {
        let contents = self.parser.screen().contents();
        let mut lines: Vec<&str> = contents.lines().map(|l| l.trim_end()).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    /// Resize the grid. Scrollback is preserved.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
    }

    pub fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }
}

/// Bounded ring of raw output bytes, stored as the chunks they arrived in.
/// When the byte total exceeds the cap, whole chunks are discarded oldest
/// first.
pub struct OutputRing {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
    cap: usize,
}

impl OutputRing {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            cap,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.chunks.push_back(chunk.to_vec());
        self.total += chunk.len();
        // Evict whole chunks oldest-first, but never the newest one: the
        // most recent output must survive even an oversized single chunk.
        while self.total > self.cap && self.chunks.len() > 1 {
            let Some(removed) = self.chunks.pop_front() else {
                break;
            };
            self.total = self.total.saturating_sub(removed.len());
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// All buffered bytes, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// The last `max_bytes` of the buffer.
    pub fn tail_bytes(&self, max_bytes: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut remaining = max_bytes;
        for chunk in self.chunks.iter().rev() {
            if remaining == 0 {
                break;
            }
            let take = chunk.len().min(remaining);
            out.extend_from_slice(&chunk[chunk.len() - take..]);
            remaining -= take;
        }
        out.reverse();
        out
    }

    /// The whole buffer decoded as UTF-8 with replacement characters.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).to_string()
    }

    /// The last `max_lines` newline-delimited lines of the decoded buffer.
    /// A trailing newline does not count as an extra empty line.
    pub fn tail_lines(&self, max_lines: usize) -> String {
        let text = self.text();
        let trimmed = text.strip_suffix('\n').unwrap_or(&text);
        if trimmed.is_empty() {
            return String::new();
        }
        let lines: Vec<&str> = trimmed.split('\n').collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}
