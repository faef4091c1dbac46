//! Capped append-only output buffer shared by the console and SSH managers.
//!
//! The buffer holds cleaned text (the owning manager strips control
//! sequences before appending). Reads never block; `diff` reads advance a
//! per-buffer offset so repeated polls only see new output.

use serde::{Deserialize, Serialize};

/// Default buffer cap: 10 MiB.
pub const DEFAULT_BUFFER_CAP: usize = 10 * 1024 * 1024;
/// On overflow the head is trimmed until this many bytes remain.
pub const DEFAULT_TRIM_TO: usize = 5 * 1024 * 1024;
/// Lines per page for `last_page` / `pages(n)` reads.
pub const DEFAULT_PAGE_LINES: usize = 50;

/// How much of the buffer a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Bytes since the previous diff read; advances the offset.
    Diff,
    /// The last page of lines.
    LastPage,
    /// The last n pages of lines.
    Pages(u32),
    /// The whole buffer.
    All,
    /// The last n bytes, raw.
    TailBytes(usize),
}

impl ReadMode {
    /// Parse the tool-facing `(mode, count)` pair.
    pub fn parse(mode: &str, count: Option<u64>) -> Result<Self, String> {
        match mode {
            "diff" => Ok(Self::Diff),
            "last_page" => Ok(Self::LastPage),
            "pages" => {
                let n = count.ok_or("mode 'pages' requires a page count")?;
                if n == 0 {
                    return Err("page count must be at least 1".to_string());
                }
                Ok(Self::Pages(n as u32))
            }
            "all" => Ok(Self::All),
            "tail" => {
                let n = count.ok_or("mode 'tail' requires a byte count")?;
                Ok(Self::TailBytes(n as usize))
            }
            other => Err(format!(
                "unknown read mode '{other}' (expected diff, last_page, pages, all, tail)"
            )),
        }
    }
}

impl Default for ReadMode {
    fn default() -> Self {
        Self::Diff
    }
}

// ─── OutputBuffer ─────────────────────────────────────────────────────────────

/// Append-only text buffer with a hard cap and high-water trim.
///
/// When an append pushes the length past `cap`, the head is trimmed until
/// `trim_to` bytes remain and `last_read_offset` is clamped to the surviving
/// prefix. The offset never moves backwards relative to the stream: a diff
/// read after a trim starts at the oldest surviving byte.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: String,
    last_read_offset: usize,
    /// Bytes trimmed from the head over the buffer's lifetime. Stream
    /// offsets (`stream_len`, `slice_from_stream`) stay valid across trims.
    trimmed: usize,
    cap: usize,
    trim_to: usize,
    page_lines: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize, trim_to: usize, page_lines: usize) -> Self {
        debug_assert!(trim_to <= cap);
        Self {
            data: String::new(),
            last_read_offset: 0,
            trimmed: 0,
            cap,
            trim_to,
            page_lines,
        }
    }

    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.data.push_str(text);
        if self.data.len() > self.cap {
            let mut cut = self.data.len() - self.trim_to;
            while cut < self.data.len() && !self.data.is_char_boundary(cut) {
                cut += 1;
            }
            self.data.drain(..cut);
            self.trimmed += cut;
            self.last_read_offset = self.last_read_offset.saturating_sub(cut);
        }
    }

    pub fn read(&mut self, mode: ReadMode) -> String {
        match mode {
            ReadMode::Diff => {
                let out = self.data[self.last_read_offset..].to_string();
                self.last_read_offset = self.data.len();
                out
            }
            ReadMode::LastPage => self.last_lines(self.page_lines),
            ReadMode::Pages(n) => self.last_lines(self.page_lines * n as usize),
            ReadMode::All => self.data.clone(),
            ReadMode::TailBytes(n) => {
                if n >= self.data.len() {
                    return self.data.clone();
                }
                let mut start = self.data.len() - n;
                while start < self.data.len() && !self.data.is_char_boundary(start) {
                    start += 1;
                }
                self.data[start..].to_string()
            }
        }
    }

    /// Peek at the whole content without advancing the diff offset.
    pub fn snapshot(&self) -> &str {
        &self.data
    }

    /// Total bytes ever appended, including trimmed head bytes. Capture this
    /// before a write to address later output independently of trims.
    pub fn stream_len(&self) -> usize {
        self.trimmed + self.data.len()
    }

    /// Content at and after the given stream offset. Offsets older than the
    /// surviving head clamp to the head.
    pub fn slice_from_stream(&self, stream_offset: usize) -> &str {
        let local = stream_offset.saturating_sub(self.trimmed).min(self.data.len());
        &self.data[local..]
    }

    /// Advance the diff offset to the given stream position if it is ahead.
    pub fn consume_to_stream(&mut self, stream_offset: usize) {
        let local = stream_offset.saturating_sub(self.trimmed).min(self.data.len());
        self.last_read_offset = self.last_read_offset.max(local);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last_read_offset(&self) -> usize {
        self.last_read_offset
    }

    /// Bytes appended since the last diff read.
    pub fn pending(&self) -> usize {
        self.data.len() - self.last_read_offset
    }

    fn last_lines(&self, n: usize) -> String {
        if n == 0 {
            return String::new();
        }
        let lines: Vec<&str> = self.data.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAP, DEFAULT_TRIM_TO, DEFAULT_PAGE_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> OutputBuffer {
        // cap 100 bytes, trim to 40, 3-line pages
        OutputBuffer::new(100, 40, 3)
    }

    #[test]
    fn test_diff_advances_and_drains() {
        let mut buf = small();
        buf.append("alpine:~# ");
        assert_eq!(buf.read(ReadMode::Diff), "alpine:~# ");
        assert_eq!(buf.read(ReadMode::Diff), "");
        buf.append("\nalpine:~# ");
        assert_eq!(buf.read(ReadMode::Diff), "\nalpine:~# ");
        assert_eq!(buf.read(ReadMode::Diff), "");
    }

    #[test]
    fn test_all_is_concatenation_of_diffs() {
        let mut buf = small();
        let mut seen = String::new();
        for chunk in ["one ", "two ", "three"] {
            buf.append(chunk);
            seen.push_str(&buf.read(ReadMode::Diff));
        }
        assert_eq!(buf.read(ReadMode::All), seen);
    }

    #[test]
    fn test_last_page_and_pages() {
        let mut buf = small();
        buf.append("l1\nl2\nl3\nl4\nl5");
        assert_eq!(buf.read(ReadMode::LastPage), "l3\nl4\nl5");
        assert_eq!(buf.read(ReadMode::Pages(2)), "l1\nl2\nl3\nl4\nl5");
    }

    #[test]
    fn test_tail_bytes() {
        let mut buf = small();
        buf.append("abcdef");
        assert_eq!(buf.read(ReadMode::TailBytes(3)), "def");
        assert_eq!(buf.read(ReadMode::TailBytes(100)), "abcdef");
    }

    #[test]
    fn test_overflow_trims_head_and_clamps_offset() {
        let mut buf = small();
        buf.append(&"x".repeat(90));
        assert_eq!(buf.read(ReadMode::Diff).len(), 90);
        // Push past the cap: 90 + 20 = 110 > 100 → trimmed to 40.
        buf.append(&"y".repeat(20));
        assert_eq!(buf.len(), 40);
        // Offset was 90, trim removed 70 bytes → clamped to 20. The next
        // diff starts inside the surviving region and sees only new bytes.
        assert_eq!(buf.last_read_offset(), 20);
        assert_eq!(buf.read(ReadMode::Diff), "y".repeat(20));
    }

    #[test]
    fn test_offset_monotonic_under_trim() {
        let mut buf = OutputBuffer::new(64, 16, 3);
        for i in 0..50 {
            buf.append(&format!("line-{i}\n"));
            // offset stays inside the surviving buffer across every trim
            assert!(buf.last_read_offset() <= buf.len());
            assert!(buf.pending() <= buf.len());
        }
        assert!(buf.len() <= 64);
    }

    #[test]
    fn test_trim_respects_char_boundaries() {
        let mut buf = OutputBuffer::new(20, 8, 3);
        buf.append(&"é".repeat(15)); // 30 bytes of 2-byte chars
        assert!(buf.len() <= 20);
        // Still valid UTF-8 and readable.
        let all = buf.read(ReadMode::All);
        assert!(all.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_stream_offsets_survive_trim() {
        let mut buf = small();
        buf.append(&"a".repeat(50));
        let mark = buf.stream_len();
        buf.append("needle");
        assert_eq!(buf.slice_from_stream(mark), "needle");
        // Overflow the cap; the mark still addresses surviving output.
        buf.append(&"b".repeat(60)); // 116 > 100 → trim to 40
        assert!(buf.stream_len() >= mark);
        let tail = buf.slice_from_stream(mark);
        assert!(tail.len() <= buf.len());
        // Consuming to a stream position moves the diff offset forward only.
        let before = buf.last_read_offset();
        buf.consume_to_stream(0);
        assert_eq!(buf.last_read_offset(), before);
        buf.consume_to_stream(buf.stream_len());
        assert_eq!(buf.read(ReadMode::Diff), "");
    }

    #[test]
    fn test_read_mode_parse() {
        assert_eq!(ReadMode::parse("diff", None), Ok(ReadMode::Diff));
        assert_eq!(ReadMode::parse("pages", Some(3)), Ok(ReadMode::Pages(3)));
        assert_eq!(ReadMode::parse("tail", Some(256)), Ok(ReadMode::TailBytes(256)));
        assert!(ReadMode::parse("pages", None).is_err());
        assert!(ReadMode::parse("pages", Some(0)).is_err());
        assert!(ReadMode::parse("bogus", None).is_err());
    }
}
