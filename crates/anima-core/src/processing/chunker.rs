/// A contiguous, positionally-anchored slice of a parsed document.
/// Offsets are code-point offsets into the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub ordinal: u32,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// Sliding-window chunker. Walks a cursor forward in steps of
/// `window_chars - overlap_chars`; a window that would split mid-word is
/// extended forward to the next whitespace, capped at `window_chars * 1.25`.
pub struct Chunker {
    window_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    pub fn new(window_chars: usize, overlap_chars: usize) -> Self {
        debug_assert!(overlap_chars < window_chars);
        Self {
            window_chars,
            overlap_chars,
        }
    }

    /// Lazy, finite, restartable sequence of chunks covering `[0, chars(text))`.
    pub fn chunk<'a>(&self, text: &'a str) -> ChunkIter<'a> {
        ChunkIter {
            text,
            chars: text.chars().collect(),
            byte_offsets: byte_offset_table(text),
            window: self.window_chars,
            step: self.window_chars.saturating_sub(self.overlap_chars).max(1),
            hard_cap: self.window_chars + self.window_chars / 4,
            start: 0,
            ordinal: 0,
            done: false,
        }
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(800, 100)
    }
}

pub struct ChunkIter<'a> {
    text: &'a str,
    chars: Vec<char>,
    /// Byte offset of each char index, plus text.len() as the final entry.
    byte_offsets: Vec<usize>,
    window: usize,
    step: usize,
    hard_cap: usize,
    start: usize,
    ordinal: u32,
    done: bool,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        let n = self.chars.len();
        if self.done || self.start >= n {
            return None;
        }

        let start = self.start;
        let mut end = (start + self.window).min(n);

        // Mid-word split: neither the last included char nor the first
        // excluded char is whitespace. Extend to the next whitespace,
        // bounded by the hard cap.
        if end < n && !self.chars[end - 1].is_whitespace() && !self.chars[end].is_whitespace() {
            let max_end = (start + self.hard_cap).min(n);
            while end < max_end && !self.chars[end].is_whitespace() {
                end += 1;
            }
        }

        let span = ChunkSpan {
            ordinal: self.ordinal,
            text: self.text[self.byte_offsets[start]..self.byte_offsets[end]].to_string(),
            char_start: start,
            char_end: end,
        };

        self.ordinal += 1;
        if end == n {
            self.done = true;
        } else {
            self.start = start + self.step;
        }

        Some(span)
    }
}

fn byte_offset_table(text: &str) -> Vec<usize> {
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    offsets.push(text.len());
    offsets
}
