//! Line cursor shared by all the section parsers.
//!
//! Parsers only ever need one line of lookahead: they pull a line, and if it
//! belongs to somebody else they push it back with [`Lines::rewind`].

/// Anything that carries a line of text.
pub trait Line {
    fn text(&self) -> &str;
}

/// A plain line of dump text with its position in the original input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextLine {
    pub lineno: usize,
    pub text: String,
}

impl Line for TextLine {
    fn text(&self) -> &str {
        &self.text
    }
}

impl Line for String {
    fn text(&self) -> &str {
        self
    }
}

impl Line for &str {
    fn text(&self) -> &str {
        self
    }
}

impl TextLine {
    /// Splits a blob into numbered lines (1-based), dropping any `\r`.
    pub fn split(blob: &str) -> Vec<TextLine> {
        blob.lines()
            .enumerate()
            .map(|(i, text)| TextLine {
                lineno: i + 1,
                text: text.trim_end_matches('\r').to_string(),
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct Lines<'a, T> {
    items: &'a [T],
    pos: usize,
}

impl<'a, T: Line> Lines<'a, T> {
    pub fn new(items: &'a [T]) -> Self {
        Self { items, pos: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.items.len()
    }

    pub fn peek(&self) -> Option<&'a T> {
        self.items.get(self.pos)
    }

    /// Push back the last line handed out. Only one step is ever needed.
    pub fn rewind(&mut self) {
        debug_assert!(self.pos > 0, "rewind before any line was read");
        self.pos = self.pos.saturating_sub(1);
    }

    /// Index of the line that `next` would return.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a, T: Line> Iterator for Lines<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.get(self.pos)?;
        self.pos += 1;
        Some(item)
    }
}
