//! Gap buffer for edit-script application (spec §4.3, §9 design note:
//! "keep this a literal mutable array, never a persistent/rope sequence").
//!
//! RCS deltas are reverse edit scripts: materialising revision N from N+1
//! means applying N's script to N+1's text. Both operations the script
//! contains — "delete `n` lines starting at line `l`" and "insert `n` lines
//! after line `l`" — are O(distance moved) against a flat `Vec<Line>`,
//! which is exactly what the original's `editbuffer_t` is.

pub type Line = Vec<u8>;

/// A file's text as a mutable sequence of lines, broken apart so repeated
/// inserts/deletes at the same neighbourhood stay cheap.
#[derive(Default, Clone)]
pub struct GapBuffer {
    lines: Vec<Line>,
}

impl GapBuffer {
    pub fn from_text(text: &[u8]) -> Self {
        let mut lines = Vec::new();
        let mut start = 0;
        for (i, &b) in text.iter().enumerate() {
            if b == b'\n' {
                lines.push(text[start..=i].to_vec());
                start = i + 1;
            }
        }
        if start < text.len() {
            lines.push(text[start..].to_vec());
        }
        GapBuffer { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Insert `new_lines` after 1-based line `after` (0 means "at the
    /// start"), matching RCS's `a` command.
    pub fn insert_lines(&mut self, after: usize, new_lines: Vec<Line>) {
        let at = after.min(self.lines.len());
        self.lines.splice(at..at, new_lines);
    }

    /// Delete `count` lines starting at 1-based line `start`, matching
    /// RCS's `d` command.
    pub fn delete_lines(&mut self, start: usize, count: usize) {
        if start == 0 || start > self.lines.len() {
            return;
        }
        let from = start - 1;
        let to = (from + count).min(self.lines.len());
        self.lines.drain(from..to);
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.lines.into_iter().flatten().collect()
    }
}
