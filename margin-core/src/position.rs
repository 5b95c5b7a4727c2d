//! Byte offsets, line numbers, and edits between them.
//!
//! The live tracker and the line aggregator both move positions through a
//! [`TextEdit`] and translate them with a [`LineIndex`]. Lines are 1-indexed
//! here, matching [`crate::types::Anchor`].

use crate::error::StoreError;

/// Start offsets of every line in a text buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineIndex {
    line_starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.bytes()
                .enumerate()
                .filter(|&(_, b)| b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self {
            line_starts,
            len: text.len(),
        }
    }

    /// Number of lines, counting a trailing empty line after a final newline.
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Length of the indexed text in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the first byte of `line`, clamped to the buffer's lines.
    pub fn line_start(&self, line: u32) -> usize {
        let idx = (line.max(1) as usize - 1).min(self.line_starts.len() - 1);
        self.line_starts[idx]
    }

    /// The line containing `offset`. Offsets past the end clamp to the last line.
    pub fn line_of(&self, offset: usize) -> u32 {
        let offset = offset.min(self.len);
        self.line_starts.partition_point(|&start| start <= offset) as u32
    }
}

/// A single replacement in a text buffer: `removed` bytes at `offset` are
/// replaced by `inserted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub offset: usize,
    pub removed: usize,
    pub inserted: String,
}

impl TextEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            removed: len,
            inserted: String::new(),
        }
    }

    pub fn replace(offset: usize, len: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed: len,
            inserted: text.into(),
        }
    }

    /// Maps a pre-edit offset to its post-edit position.
    ///
    /// Forward-biased: a position at the edit point, or inside the removed
    /// range, lands after the inserted text.
    pub fn map_offset(&self, pos: usize) -> usize {
        if pos < self.offset {
            pos
        } else if pos >= self.offset + self.removed {
            pos - self.removed + self.inserted.len()
        } else {
            self.offset + self.inserted.len()
        }
    }

    /// Applies the edit to `text`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEdit`] when the range runs past the end of
    /// `text` or does not fall on character boundaries.
    pub fn apply(&self, text: &mut String) -> Result<(), StoreError> {
        let end = self.offset.checked_add(self.removed);
        match end {
            Some(end)
                if end <= text.len()
                    && text.is_char_boundary(self.offset)
                    && text.is_char_boundary(end) =>
            {
                text.replace_range(self.offset..end, &self.inserted);
                Ok(())
            }
            _ => Err(StoreError::InvalidEdit {
                offset: self.offset,
                len: self.removed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_round_trips_starts() {
        let index = LineIndex::new("one\ntwo\n\nfour");
        assert_eq!(index.line_count(), 4);
        assert_eq!(index.line_start(1), 0);
        assert_eq!(index.line_start(2), 4);
        assert_eq!(index.line_start(4), 9);
        assert_eq!(index.line_start(99), 9);
        assert_eq!(index.line_start(0), 0);
        assert_eq!(index.line_of(0), 1);
        assert_eq!(index.line_of(3), 1);
        assert_eq!(index.line_of(4), 2);
        assert_eq!(index.line_of(8), 3);
        assert_eq!(index.line_of(1_000), 4);
    }

    #[test]
    fn trailing_newline_opens_an_empty_line() {
        let index = LineIndex::new("a\n");
        assert_eq!(index.line_count(), 2);
        assert_eq!(index.line_of(2), 2);
    }

    #[test]
    fn map_offset_is_forward_biased() {
        let insert = TextEdit::insert(10, "abc");
        assert_eq!(insert.map_offset(9), 9);
        assert_eq!(insert.map_offset(10), 13);
        assert_eq!(insert.map_offset(20), 23);

        let delete = TextEdit::delete(10, 5);
        assert_eq!(delete.map_offset(9), 9);
        assert_eq!(delete.map_offset(12), 10);
        assert_eq!(delete.map_offset(15), 10);
        assert_eq!(delete.map_offset(20), 15);

        let replace = TextEdit::replace(10, 5, "xy");
        assert_eq!(replace.map_offset(12), 12);
        assert_eq!(replace.map_offset(15), 12);
    }

    #[test]
    fn apply_checks_bounds() {
        let mut text = "hello world".to_owned();
        TextEdit::replace(0, 5, "goodbye").apply(&mut text).unwrap();
        assert_eq!(text, "goodbye world");
        assert!(TextEdit::delete(10, 50).apply(&mut text).is_err());

        let mut accented = "é".to_owned();
        assert!(TextEdit::insert(1, "x").apply(&mut accented).is_err());
        assert_eq!(accented, "é");
    }
}
