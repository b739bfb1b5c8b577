use crate::{ReadonlySpans, Span};
use ropey::Rope;
use thiserror::Error;

/// A cursor location: zero-based line and character column.
///
/// Columns count characters from the line start, not bytes, so a position is
/// only meaningful against the buffer it was derived from. All arithmetic on
/// positions goes through the buffer's line index
/// ([`byte_at_pos`](Buffer::byte_at_pos) / [`pos_at_byte`](Buffer::pos_at_byte));
/// there is deliberately no free-standing position math that could drift from
/// the actual text.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

impl Position {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// A rejected buffer edit. No edit partially succeeds: on error the text and
/// the readonly spans are exactly what they were before the call.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EditError {
    #[error("edit overlaps a readonly span")]
    ReadOnlyViolation,
    #[error("offset or position out of bounds")]
    OutOfBounds,
}

/// An editable UTF-8 text buffer with readonly byte spans.
///
/// All offsets taken and returned by this type are byte offsets into the
/// current text and must fall on character boundaries.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    text: Rope,
    readonly: ReadonlySpans,
}

impl Buffer {
    pub fn from_str(text: &str) -> Self {
        Self {
            text: Rope::from_str(text),
            readonly: ReadonlySpans::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, std::str::Utf8Error> {
        Ok(Self::from_str(std::str::from_utf8(bytes)?))
    }

    pub fn text(&self) -> &Rope {
        &self.text
    }

    pub fn len_bytes(&self) -> usize {
        self.text.len_bytes()
    }

    /// Resolve a byte offset to a char index, rejecting offsets past the end
    /// of text or in the middle of a multi-byte character.
    fn char_index(&self, offset: usize) -> Result<usize, EditError> {
        if offset > self.text.len_bytes() {
            return Err(EditError::OutOfBounds);
        }
        let idx = self.text.byte_to_char(offset);
        if self.text.char_to_byte(idx) != offset {
            return Err(EditError::OutOfBounds);
        }
        Ok(idx)
    }

    /// Insert `text` at `offset`.
    ///
    /// Insertion strictly inside a readonly span fails. Insertion at a span's
    /// `start` shifts the span right, at its `end` leaves it alone; either
    /// way the new text is editable.
    pub fn insert(&mut self, offset: usize, text: &str) -> Result<(), EditError> {
        let char_idx = self.char_index(offset)?;
        if self.readonly.contains_interior(offset) {
            return Err(EditError::ReadOnlyViolation);
        }
        self.text.insert(char_idx, text);
        self.readonly.shift_for_insert(offset, text.len());
        Ok(())
    }

    /// Delete the bytes in `[start, end)`.
    ///
    /// A readonly span covered entirely by the range is dropped with it; any
    /// partial overlap fails.
    pub fn delete(&mut self, start: usize, end: usize) -> Result<(), EditError> {
        if start > end {
            return Err(EditError::OutOfBounds);
        }
        let start_char = self.char_index(start)?;
        let end_char = self.char_index(end)?;
        for span in self.readonly.overlapping(start, end) {
            if !span.covered_by(start, end) {
                return Err(EditError::ReadOnlyViolation);
            }
        }
        self.text.remove(start_char..end_char);
        self.readonly.shift_for_delete(start, end);
        Ok(())
    }

    pub fn mark_readonly(&mut self, start: usize, end: usize) -> Result<(), EditError> {
        if start >= end || end > self.text.len_bytes() {
            return Err(EditError::OutOfBounds);
        }
        self.readonly.insert(start, end);
        Ok(())
    }

    pub fn unmark_readonly(&mut self, start: usize, end: usize) -> Result<(), EditError> {
        if start > end || end > self.text.len_bytes() {
            return Err(EditError::OutOfBounds);
        }
        self.readonly.remove(start, end);
        Ok(())
    }

    /// `true` iff `offset` lies in the strict interior of a readonly span.
    pub fn is_readonly(&self, offset: usize) -> bool {
        self.readonly.contains_interior(offset)
    }

    pub fn readonly_spans(&self) -> &[Span] {
        self.readonly.as_slice()
    }

    /// Byte offset of a `(row, col)` position. `col` counts characters from
    /// the line start; positions may address up to the end of the line
    /// (before its line feed) or the end of the document.
    pub fn byte_at_pos(&self, pos: Position) -> Result<usize, EditError> {
        if pos.row >= self.text.len_lines() {
            return Err(EditError::OutOfBounds);
        }
        let line = self.text.line(pos.row);
        let line_len = line.len_chars();
        let max_col = if line_len > 0 && line.char(line_len - 1) == '\n' {
            line_len - 1
        } else {
            line_len
        };
        if pos.col > max_col {
            return Err(EditError::OutOfBounds);
        }
        let line_start = self.text.line_to_char(pos.row);
        Ok(self.text.char_to_byte(line_start + pos.col))
    }

    /// Inverse of [`byte_at_pos`](Self::byte_at_pos).
    pub fn pos_at_byte(&self, offset: usize) -> Result<Position, EditError> {
        let char_idx = self.char_index(offset)?;
        let row = self.text.char_to_line(char_idx);
        let col = char_idx - self.text.line_to_char(row);
        Ok(Position::new(row, col))
    }
}
