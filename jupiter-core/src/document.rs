//! Document replica: the text buffer operations are applied to.

use crate::checksum::Checksum;
use crate::error::{OtError, OtResult};
use crate::operation::{char_len, Operation};

/// A plain text buffer mutated only through [`Operation`]s.
///
/// Length is tracked in chars alongside the content so range checks do not
/// rescan the whole buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    content: String,
    len: usize,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let len = char_len(&content);
        Self { content, len }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Apply an operation in place.
    ///
    /// Out-of-range positions and deletes whose text does not match the
    /// buffer are rejected and leave the document unchanged. A `Split` is
    /// staged on a copy and committed only when both halves apply.
    pub fn apply(&mut self, op: &Operation) -> OtResult<()> {
        if let Operation::Split { .. } = op {
            let mut staged = self.clone();
            staged.apply_in_place(op)?;
            *self = staged;
            return Ok(());
        }
        self.apply_in_place(op)
    }

    fn apply_in_place(&mut self, op: &Operation) -> OtResult<()> {
        match op {
            Operation::NoOp => Ok(()),
            Operation::Insert { position, text } => {
                self.check_range(*position, 0)?;
                let at = self.byte_offset(*position);
                self.content.insert_str(at, text);
                self.len += char_len(text);
                Ok(())
            }
            Operation::Delete { position, text } => {
                let count = char_len(text);
                self.check_range(*position, count)?;
                let start = self.byte_offset(*position);
                let end = start
                    + self.content[start..]
                        .char_indices()
                        .nth(count)
                        .map_or(self.content.len() - start, |(i, _)| i);
                if &self.content[start..end] != text {
                    return Err(OtError::DeleteMismatch {
                        position: *position,
                        expected: text.clone(),
                        found: self.content[start..end].to_string(),
                    });
                }
                self.content.replace_range(start..end, "");
                self.len -= count;
                Ok(())
            }
            Operation::Split { first, second } => {
                self.apply_in_place(first)?;
                self.apply_in_place(second)
            }
        }
    }

    /// Replace the whole buffer with an authoritative copy.
    pub fn replace(&mut self, content: impl Into<String>) {
        *self = Self::new(content);
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of(&self.content)
    }

    fn check_range(&self, position: usize, length: usize) -> OtResult<()> {
        match position.checked_add(length) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(OtError::OutOfRange {
                position,
                length,
                doc_len: self.len,
            }),
        }
    }

    fn byte_offset(&self, position: usize) -> usize {
        self.content
            .char_indices()
            .nth(position)
            .map_or(self.content.len(), |(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete() {
        let mut doc = Document::new("hello");
        doc.apply(&Operation::insert(5, " world")).unwrap();
        assert_eq!(doc.content(), "hello world");
        doc.apply(&Operation::delete(0, "hello ")).unwrap();
        assert_eq!(doc.content(), "world");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_multibyte_positions_are_chars() {
        let mut doc = Document::new("ñandú");
        doc.apply(&Operation::insert(2, "-")).unwrap();
        assert_eq!(doc.content(), "ña-ndú");
        doc.apply(&Operation::delete(4, "dú")).unwrap();
        assert_eq!(doc.content(), "ña-n");
        assert_eq!(doc.len(), 4);
    }

    #[test]
    fn test_split_applies_in_order() {
        let mut doc = Document::new("abcXYdef");
        let op = Operation::split(Operation::delete(1, "bc"), Operation::delete(3, "de"));
        doc.apply(&op).unwrap();
        assert_eq!(doc.content(), "aXYf");
    }

    #[test]
    fn test_delete_mismatch_detected() {
        let mut doc = Document::new("abc");
        let err = doc.apply(&Operation::delete(1, "x")).unwrap_err();
        assert!(matches!(err, OtError::DeleteMismatch { position: 1, .. }));
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut doc = Document::new("abc");
        assert_eq!(
            doc.apply(&Operation::insert(4, "x")),
            Err(OtError::OutOfRange {
                position: 4,
                length: 0,
                doc_len: 3
            })
        );
        assert!(doc.apply(&Operation::delete(2, "cd")).is_err());
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_range_past_usize_rejected() {
        let mut doc = Document::new("abc");
        assert_eq!(
            doc.apply(&Operation::delete(usize::MAX, "x")),
            Err(OtError::OutOfRange {
                position: usize::MAX,
                length: 1,
                doc_len: 3
            })
        );
        assert!(doc.apply(&Operation::insert(usize::MAX, "x")).is_err());
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_failing_split_leaves_document_untouched() {
        let mut doc = Document::new("abc");
        let op = Operation::split(Operation::delete(0, "a"), Operation::delete(1, "zz"));
        assert!(matches!(doc.apply(&op), Err(OtError::OutOfRange { position: 1, .. })));
        assert_eq!(doc.content(), "abc");
        assert_eq!(doc.len(), 3);

        let mismatch = Operation::split(Operation::insert(0, "x"), Operation::delete(1, "b"));
        assert!(matches!(doc.apply(&mismatch), Err(OtError::DeleteMismatch { .. })));
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_replace_resets_length() {
        let mut doc = Document::new("abc");
        doc.replace("zz");
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.checksum(), Document::new("zz").checksum());
    }

    #[test]
    fn test_noop_leaves_content() {
        let mut doc = Document::new("abc");
        doc.apply(&Operation::NoOp).unwrap();
        assert_eq!(doc.content(), "abc");
    }
}
