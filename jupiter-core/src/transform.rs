//! Inclusion (IT) and exclusion (ET) transformation.
//!
//! `transform(op, applied, tie)` rewrites `op` so that it has the intended
//! effect on a document where `applied` already happened. Both inputs must
//! have been generated against the same document state.
//!
//! `transform_exclude(op, applied)` is the reverse: `op` was generated after
//! `applied`, and the result is `op` as if `applied` never happened. Used on
//! undo/redo paths.
//!
//! Convergence (TP1) holds for every pair:
//!
//! ```text
//! apply(apply(doc, a), transform(b, a, t)) == apply(apply(doc, b), transform(a, b, t.flip()))
//! ```
//!
//! Position arithmetic saturates, so an operation addressing chars past any
//! real document stays out of range and is rejected when applied.

use crate::operation::{char_len, slice_chars, Operation};

/// Which of two inserts at the same position lands first.
///
/// The tie must be decided by a rule both sides of a link agree on; the
/// state machine derives it from which end of the link produced `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    /// `op` is placed before the text of `applied`.
    OpFirst,
    /// The text of `applied` stays before `op`.
    AppliedFirst,
}

impl Tie {
    pub fn flip(self) -> Self {
        match self {
            Self::OpFirst => Self::AppliedFirst,
            Self::AppliedFirst => Self::OpFirst,
        }
    }
}

/// Inclusion transformation.
pub fn transform(op: &Operation, applied: &Operation, tie: Tie) -> Operation {
    if op.is_noop() {
        return Operation::NoOp;
    }
    if applied.is_noop() {
        return op.clone();
    }

    match (op, applied) {
        (_, Operation::Split { first, second }) => {
            let partial = transform(op, first, tie);
            transform(&partial, second, tie)
        }

        (Operation::Split { first, second }, _) => {
            let first_t = transform(first, applied, tie);
            // `second` runs after `first`, so it has to see `applied` as it
            // looks once `first` is in place.
            let applied_t = transform(applied, first, tie.flip());
            let second_t = transform(second, &applied_t, tie);
            Operation::split(first_t, second_t)
        }

        (
            Operation::Insert { position: p, text },
            Operation::Insert { position: q, text: other },
        ) => {
            let goes_first = *p < *q || (*p == *q && tie == Tie::OpFirst);
            if goes_first {
                op.clone()
            } else {
                Operation::insert(p.saturating_add(char_len(other)), text.clone())
            }
        }

        (
            Operation::Insert { position: p, text },
            Operation::Delete { position: q, text: removed },
        ) => {
            let end = q.saturating_add(char_len(removed));
            if *p <= *q {
                op.clone()
            } else if *p >= end {
                Operation::insert(p - char_len(removed), text.clone())
            } else {
                // The surrounding characters are gone; the text itself survives
                // at the start of the removed range.
                Operation::insert(*q, text.clone())
            }
        }

        (
            Operation::Delete { position: p, text },
            Operation::Insert { position: q, text: inserted },
        ) => {
            let len = char_len(text);
            let end = p.saturating_add(len);
            let shift = char_len(inserted);
            if *q <= *p {
                Operation::delete(p.saturating_add(shift), text.clone())
            } else if *q >= end {
                op.clone()
            } else {
                // Insert landed inside the range: remove both sides, keep the insert.
                let cut = q - p;
                Operation::split(
                    Operation::delete(*p, slice_chars(text, 0, cut)),
                    Operation::delete(p.saturating_add(shift), slice_chars(text, cut, len)),
                )
            }
        }

        (
            Operation::Delete { position: p, text },
            Operation::Delete { position: q, text: removed },
        ) => {
            let len = char_len(text);
            let end = p.saturating_add(len);
            let removed_len = char_len(removed);
            let removed_end = q.saturating_add(removed_len);
            if end <= *q {
                op.clone()
            } else if *p >= removed_end {
                Operation::delete(p - removed_len, text.clone())
            } else {
                // Overlap: keep only what `applied` left standing.
                let mut rest = slice_chars(text, 0, q.saturating_sub(*p));
                if end > removed_end {
                    rest.push_str(&slice_chars(text, removed_end - p, len));
                }
                if rest.is_empty() {
                    Operation::NoOp
                } else {
                    Operation::delete((*p).min(*q), rest)
                }
            }
        }

        // NoOp on either side was handled above.
        _ => op.clone(),
    }
}

/// Exclusion transformation: remove the effect of `applied` from `op`.
///
/// Information lost by the forward direction cannot be recovered: an insert
/// that sat inside `applied`'s own inserted text is anchored at that text's
/// start.
pub fn transform_exclude(op: &Operation, applied: &Operation) -> Operation {
    if op.is_noop() {
        return Operation::NoOp;
    }
    if applied.is_noop() {
        return op.clone();
    }

    match (op, applied) {
        (_, Operation::Split { first, second }) => {
            // `second` was applied last, so it is excluded first.
            let partial = transform_exclude(op, second);
            transform_exclude(&partial, first)
        }

        (Operation::Split { first, second }, _) => {
            let first_x = transform_exclude(first, applied);
            let applied_after_first = transform(applied, &first_x, Tie::OpFirst);
            let second_x = transform_exclude(second, &applied_after_first);
            Operation::split(first_x, second_x)
        }

        (
            Operation::Insert { position: p, text },
            Operation::Insert { position: q, text: inserted },
        ) => {
            let shift = char_len(inserted);
            if *p <= *q {
                op.clone()
            } else if *p >= q.saturating_add(shift) {
                Operation::insert(p - shift, text.clone())
            } else {
                Operation::insert(*q, text.clone())
            }
        }

        (
            Operation::Insert { position: p, text },
            Operation::Delete { position: q, text: removed },
        ) => {
            if *p <= *q {
                op.clone()
            } else {
                Operation::insert(p.saturating_add(char_len(removed)), text.clone())
            }
        }

        (
            Operation::Delete { position: p, text },
            Operation::Insert { position: q, text: inserted },
        ) => {
            let len = char_len(text);
            let end = p.saturating_add(len);
            let shift = char_len(inserted);
            let inserted_end = q.saturating_add(shift);
            if end <= *q {
                op.clone()
            } else if *p >= inserted_end {
                Operation::delete(p - shift, text.clone())
            } else {
                // Whatever `op` removed from the inserted text never existed.
                let mut rest = slice_chars(text, 0, q.saturating_sub(*p));
                if end > inserted_end {
                    rest.push_str(&slice_chars(text, inserted_end - p, len));
                }
                if rest.is_empty() {
                    Operation::NoOp
                } else {
                    Operation::delete((*p).min(*q), rest)
                }
            }
        }

        (
            Operation::Delete { position: p, text },
            Operation::Delete { position: q, text: removed },
        ) => {
            let len = char_len(text);
            let end = p.saturating_add(len);
            let shift = char_len(removed);
            if end <= *q {
                op.clone()
            } else if *p >= *q {
                Operation::delete(p.saturating_add(shift), text.clone())
            } else {
                // `op` spans the point where `applied` removed text: bracket it.
                let cut = q - p;
                Operation::split(
                    Operation::delete(*p, slice_chars(text, 0, cut)),
                    Operation::delete(p.saturating_add(shift), slice_chars(text, cut, len)),
                )
            }
        }

        _ => op.clone(),
    }
}

/// Transform two concurrent operations against each other.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` applies after `a`.
/// `tie` is the tie rule seen from `a`.
pub fn xform(a: &Operation, b: &Operation, tie: Tie) -> (Operation, Operation) {
    (transform(a, b, tie), transform(b, a, tie.flip()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn apply(content: &str, ops: &[&Operation]) -> String {
        let mut doc = Document::new(content);
        for op in ops {
            doc.apply(op).unwrap();
        }
        doc.content().to_string()
    }

    /// Both application orders of a concurrent pair must reach the same text.
    fn assert_converges(content: &str, a: &Operation, b: &Operation) -> String {
        let (a_t, b_t) = xform(a, b, Tie::OpFirst);
        let left = apply(content, &[a, &b_t]);
        let right = apply(content, &[b, &a_t]);
        assert_eq!(left, right, "diverged on {a} vs {b}");
        left
    }

    #[test]
    fn test_insert_insert_shift() {
        let a = Operation::insert(0, "a");
        let b = Operation::insert(1, "b");
        assert_eq!(transform(&b, &a, Tie::OpFirst), Operation::insert(2, "b"));
        assert_eq!(transform(&a, &b, Tie::OpFirst), a);
        assert_eq!(assert_converges("X", &a, &b), "aXb");
    }

    #[test]
    fn test_insert_insert_tie() {
        let a = Operation::insert(2, "a");
        let b = Operation::insert(2, "bb");
        assert_eq!(transform(&a, &b, Tie::OpFirst), a);
        assert_eq!(transform(&a, &b, Tie::AppliedFirst), Operation::insert(4, "a"));
        assert_eq!(assert_converges("xyz", &a, &b), "xyabbz");
    }

    #[test]
    fn test_insert_inside_delete_moves_to_start() {
        let ins = Operation::insert(3, "XY");
        let del = Operation::delete(1, "bcde");
        assert_eq!(transform(&ins, &del, Tie::OpFirst), Operation::insert(1, "XY"));
        assert_eq!(assert_converges("abcdefg", &ins, &del), "aXYfg");
    }

    #[test]
    fn test_delete_split_by_insert_preserves_text() {
        let del = Operation::delete(1, "bcde");
        let ins = Operation::insert(3, "XY");
        let t = transform(&del, &ins, Tie::OpFirst);
        assert_eq!(
            t,
            Operation::split(Operation::delete(1, "bc"), Operation::delete(3, "de"))
        );
        assert_eq!(apply("abcdefg", &[&ins, &t]), "aXYfg");
    }

    #[test]
    fn test_insert_at_delete_boundaries() {
        let del = Operation::delete(2, "cd");
        assert_eq!(assert_converges("abcdef", &Operation::insert(2, "X"), &del), "abXef");
        assert_eq!(assert_converges("abcdef", &Operation::insert(4, "X"), &del), "abXef");
        assert_eq!(
            transform(&del, &Operation::insert(4, "X"), Tie::OpFirst),
            del
        );
    }

    #[test]
    fn test_delete_delete_overlap() {
        let a = Operation::delete(4, "efg");
        let b = Operation::delete(5, "fghi");
        assert_eq!(transform(&a, &b, Tie::OpFirst), Operation::delete(4, "e"));
        assert_eq!(transform(&b, &a, Tie::OpFirst), Operation::delete(4, "hi"));
        assert_eq!(assert_converges("abcdefghij", &a, &b), "abcdj");
    }

    #[test]
    fn test_delete_delete_contained_becomes_noop() {
        let outer = Operation::delete(1, "bcdef");
        let inner = Operation::delete(2, "cd");
        assert_eq!(transform(&inner, &outer, Tie::OpFirst), Operation::NoOp);
        assert_eq!(transform(&outer, &inner, Tie::OpFirst), Operation::delete(1, "bef"));
        assert_eq!(assert_converges("abcdefg", &outer, &inner), "ag");
    }

    #[test]
    fn test_delete_delete_disjoint() {
        let a = Operation::delete(0, "ab");
        let b = Operation::delete(4, "ef");
        assert_eq!(transform(&b, &a, Tie::OpFirst), Operation::delete(2, "ef"));
        assert_eq!(transform(&a, &b, Tie::OpFirst), a);
    }

    #[test]
    fn test_noop_identity() {
        let op = Operation::insert(3, "x");
        assert_eq!(transform(&op, &Operation::NoOp, Tie::OpFirst), op);
        assert_eq!(transform(&Operation::NoOp, &op, Tie::OpFirst), Operation::NoOp);
        assert_eq!(transform_exclude(&op, &Operation::NoOp), op);
    }

    #[test]
    fn test_split_against_insert() {
        let split = Operation::split(Operation::delete(1, "bc"), Operation::delete(2, "ef"));
        let ins = Operation::insert(0, "Z");
        let t = transform(&split, &ins, Tie::OpFirst);
        assert_eq!(
            t,
            Operation::split(Operation::delete(2, "bc"), Operation::delete(3, "ef"))
        );
        assert_eq!(assert_converges("abcdefg", &split, &ins), "Zadg");
    }

    #[test]
    fn test_positions_past_usize_do_not_overflow() {
        let huge = Operation::delete(usize::MAX, "x");
        let ins = Operation::insert(0, "Z");
        assert_eq!(transform(&huge, &ins, Tie::OpFirst), huge);
        assert_eq!(
            transform(&Operation::insert(usize::MAX - 1, "q"), &Operation::insert(0, "ab"), Tie::OpFirst),
            Operation::insert(usize::MAX, "q")
        );
        assert_eq!(transform(&ins, &huge, Tie::OpFirst), ins);
        assert_eq!(transform_exclude(&huge, &Operation::delete(0, "ab")), huge);
    }

    #[test]
    fn test_split_against_overlapping_delete_collapses() {
        let split = Operation::split(Operation::delete(1, "b"), Operation::delete(3, "e"));
        let del = Operation::delete(0, "ab");
        assert_eq!(transform(&split, &del, Tie::OpFirst), Operation::delete(2, "e"));
        assert_eq!(assert_converges("abcdef", &split, &del), "cdf");
    }

    #[test]
    fn test_insert_against_split() {
        let split = Operation::split(Operation::delete(0, "ab"), Operation::delete(1, "de"));
        let ins = Operation::insert(5, "X");
        assert_eq!(transform(&ins, &split, Tie::OpFirst), Operation::insert(1, "X"));
        assert_eq!(assert_converges("abcdefg", &ins, &split), "cXfg");
    }

    #[test]
    fn test_exclude_reverses_include() {
        let base = Operation::insert(1, "xy");
        let cases = [
            Operation::insert(5, "q"),
            Operation::delete(4, "de"),
            Operation::insert(0, "w"),
            Operation::delete(0, "a"),
        ];
        for op in &cases {
            let included = transform(op, &base, Tie::OpFirst);
            assert_eq!(&transform_exclude(&included, &base), op, "round trip of {op}");
        }
    }

    #[test]
    fn test_exclude_delete_spanning_removed_text() {
        let applied = Operation::delete(2, "cd");
        let op = Operation::delete(1, "be");
        let excluded = transform_exclude(&op, &applied);
        assert_eq!(
            excluded,
            Operation::split(Operation::delete(1, "b"), Operation::delete(3, "e"))
        );
        assert_eq!(apply("abcdef", &[&excluded]), "acdf");
    }

    #[test]
    fn test_exclude_delete_of_inserted_text() {
        let applied = Operation::insert(2, "XY");
        let op = Operation::delete(1, "bXYc");
        assert_eq!(transform_exclude(&op, &applied), Operation::delete(1, "bc"));
        let only_inserted = Operation::delete(2, "X");
        assert_eq!(transform_exclude(&only_inserted, &applied), Operation::NoOp);
    }

    #[test]
    fn test_exclude_against_split() {
        let applied = Operation::split(Operation::insert(0, "A"), Operation::insert(3, "B"));
        let op = Operation::insert(5, "z");
        assert_eq!(transform_exclude(&op, &applied), Operation::insert(3, "z"));
    }
}
