//! Operation algebra: the atomic edits exchanged between replicas.
//!
//! Positions and lengths count `char`s (Unicode scalar values), never bytes,
//! so that every site agrees on offsets regardless of encoding.
//!
//! ```text
//! Insert { position, text }   splice `text` before char `position`
//! Delete { position, text }   remove `text` starting at char `position`
//! Split  { first, second }    apply `first`, then `second` (relative to
//!                             the document after `first`)
//! NoOp                        nothing
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single atomic edit of a text document.
///
/// `Delete` keeps the removed text so it can be transformed, inverted and
/// checked against the replica when applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert {
        position: usize,
        text: String,
    },
    Delete {
        position: usize,
        text: String,
    },
    Split {
        first: Box<Operation>,
        second: Box<Operation>,
    },
    NoOp,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        Self::Delete {
            position,
            text: text.into(),
        }
    }

    /// Combine two operations into one atomic unit.
    ///
    /// Collapses to the other half when one side does nothing, so transformed
    /// splits never carry dead components.
    pub fn split(first: Operation, second: Operation) -> Self {
        match (first.is_noop(), second.is_noop()) {
            (true, true) => Self::NoOp,
            (true, false) => second,
            (false, true) => first,
            (false, false) => Self::Split {
                first: Box::new(first),
                second: Box::new(second),
            },
        }
    }

    /// Whether applying this operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::NoOp => true,
            Self::Insert { text, .. } | Self::Delete { text, .. } => text.is_empty(),
            Self::Split { first, second } => first.is_noop() && second.is_noop(),
        }
    }

    /// Net change in document length (in chars) caused by this operation.
    pub fn length_delta(&self) -> isize {
        match self {
            Self::NoOp => 0,
            Self::Insert { text, .. } => char_len(text) as isize,
            Self::Delete { text, .. } => -(char_len(text) as isize),
            Self::Split { first, second } => first.length_delta() + second.length_delta(),
        }
    }

    /// The operation that undoes this one when applied right after it.
    pub fn invert(&self) -> Self {
        match self {
            Self::NoOp => Self::NoOp,
            Self::Insert { position, text } => Self::delete(*position, text.clone()),
            Self::Delete { position, text } => Self::insert(*position, text.clone()),
            // Undo the second half first: it was applied last.
            Self::Split { first, second } => Self::Split {
                first: Box::new(second.invert()),
                second: Box::new(first.invert()),
            },
        }
    }

    /// Flatten into primitive inserts and deletes, in application order.
    ///
    /// Editor adapters apply these one after the other; `NoOp`s are dropped.
    pub fn components(&self) -> Vec<Operation> {
        let mut out = Vec::new();
        self.collect_components(&mut out);
        out
    }

    fn collect_components(&self, out: &mut Vec<Operation>) {
        match self {
            Self::Split { first, second } => {
                first.collect_components(out);
                second.collect_components(out);
            }
            op if op.is_noop() => {}
            op => out.push(op.clone()),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert { position, text } => write!(f, "Insert({position}, {text:?})"),
            Self::Delete { position, text } => write!(f, "Delete({position}, {text:?})"),
            Self::Split { first, second } => write!(f, "Split({first}, {second})"),
            Self::NoOp => write!(f, "NoOp"),
        }
    }
}

/// Length of `text` in chars.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// The chars of `text` in `[start, end)`; bounds past the end are cut short.
pub(crate) fn slice_chars(text: &str, start: usize, end: usize) -> String {
    if end <= start {
        return String::new();
    }
    text.chars().skip(start).take(end - start).collect()
}
