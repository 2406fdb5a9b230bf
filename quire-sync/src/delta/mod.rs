//! Operation codec: deltas over a linear rich-text document.
//!
//! A [`Delta`] is an ordered list of [`Op`]s applied left to right against a
//! cursor into the target content:
//!
//! ```text
//!   document:  h e l l o
//!   delta:     [ Retain(5) | Insert(" world") ]
//!   result:    h e l l o ␠ w o r l d
//! ```
//!
//! A document is itself a delta made only of inserts. Lengths count Unicode
//! scalar values.
//!
//! The algebra:
//! - `a.compose(&b)`: one delta with the effect of `a` then `b`
//! - `a.transform(&b, priority)`: `b` rewritten to apply after `a`
//! - [`transform`]`(a, b) -> (a', b')` with `b ∘ a' == a ∘ b'`
//! - `a.invert(&base)`: the delta that undoes `a` on `base`

pub mod attributes;
mod iter;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use attributes::{attrs, AttrValue, AttributeMap};
use iter::{OpIter, OpKind};

/// Codec failures. All are caused by the submitted operation, never by
/// the stored document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("operation spans {base_len} characters but the document has {document_len}")]
    OutOfRange { base_len: usize, document_len: usize },
    #[error("base is not a document (contains retain or delete operations)")]
    NotADocument,
    #[error("operation lengths overflow")]
    Overflow,
}

/// A single delta primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Insert {
        text: String,
        attributes: AttributeMap,
    },
    Retain {
        count: usize,
        attributes: AttributeMap,
    },
    Delete(usize),
}

impl Op {
    pub fn insert(text: impl Into<String>) -> Self {
        Op::Insert {
            text: text.into(),
            attributes: AttributeMap::new(),
        }
    }

    pub fn retain(count: usize) -> Self {
        Op::Retain {
            count,
            attributes: AttributeMap::new(),
        }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        match self {
            Op::Insert { text, .. } => text.chars().count(),
            Op::Retain { count, .. } => *count,
            Op::Delete(count) => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Op::Insert { text, .. } => text.is_empty(),
            Op::Retain { count, .. } | Op::Delete(count) => *count == 0,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Op::Insert { .. })
    }

    pub fn is_retain(&self) -> bool {
        matches!(self, Op::Retain { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete(_))
    }

    /// Attributes of an insert or retain; empty for deletes.
    pub fn attributes(&self) -> &AttributeMap {
        static EMPTY: AttributeMap = AttributeMap::new();
        match self {
            Op::Insert { attributes, .. } | Op::Retain { attributes, .. } => attributes,
            Op::Delete(_) => &EMPTY,
        }
    }
}

/// An edit operation, or (when it holds only inserts) a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    ops: Vec<Op>,
}

impl Delta {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Build a delta from raw ops, normalising as they are pushed.
    pub fn from_ops(ops: impl IntoIterator<Item = Op>) -> Self {
        let mut delta = Self::new();
        for op in ops {
            delta.push(op);
        }
        delta
    }

    /// A plain-text document.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new().insert(text)
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn insert(self, text: impl Into<String>) -> Self {
        self.insert_with(text, AttributeMap::new())
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: AttributeMap) -> Self {
        self.push(Op::Insert {
            text: text.into(),
            attributes,
        });
        self
    }

    pub fn retain(self, count: usize) -> Self {
        self.retain_with(count, AttributeMap::new())
    }

    pub fn retain_with(mut self, count: usize, attributes: AttributeMap) -> Self {
        self.push(Op::Retain { count, attributes });
        self
    }

    pub fn delete(mut self, count: usize) -> Self {
        self.push(Op::Delete(count));
        self
    }

    /// Append an op, keeping the delta canonical: zero-length ops vanish,
    /// neighbours of the same kind and attributes merge, and an insert
    /// directly after a delete is moved in front of it.
    pub fn push(&mut self, op: Op) -> &mut Self {
        if op.is_empty() {
            return self;
        }

        // counts saturate; a saturated delta never fits a document
        if let (Some(Op::Delete(last)), Op::Delete(count)) = (self.ops.last_mut(), &op) {
            *last = last.saturating_add(*count);
            return self;
        }

        let mut index = self.ops.len();
        if op.is_insert() && matches!(self.ops.last(), Some(Op::Delete(_))) {
            index -= 1;
            if index == 0 {
                self.ops.insert(0, op);
                return self;
            }
        }

        if index > 0 {
            match (&mut self.ops[index - 1], &op) {
                (
                    Op::Insert { text, attributes },
                    Op::Insert {
                        text: more,
                        attributes: other,
                    },
                ) if attributes == other => {
                    text.push_str(more);
                    return self;
                }
                (
                    Op::Retain { count, attributes },
                    Op::Retain {
                        count: more,
                        attributes: other,
                    },
                ) if attributes == other => {
                    *count = count.saturating_add(*more);
                    return self;
                }
                _ => {}
            }
        }

        self.ops.insert(index, op);
        self
    }

    /// Drop a trailing attribute-less retain; it is implied.
    pub fn chop(&mut self) -> &mut Self {
        if let Some(Op::Retain { attributes, .. }) = self.ops.last() {
            if attributes.is_empty() {
                self.ops.pop();
            }
        }
        self
    }

    /// Canonical form of a delta.
    pub fn normalized(&self) -> Delta {
        let mut delta = Delta::from_ops(self.ops.iter().cloned());
        delta.chop();
        delta
    }

    /// Canonical form of a delta received from an untrusted peer. Fails
    /// when its op lengths do not add up within `usize`.
    pub fn try_normalized(&self) -> Result<Delta, CodecError> {
        self.ops
            .iter()
            .try_fold(0usize, |total, op| total.checked_add(op.len()))
            .ok_or(CodecError::Overflow)?;
        Ok(self.normalized())
    }

    /// Sum of all op lengths. For a document, its length in characters.
    pub fn len(&self) -> usize {
        sum_lengths(self.ops.iter())
    }

    /// Characters of the base document this delta walks over.
    pub fn base_len(&self) -> usize {
        sum_lengths(self.ops.iter().filter(|op| !op.is_insert()))
    }

    /// Characters produced by this delta (excluding the implicit tail).
    pub fn target_len(&self) -> usize {
        sum_lengths(self.ops.iter().filter(|op| !op.is_delete()))
    }

    /// True when the delta holds only inserts.
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(Op::is_insert)
    }

    /// Concatenated text of all inserts.
    pub fn to_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Insert { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Apply this operation to a document.
    pub fn apply(&self, document: &Delta) -> Result<Delta, CodecError> {
        if !document.is_document() {
            return Err(CodecError::NotADocument);
        }
        let document_len = document.len();
        let base_len = self.base_len();
        if base_len > document_len {
            return Err(CodecError::OutOfRange {
                base_len,
                document_len,
            });
        }
        Ok(document.compose(self))
    }

    /// The delta equivalent to applying `self` and then `other`.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this = OpIter::new(&self.ops);
        let mut that = OpIter::new(&other.ops);
        let mut delta = Delta::new();

        while this.has_next() || that.has_next() {
            if that.peek_kind() == OpKind::Insert {
                delta.push(that.next_op());
            } else if this.peek_kind() == OpKind::Delete {
                delta.push(this.next_op());
            } else {
                let length = this.peek_len().min(that.peek_len());
                let this_op = this.next_len(length);
                let that_op = that.next_len(length);
                match (this_op, that_op) {
                    (Op::Retain { attributes: a, .. }, Op::Retain { attributes: b, .. }) => {
                        delta.push(Op::Retain {
                            count: length,
                            attributes: attributes::compose(&a, &b, true),
                        });
                    }
                    (Op::Insert { text, attributes: a }, Op::Retain { attributes: b, .. }) => {
                        delta.push(Op::Insert {
                            text,
                            attributes: attributes::compose(&a, &b, false),
                        });
                    }
                    (Op::Retain { .. }, Op::Delete(count)) => {
                        delta.push(Op::Delete(count));
                    }
                    // an insert deleted by the next op cancels out
                    _ => {}
                }
            }
        }

        delta.chop();
        delta
    }

    /// Rewrite `other` so it applies after `self`, both authored against
    /// the same base. With `priority`, `self` wins insert ties.
    pub fn transform(&self, other: &Delta, priority: bool) -> Delta {
        let mut this = OpIter::new(&self.ops);
        let mut that = OpIter::new(&other.ops);
        let mut delta = Delta::new();

        while this.has_next() || that.has_next() {
            if this.peek_kind() == OpKind::Insert
                && (priority || that.peek_kind() != OpKind::Insert)
            {
                let skipped = this.next_op().len();
                delta.push(Op::retain(skipped));
            } else if that.peek_kind() == OpKind::Insert {
                delta.push(that.next_op());
            } else {
                let length = this.peek_len().min(that.peek_len());
                let this_op = this.next_len(length);
                let that_op = that.next_len(length);
                match (this_op, that_op) {
                    // already deleted on our side
                    (Op::Delete(_), _) => {}
                    (_, Op::Delete(count)) => {
                        delta.push(Op::Delete(count));
                    }
                    (this_op, that_op) => {
                        delta.push(Op::Retain {
                            count: length,
                            attributes: attributes::transform(
                                this_op.attributes(),
                                that_op.attributes(),
                                priority,
                            ),
                        });
                    }
                }
            }
        }

        delta.chop();
        delta
    }

    /// The delta that reverts `self` when `self` was applied to `base`.
    pub fn invert(&self, base: &Delta) -> Delta {
        let mut inverted = Delta::new();
        let mut base_index = 0;

        for op in &self.ops {
            match op {
                Op::Insert { .. } => {
                    inverted.push(Op::Delete(op.len()));
                }
                Op::Retain { count, attributes } if attributes.is_empty() => {
                    inverted.push(Op::retain(*count));
                    base_index = base_index.saturating_add(*count);
                }
                Op::Delete(count) => {
                    let end = base_index.saturating_add(*count);
                    for base_op in base.slice(base_index, end).ops {
                        inverted.push(base_op);
                    }
                    base_index = end;
                }
                Op::Retain { count, attributes } => {
                    let end = base_index.saturating_add(*count);
                    for base_op in &base.slice(base_index, end).ops {
                        inverted.push(Op::Retain {
                            count: base_op.len(),
                            attributes: attributes::invert(attributes, base_op.attributes()),
                        });
                    }
                    base_index = end;
                }
            }
        }

        inverted.chop();
        inverted
    }

    /// Ops covering the character range `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Delta {
        let mut out = Delta::new();
        let mut iter = OpIter::new(&self.ops);
        let mut index = 0;

        while index < end && iter.has_next() {
            if index < start {
                index += iter.next_len(start - index).len();
            } else {
                let op = iter.next_len(end - index);
                index += op.len();
                out.push(op);
            }
        }

        out
    }
}

fn sum_lengths<'a>(ops: impl Iterator<Item = &'a Op>) -> usize {
    ops.map(Op::len).fold(0, usize::saturating_add)
}

/// Transform two concurrent deltas against each other.
///
/// Returns `(a', b')` such that `b` then `a'` equals `a` then `b'`. On
/// insert ties `a`'s text is placed first.
pub fn transform(a: &Delta, b: &Delta) -> (Delta, Delta) {
    (b.transform(a, false), a.transform(b, true))
}
